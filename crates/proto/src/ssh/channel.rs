//! SSH channel multiplexing.
//!
//! Every open channel has a slot in the session's [`ChannelTable`], keyed by
//! our local channel id. The reader task feeds inbound channel messages into
//! the table; callers hold an [`SshChannel`] handle.
//!
//! # Flow control
//!
//! - The send window is consumed before each data frame goes out. When it
//!   reaches zero, [`ChannelWriter::send`] waits until the peer grants more.
//! - The receive window is replenished as the caller consumes data, once
//!   half of the initial window has been read.
//!
//! # Closing
//!
//! Close is two-phase. The id stays allocated until the peer's close
//! arrives, and is then released for reuse.

use crate::ssh::connection::{ChannelMessage, ChannelOpenFailureReason, ChannelRequestType, ChannelType};
use crate::ssh::connection_mgr::SshConnection;
use skerry_platform::{SkerryError, SkerryResult};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, trace, warn};

/// Default initial receive window (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum packet size we accept (32 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Largest data chunk we put in one frame.
const MAX_DATA_CHUNK: u32 = 32 * 1024;

/// SSH Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is opening
    Opening,
    /// Channel is open and ready
    Open,
    /// We sent CLOSE and are waiting for the peer's
    Closing,
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Data received on this channel
    Data(Vec<u8>),
    /// Extended data (stderr)
    ExtendedData {
        /// Data type code
        data_type: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// The peer will send no more data
    Eof,
    /// Remote command exit status
    ExitStatus(u32),
    /// Remote command killed by a signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
    /// The peer closed the channel
    Close,
}

/// Per-channel bookkeeping shared by the reader task and the handles.
pub(crate) struct ChannelSlot {
    state: ChannelState,
    remote_id: u32,
    send_window: u32,
    remote_max_packet: u32,
    recv_window: u32,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    events: mpsc::UnboundedSender<ChannelEvent>,
    window: Arc<Notify>,
    opened: Option<oneshot::Sender<SkerryResult<()>>>,
    requests: VecDeque<oneshot::Sender<bool>>,
}

impl ChannelSlot {
    fn deliver(&self, event: ChannelEvent) {
        // A dropped handle just discards what arrives.
        let _ = self.events.send(event);
    }
}

/// Receiving ends handed out when a channel id is allocated.
pub(crate) struct Allocation {
    pub(crate) local_id: u32,
    pub(crate) events: mpsc::UnboundedReceiver<ChannelEvent>,
    pub(crate) opened: oneshot::Receiver<SkerryResult<()>>,
    pub(crate) window: Arc<Notify>,
}

/// Local-to-remote channel id table.
#[derive(Default)]
pub(crate) struct ChannelTable {
    slots: BTreeMap<u32, ChannelSlot>,
}

impl ChannelTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserves the lowest free local id for a channel about to be opened.
    pub(crate) fn allocate(&mut self, initial_window: u32) -> Allocation {
        let mut local_id = 0u32;
        for id in self.slots.keys() {
            if *id != local_id {
                break;
            }
            local_id += 1;
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let (opened_tx, opened) = oneshot::channel();
        let window = Arc::new(Notify::new());
        self.slots.insert(
            local_id,
            ChannelSlot {
                state: ChannelState::Opening,
                remote_id: 0,
                send_window: 0,
                remote_max_packet: 0,
                recv_window: initial_window,
                eof_sent: false,
                eof_received: false,
                close_sent: false,
                events: events_tx,
                window: window.clone(),
                opened: Some(opened_tx),
                requests: VecDeque::new(),
            },
        );
        Allocation {
            local_id,
            events,
            opened,
            window,
        }
    }

    pub(crate) fn get_mut(&mut self, local_id: u32) -> Option<&mut ChannelSlot> {
        self.slots.get_mut(&local_id)
    }

    pub(crate) fn release(&mut self, local_id: u32) {
        if let Some(slot) = self.slots.remove(&local_id) {
            slot.window.notify_waiters();
            debug!("Released channel {}", local_id);
        }
    }

    /// Number of allocated channels.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Drops every channel after the session has ended.
    ///
    /// Pending opens and requests see their senders dropped; blocked
    /// senders are woken.
    pub(crate) fn fail_all(&mut self) {
        for (_, slot) in std::mem::take(&mut self.slots) {
            slot.window.notify_waiters();
        }
    }

    /// Applies one inbound channel message.
    ///
    /// Returns a reply to send back, if the message calls for one.
    ///
    /// # Errors
    ///
    /// [`SkerryError::ProtocolViolation`] if the message names an unknown
    /// channel or breaks flow control.
    pub(crate) fn handle(&mut self, message: ChannelMessage) -> SkerryResult<Option<ChannelMessage>> {
        if let ChannelMessage::Open {
            sender_channel,
            channel_type,
            ..
        } = &message
        {
            debug!("Refusing server-initiated {} channel", channel_type.name());
            return Ok(Some(ChannelMessage::OpenFailure {
                recipient_channel: *sender_channel,
                reason_code: ChannelOpenFailureReason::AdministrativelyProhibited as u32,
                description: "Channel open not supported".to_string(),
            }));
        }

        let local_id = message.recipient().ok_or_else(|| {
            SkerryError::ProtocolViolation("Channel message without recipient".to_string())
        })?;
        let slot = self.slots.get_mut(&local_id).ok_or_else(|| {
            SkerryError::ProtocolViolation(format!("Message for unknown channel {}", local_id))
        })?;

        let opening = slot.state == ChannelState::Opening;
        let expects_open_reply = matches!(
            message,
            ChannelMessage::OpenConfirmation { .. } | ChannelMessage::OpenFailure { .. }
        );
        if opening != expects_open_reply {
            return Err(SkerryError::ProtocolViolation(format!(
                "Unexpected message for channel {} in state {:?}",
                local_id, slot.state
            )));
        }

        match message {
            ChannelMessage::OpenConfirmation {
                sender_channel,
                initial_window_size,
                maximum_packet_size,
                ..
            } => {
                if maximum_packet_size == 0 {
                    return Err(SkerryError::ProtocolViolation(
                        "Peer maximum packet size is zero".to_string(),
                    ));
                }
                slot.state = ChannelState::Open;
                slot.remote_id = sender_channel;
                slot.send_window = initial_window_size;
                slot.remote_max_packet = maximum_packet_size;
                debug!(
                    "Channel {} open (remote {}, window {}, max packet {})",
                    local_id, sender_channel, initial_window_size, maximum_packet_size
                );
                if let Some(opened) = slot.opened.take() {
                    let _ = opened.send(Ok(()));
                }
                Ok(None)
            }
            ChannelMessage::OpenFailure {
                reason_code,
                description,
                ..
            } => {
                let reason = ChannelOpenFailureReason::from_u32(reason_code)
                    .map(|r| r.as_str())
                    .unwrap_or("unknown reason");
                debug!("Channel {} open refused: {} ({})", local_id, description, reason);
                if let Some(mut slot) = self.slots.remove(&local_id) {
                    if let Some(opened) = slot.opened.take() {
                        let _ = opened.send(Err(SkerryError::ChannelOpenFailed {
                            reason_code,
                            description,
                        }));
                    }
                }
                Ok(None)
            }
            ChannelMessage::WindowAdjust { bytes_to_add, .. } => {
                slot.send_window = slot.send_window.checked_add(bytes_to_add).ok_or_else(|| {
                    SkerryError::ProtocolViolation(format!(
                        "Window overflow on channel {}",
                        local_id
                    ))
                })?;
                trace!("Channel {} send window now {}", local_id, slot.send_window);
                slot.window.notify_waiters();
                Ok(None)
            }
            ChannelMessage::Data { data, .. } => {
                Self::consume_window(local_id, slot, data.len())?;
                slot.deliver(ChannelEvent::Data(data));
                Ok(None)
            }
            ChannelMessage::ExtendedData {
                data_type, data, ..
            } => {
                Self::consume_window(local_id, slot, data.len())?;
                slot.deliver(ChannelEvent::ExtendedData { data_type, data });
                Ok(None)
            }
            ChannelMessage::Eof { .. } => {
                slot.eof_received = true;
                slot.deliver(ChannelEvent::Eof);
                Ok(None)
            }
            ChannelMessage::Close { .. } => {
                let reply = if slot.close_sent {
                    None
                } else {
                    slot.close_sent = true;
                    Some(ChannelMessage::Close {
                        recipient_channel: slot.remote_id,
                    })
                };
                slot.deliver(ChannelEvent::Close);
                self.release(local_id);
                Ok(reply)
            }
            ChannelMessage::Request {
                request,
                want_reply,
                ..
            } => {
                match request {
                    ChannelRequestType::ExitStatus { exit_status } => {
                        slot.deliver(ChannelEvent::ExitStatus(exit_status));
                    }
                    ChannelRequestType::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                    } => {
                        slot.deliver(ChannelEvent::ExitSignal {
                            signal_name,
                            core_dumped,
                            error_message,
                        });
                    }
                    other => debug!("Ignoring {} request on channel {}", other.name(), local_id),
                }
                Ok(want_reply.then(|| ChannelMessage::Failure {
                    recipient_channel: slot.remote_id,
                }))
            }
            ChannelMessage::Success { .. } => {
                Self::request_reply(local_id, slot, true);
                Ok(None)
            }
            ChannelMessage::Failure { .. } => {
                Self::request_reply(local_id, slot, false);
                Ok(None)
            }
            ChannelMessage::Open { .. } => Ok(None),
        }
    }

    fn request_reply(local_id: u32, slot: &mut ChannelSlot, success: bool) {
        match slot.requests.pop_front() {
            Some(reply) => {
                let _ = reply.send(success);
            }
            None => warn!("Unsolicited request reply on channel {}", local_id),
        }
    }

    fn consume_window(local_id: u32, slot: &mut ChannelSlot, len: usize) -> SkerryResult<()> {
        if slot.eof_received {
            return Err(SkerryError::ProtocolViolation(format!(
                "Data after EOF on channel {}",
                local_id
            )));
        }
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        if len > slot.recv_window {
            return Err(SkerryError::ProtocolViolation(format!(
                "Peer exceeded the receive window on channel {} ({} > {})",
                local_id, len, slot.recv_window
            )));
        }
        slot.recv_window -= len;
        Ok(())
    }
}

/// Sending half of a channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelWriter {
    local_id: u32,
    connection: Arc<SshConnection>,
    window: Arc<Notify>,
    send_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("local_id", &self.local_id)
            .finish()
    }
}

impl ChannelWriter {
    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    fn gone(&self) -> SkerryError {
        self.connection
            .closed_error()
            .unwrap_or(SkerryError::ChannelClosed {
                channel: self.local_id,
            })
    }

    async fn with_slot<T>(
        &self,
        f: impl FnOnce(&mut ChannelSlot) -> SkerryResult<T>,
    ) -> SkerryResult<T> {
        let mut table = self.connection.channels().lock().await;
        match table.get_mut(self.local_id) {
            Some(slot) => f(slot),
            None => Err(self.gone()),
        }
    }

    /// Sends data, splitting it to fit the peer's window and packet size.
    ///
    /// Waits whenever the send window is exhausted. Bytes from one call
    /// are never interleaved with another call's on the same channel.
    pub async fn send(&self, data: &[u8]) -> SkerryResult<()> {
        let _ordered = self.send_lock.lock().await;
        let mut offset = 0;

        while offset < data.len() {
            let notified = self.window.notified();
            let channel = self.local_id;
            let remaining = data.len() - offset;
            let (remote_id, len) = self
                .with_slot(|slot| {
                    if slot.eof_sent || slot.close_sent {
                        return Err(SkerryError::ChannelClosed { channel });
                    }
                    let len = slot
                        .send_window
                        .min(slot.remote_max_packet)
                        .min(MAX_DATA_CHUNK) as usize;
                    let len = len.min(remaining);
                    slot.send_window -= len as u32;
                    Ok((slot.remote_id, len))
                })
                .await?;

            if len == 0 {
                trace!("Channel {} waiting for window", self.local_id);
                notified.await;
                continue;
            }

            let message = ChannelMessage::Data {
                recipient_channel: remote_id,
                data: data[offset..offset + len].to_vec(),
            };
            self.connection.send_packet(&message.to_bytes()).await?;
            offset += len;
        }
        Ok(())
    }

    /// Signals that we will send no more data.
    pub async fn eof(&self) -> SkerryResult<()> {
        let _ordered = self.send_lock.lock().await;
        let channel = self.local_id;
        let remote_id = self
            .with_slot(|slot| {
                if slot.close_sent {
                    return Err(SkerryError::ChannelClosed { channel });
                }
                slot.eof_sent = true;
                Ok(slot.remote_id)
            })
            .await?;
        self.connection
            .send_packet(
                &ChannelMessage::Eof {
                    recipient_channel: remote_id,
                }
                .to_bytes(),
            )
            .await
    }

    /// Sends a channel request and waits for the peer's answer.
    ///
    /// # Errors
    ///
    /// [`SkerryError::RequestRejected`] if the peer answers with failure.
    pub async fn request(&self, request: ChannelRequestType) -> SkerryResult<()> {
        let name = request.name().to_string();
        let reply = {
            let _ordered = self.send_lock.lock().await;
            let channel = self.local_id;
            let (reply, remote_id) = self
                .with_slot(|slot| {
                    if slot.close_sent {
                        return Err(SkerryError::ChannelClosed { channel });
                    }
                    let (tx, rx) = oneshot::channel();
                    slot.requests.push_back(tx);
                    Ok((rx, slot.remote_id))
                })
                .await?;
            let message = ChannelMessage::Request {
                recipient_channel: remote_id,
                request,
                want_reply: true,
            };
            self.connection.send_packet(&message.to_bytes()).await?;
            reply
        };

        match reply.await {
            Ok(true) => {
                debug!("Channel {} {} request accepted", self.local_id, name);
                Ok(())
            }
            Ok(false) => Err(SkerryError::RequestRejected(name)),
            Err(_) => Err(self.gone()),
        }
    }

    /// Sends our CLOSE unless it was already sent.
    ///
    /// Does nothing if the peer has already closed the channel.
    pub async fn close(&self) -> SkerryResult<()> {
        let remote_id = {
            let mut table = self.connection.channels().lock().await;
            match table.get_mut(self.local_id) {
                Some(slot) if !slot.close_sent => {
                    slot.close_sent = true;
                    slot.state = ChannelState::Closing;
                    slot.remote_id
                }
                _ => return Ok(()),
            }
        };
        debug!("Closing channel {}", self.local_id);
        self.connection
            .send_packet(
                &ChannelMessage::Close {
                    recipient_channel: remote_id,
                }
                .to_bytes(),
            )
            .await
    }
}

/// Receiving half of a channel.
pub struct ChannelReader {
    local_id: u32,
    connection: Arc<SshConnection>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    initial_window: u32,
    consumed: u32,
}

impl std::fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReader")
            .field("local_id", &self.local_id)
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl ChannelReader {
    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Waits for the next event.
    ///
    /// Returns `Ok(None)` once the channel is closed and drained.
    ///
    /// # Errors
    ///
    /// [`SkerryError::SessionClosed`] if the session ended underneath.
    pub async fn recv(&mut self) -> SkerryResult<Option<ChannelEvent>> {
        let event = match self.events.recv().await {
            Some(event) => event,
            None => {
                return match self.connection.closed_error() {
                    Some(err) => Err(err),
                    None => Ok(None),
                }
            }
        };

        if let ChannelEvent::Data(data) | ChannelEvent::ExtendedData { data, .. } = &event {
            self.replenish(data.len()).await?;
        }
        Ok(Some(event))
    }

    /// Waits for the next chunk of stdout data, skipping other events.
    ///
    /// Returns `Ok(None)` at EOF or close.
    pub async fn read(&mut self) -> SkerryResult<Option<Vec<u8>>> {
        loop {
            match self.recv().await? {
                Some(ChannelEvent::Data(data)) => return Ok(Some(data)),
                Some(ChannelEvent::Eof) | Some(ChannelEvent::Close) | None => return Ok(None),
                Some(_) => continue,
            }
        }
    }

    async fn replenish(&mut self, len: usize) -> SkerryResult<()> {
        self.consumed = self
            .consumed
            .saturating_add(u32::try_from(len).unwrap_or(u32::MAX));
        if self.consumed < self.initial_window / 2 {
            return Ok(());
        }

        let bytes_to_add = std::mem::take(&mut self.consumed);
        let remote_id = {
            let mut table = self.connection.channels().lock().await;
            match table.get_mut(self.local_id) {
                Some(slot) if !slot.close_sent && !slot.eof_received => {
                    slot.recv_window = slot.recv_window.saturating_add(bytes_to_add);
                    slot.remote_id
                }
                _ => return Ok(()),
            }
        };
        trace!("Channel {} granting {} bytes", self.local_id, bytes_to_add);
        self.connection
            .send_packet(
                &ChannelMessage::WindowAdjust {
                    recipient_channel: remote_id,
                    bytes_to_add,
                }
                .to_bytes(),
            )
            .await
    }

    /// Waits until the peer's CLOSE, discarding anything still queued.
    async fn drain(&mut self) {
        while let Some(event) = self.events.recv().await {
            if event == ChannelEvent::Close {
                break;
            }
        }
    }
}

/// An SSH channel for data transfer.
///
/// Channels are multiplexed over one connection. Use
/// [`into_split`](Self::into_split) to read and write from different tasks.
#[derive(Debug)]
pub struct SshChannel {
    writer: ChannelWriter,
    reader: ChannelReader,
}

impl SshChannel {
    /// Opens a channel and waits for the peer's confirmation.
    ///
    /// # Errors
    ///
    /// - [`SkerryError::ChannelOpenFailed`] if the peer refuses; the
    ///   session stays usable
    /// - [`SkerryError::SessionClosed`] if the session ends first
    pub async fn open(
        connection: Arc<SshConnection>,
        channel_type: ChannelType,
        initial_window: u32,
        max_packet_size: u32,
    ) -> SkerryResult<Self> {
        let allocation = {
            let mut table = connection.channels().lock().await;
            if let Some(err) = connection.closed_error() {
                return Err(err);
            }
            table.allocate(initial_window)
        };
        let local_id = allocation.local_id;

        let open = ChannelMessage::Open {
            channel_type,
            sender_channel: local_id,
            initial_window_size: initial_window,
            maximum_packet_size: max_packet_size,
        };
        if let Err(err) = connection.send_packet(&open.to_bytes()).await {
            connection.channels().lock().await.release(local_id);
            return Err(err);
        }

        match allocation.opened.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(connection
                    .closed_error()
                    .unwrap_or(SkerryError::ChannelClosed { channel: local_id }))
            }
        }

        Ok(Self {
            writer: ChannelWriter {
                local_id,
                connection: connection.clone(),
                window: allocation.window,
                send_lock: Arc::new(Mutex::new(())),
            },
            reader: ChannelReader {
                local_id,
                connection,
                events: allocation.events,
                initial_window,
                consumed: 0,
            },
        })
    }

    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.writer.local_id
    }

    /// Splits into independently usable halves.
    pub fn into_split(self) -> (ChannelWriter, ChannelReader) {
        (self.writer, self.reader)
    }

    /// Returns the sending half.
    pub fn writer(&self) -> &ChannelWriter {
        &self.writer
    }

    /// Sends data. See [`ChannelWriter::send`].
    pub async fn send(&self, data: &[u8]) -> SkerryResult<()> {
        self.writer.send(data).await
    }

    /// Receives the next event. See [`ChannelReader::recv`].
    pub async fn recv(&mut self) -> SkerryResult<Option<ChannelEvent>> {
        self.reader.recv().await
    }

    /// Receives the next chunk of stdout data. See [`ChannelReader::read`].
    pub async fn read(&mut self) -> SkerryResult<Option<Vec<u8>>> {
        self.reader.read().await
    }

    /// Sends EOF.
    pub async fn eof(&self) -> SkerryResult<()> {
        self.writer.eof().await
    }

    /// Runs a command on a session channel.
    pub async fn exec(&self, command: &str) -> SkerryResult<()> {
        self.writer
            .request(ChannelRequestType::Exec {
                command: command.to_string(),
            })
            .await
    }

    /// Starts the user's shell.
    pub async fn shell(&self) -> SkerryResult<()> {
        self.writer.request(ChannelRequestType::Shell).await
    }

    /// Starts a subsystem such as "sftp".
    pub async fn request_subsystem(&self, name: &str) -> SkerryResult<()> {
        self.writer
            .request(ChannelRequestType::Subsystem {
                name: name.to_string(),
            })
            .await
    }

    /// Sets an environment variable for a later exec or shell.
    pub async fn set_env(&self, name: &str, value: &str) -> SkerryResult<()> {
        self.writer
            .request(ChannelRequestType::Env {
                name: name.to_string(),
                value: value.to_string(),
            })
            .await
    }

    /// Closes the channel and waits for the peer to confirm.
    ///
    /// Anything still queued for reading is discarded.
    pub async fn close(mut self) -> SkerryResult<()> {
        self.writer.close().await?;
        self.reader.drain().await;
        match self.writer.connection.closed_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
