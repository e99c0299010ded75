//! SSH Connection Manager.
//!
//! [`SshConnection`] is the state one session shares between the reader
//! task and every caller:
//!
//! - The outbound half of the stream, the [`Sealer`] and the [`Negotiator`],
//!   behind one lock so frames are encoded and written one at a time
//! - The channel table
//! - Key exchange gating: while a key exchange is in flight, application
//!   frames wait and reader-originated replies are deferred
//! - The closed reason, once the session has ended

use crate::ssh::channel::ChannelTable;
use crate::ssh::crypto::CryptoProvider;
use crate::ssh::kex::{DirectionKeys, KexOutcome, Negotiated, Negotiator, NegotiatorState, NewKeys};
use crate::ssh::message::{disconnect_reason, Disconnect};
use crate::ssh::packet::Sealer;
use crate::ssh::session::{event_channel, SessionEvent};
use crate::ssh::transport::RekeyPolicy;
use skerry_platform::{SkerryError, SkerryResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, trace, warn};

/// How long teardown waits for the writer before giving up on a clean close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound state, serialized behind one lock.
struct Writer {
    stream: Box<dyn AsyncWrite + Send + Unpin>,
    sealer: Sealer,
    negotiator: Negotiator,
    rekey: RekeyPolicy,
    /// Set from our KEXINIT until our NEWKEYS.
    kex_pending: bool,
    /// Reader-originated replies held back during key exchange.
    deferred: Vec<Vec<u8>>,
}

impl Writer {
    async fn write(&mut self, payload: &[u8]) -> SkerryResult<()> {
        let frame = self.sealer.encode(payload)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        self.rekey.add_bytes(frame.len() as u64);
        trace!("Sent message {} ({} bytes)", payload.first().copied().unwrap_or(0), frame.len());
        Ok(())
    }

    async fn start_kex(&mut self) -> SkerryResult<()> {
        let payload = self.negotiator.start()?;
        self.write(&payload).await?;
        self.kex_pending = true;
        Ok(())
    }

    async fn maybe_rekey(&mut self) -> SkerryResult<()> {
        if self.negotiator.state() == NegotiatorState::KeysDerived
            && !self.negotiator.in_progress()
            && self.rekey.needs_rekey(Instant::now())
        {
            info!("Re-key threshold reached ({} bytes)", self.rekey.bytes());
            self.start_kex().await?;
        }
        Ok(())
    }
}

/// Shared per-session state.
pub struct SshConnection {
    writer: Mutex<Writer>,
    channels: Mutex<ChannelTable>,
    provider: Arc<dyn CryptoProvider>,
    kex_done: Notify,
    closed: OnceLock<String>,
    authenticated: AtomicBool,
    /// Inbound bytes not yet folded into the writer's [`RekeyPolicy`].
    inbound_bytes: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("closed", &self.closed.get())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl SshConnection {
    /// Creates the shared state over the outbound half of a stream.
    pub(crate) fn new<W>(
        stream: W,
        negotiator: Negotiator,
        rekey: RekeyPolicy,
        provider: Arc<dyn CryptoProvider>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Writer {
                stream: Box::new(stream),
                sealer: Sealer::new(),
                negotiator,
                rekey,
                kex_pending: false,
                deferred: Vec::new(),
            }),
            channels: Mutex::new(ChannelTable::new()),
            provider,
            kex_done: Notify::new(),
            closed: OnceLock::new(),
            authenticated: AtomicBool::new(false),
            inbound_bytes: AtomicU64::new(0),
            events: event_channel(),
        }
    }

    /// The cryptographic provider in use.
    pub fn provider(&self) -> &dyn CryptoProvider {
        self.provider.as_ref()
    }

    pub(crate) fn channels(&self) -> &Mutex<ChannelTable> {
        &self.channels
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Returns the error every operation fails with once the session ended.
    pub fn closed_error(&self) -> Option<SkerryError> {
        self.closed.get().map(|reason| SkerryError::SessionClosed {
            reason: reason.clone(),
        })
    }

    /// Returns true once the session has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// Returns true once user authentication has succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// The session identifier, once the first key exchange is done.
    pub async fn session_id(&self) -> Option<Vec<u8>> {
        self.writer
            .lock()
            .await
            .negotiator
            .session_id()
            .map(<[u8]>::to_vec)
    }

    /// Algorithms of the current (or in-flight) key exchange.
    pub async fn negotiated(&self) -> Option<Negotiated> {
        self.writer.lock().await.negotiator.negotiated().cloned()
    }

    /// Sends an application message.
    ///
    /// Waits while a key exchange is in flight, so the message goes out
    /// under the new keys. May start a re-key once a threshold is crossed.
    ///
    /// # Errors
    ///
    /// [`SkerryError::SessionClosed`] once the session has ended.
    pub async fn send_packet(&self, payload: &[u8]) -> SkerryResult<()> {
        loop {
            let notified = self.kex_done.notified();
            if let Some(err) = self.closed_error() {
                return Err(err);
            }

            {
                let mut writer = self.writer.lock().await;
                if !writer.kex_pending {
                    let inbound = self.inbound_bytes.swap(0, Ordering::AcqRel);
                    writer.rekey.add_bytes(inbound);
                    let mut result = writer.write(payload).await;
                    if result.is_ok() {
                        result = writer.maybe_rekey().await;
                    }
                    drop(writer);
                    return match result {
                        Ok(()) => Ok(()),
                        Err(err) => Err(self.fail_write(err).await),
                    };
                }
            }

            trace!("Holding outbound message until key exchange completes");
            notified.await;
        }
    }

    /// Sends a reply from the reader task, or queues it until the key
    /// exchange in flight completes.
    pub(crate) async fn send_or_defer(&self, payload: Vec<u8>) -> SkerryResult<()> {
        let mut writer = self.writer.lock().await;
        if writer.kex_pending {
            trace!("Deferring message {} until NEWKEYS", payload.first().copied().unwrap_or(0));
            writer.deferred.push(payload);
            return Ok(());
        }
        writer.write(&payload).await
    }

    /// Sends our KEXINIT unless a key exchange is already in flight.
    pub(crate) async fn start_kex(&self) -> SkerryResult<()> {
        if let Some(err) = self.closed_error() {
            return Err(err);
        }
        let mut writer = self.writer.lock().await;
        if writer.negotiator.in_progress() {
            return Ok(());
        }
        writer.start_kex().await
    }

    /// Starts a key re-exchange now.
    ///
    /// Does nothing before the first exchange completes or while one is
    /// already in flight. Returns once our KEXINIT is sent; completion is
    /// reported as [`SessionEvent::Rekeyed`].
    pub async fn request_rekey(&self) -> SkerryResult<()> {
        if let Some(err) = self.closed_error() {
            return Err(err);
        }
        let mut writer = self.writer.lock().await;
        if writer.negotiator.state() != NegotiatorState::KeysDerived || writer.negotiator.in_progress() {
            return Ok(());
        }
        info!("Re-key requested");
        writer.start_kex().await
    }

    /// Counts inbound traffic toward the re-key thresholds.
    ///
    /// Never touches the writer lock, so the reader keeps draining while a
    /// write is stuck on backpressure. The count is checked against the
    /// thresholds on the next outbound message.
    pub(crate) fn note_inbound(&self, bytes: usize) {
        self.inbound_bytes.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    /// Handles the server's KEXINIT and sends our ephemeral key.
    ///
    /// Sends our own KEXINIT first if the server started the exchange.
    pub(crate) async fn receive_kexinit(&self, payload: &[u8]) -> SkerryResult<()> {
        let mut writer = self.writer.lock().await;
        if !writer.negotiator.in_progress() {
            debug!("Server initiated key exchange");
            writer.start_kex().await?;
        }
        writer.negotiator.receive_kexinit(payload, self.provider.as_ref())?;
        let init = writer.negotiator.exchange_init(self.provider.as_ref())?;
        writer.write(&init).await
    }

    /// Handles KEX_ECDH_REPLY. The host key is not trusted yet.
    pub(crate) async fn receive_reply(&self, payload: &[u8]) -> SkerryResult<KexOutcome> {
        let mut writer = self.writer.lock().await;
        writer.negotiator.receive_reply(payload, self.provider.as_ref())
    }

    /// Sends NEWKEYS, switches outbound keys and releases held messages.
    pub(crate) async fn send_newkeys(&self, keys: &DirectionKeys) -> SkerryResult<()> {
        {
            let mut writer = self.writer.lock().await;
            writer.write(&NewKeys::new().to_bytes()).await?;

            keys.install_sealer(&mut writer.sealer, self.provider.as_ref(), self.is_authenticated())?;
            writer.kex_pending = false;
            writer.rekey.reset(Instant::now());
            self.inbound_bytes.store(0, Ordering::Release);
            debug!("Outbound keys switched to {}", writer.sealer.cipher_name());

            for payload in std::mem::take(&mut writer.deferred) {
                writer.write(&payload).await?;
            }
        }
        self.kex_done.notify_waiters();
        Ok(())
    }

    /// Completes a key exchange once NEWKEYS went both ways.
    ///
    /// Returns the number of completed exchanges.
    pub(crate) async fn finish_kex(&self) -> u64 {
        let mut writer = self.writer.lock().await;
        writer.negotiator.finish();
        writer.negotiator.rounds()
    }

    /// Records successful authentication and starts delayed compression.
    pub(crate) async fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
        self.writer.lock().await.sealer.activate_compression();
    }

    /// Sends DISCONNECT, then tears the session down.
    pub(crate) async fn disconnect(&self, reason_code: u32, description: &str) {
        if self.is_closed() {
            return;
        }
        let payload = Disconnect::new(reason_code, description).to_bytes();
        let sent = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            writer.write(&payload).await
        })
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            debug!("DISCONNECT not delivered");
        }
        self.terminate(description.to_string()).await;
    }

    /// Tears the session down after a fatal error, telling the peer why
    /// when the wire is still usable.
    pub(crate) async fn abort(&self, err: &SkerryError) {
        let reason = match err {
            SkerryError::SessionClosed { reason } => reason.clone(),
            other => other.to_string(),
        };
        match disconnect_code(err) {
            Some(code) => self.disconnect(code, &reason).await,
            None => self.terminate(reason).await,
        }
    }

    /// Marks the session closed and fails everything waiting on it.
    ///
    /// The first reason wins.
    pub(crate) async fn terminate(&self, reason: String) {
        if self.closed.set(reason.clone()).is_err() {
            return;
        }
        warn!("Session closed: {}", reason);

        self.kex_done.notify_waiters();
        self.channels.lock().await.fail_all();
        self.emit(SessionEvent::Disconnected { reason });

        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            let _ = writer.stream.shutdown().await;
        })
        .await;
    }

    async fn fail_write(&self, err: SkerryError) -> SkerryError {
        if err.is_fatal() {
            self.terminate(err.to_string()).await;
            return err.into_session_closed();
        }
        err
    }
}

/// DISCONNECT reason code for a fatal error, if the wire is still usable.
fn disconnect_code(err: &SkerryError) -> Option<u32> {
    match err {
        SkerryError::Io(_) | SkerryError::SessionClosed { .. } => None,
        SkerryError::Integrity(_) => Some(disconnect_reason::MAC_ERROR),
        SkerryError::NegotiationFailure { .. } => Some(disconnect_reason::KEY_EXCHANGE_FAILED),
        SkerryError::UntrustedHost(_) => Some(disconnect_reason::HOST_KEY_NOT_VERIFIABLE),
        _ => Some(disconnect_reason::PROTOCOL_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::DefaultCryptoProvider;
    use crate::ssh::message::MessageType;
    use crate::ssh::packet::Opener;
    use crate::ssh::transport::Preferred;
    use tokio::io::DuplexStream;

    fn connection() -> (Arc<SshConnection>, DuplexStream) {
        let provider = Arc::new(DefaultCryptoProvider::new());
        let negotiator = Negotiator::new(
            Preferred::from_provider(provider.as_ref()),
            "SSH-2.0-client",
            "SSH-2.0-server",
        );
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let conn = SshConnection::new(
            local,
            negotiator,
            RekeyPolicy::new(u64::MAX, Duration::from_secs(3600)),
            provider,
        );
        (Arc::new(conn), remote)
    }

    #[tokio::test]
    async fn test_send_packet_writes_one_frame() {
        let (conn, mut remote) = connection();
        conn.send_packet(&crate::ssh::message::ignore(b"hi")).await.unwrap();

        let mut opener = Opener::new();
        let payload = opener.decode(&mut remote).await.unwrap();
        assert_eq!(payload[0], MessageType::Ignore as u8);
        assert_eq!(opener.sequence(), 1);
    }

    #[tokio::test]
    async fn test_application_messages_wait_for_key_exchange() {
        let (conn, mut remote) = connection();
        conn.start_kex().await.unwrap();
        conn.start_kex().await.unwrap();

        let mut opener = Opener::new();
        let kexinit = opener.decode(&mut remote).await.unwrap();
        assert_eq!(kexinit[0], MessageType::KexInit as u8);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            conn.send_packet(&crate::ssh::message::ignore(b"later")),
        )
        .await;
        assert!(blocked.is_err());

        conn.send_or_defer(crate::ssh::message::ignore(b"reply"))
            .await
            .unwrap();
        assert_eq!(conn.writer.lock().await.deferred.len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_fails_waiters() {
        let (conn, _remote) = connection();
        conn.start_kex().await.unwrap();
        let mut events = conn.subscribe();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send_packet(b"\x02\x00\x00\x00\x00").await })
        };
        tokio::task::yield_now().await;
        conn.terminate("peer went away".to_string()).await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, SkerryError::SessionClosed { ref reason } if reason == "peer went away"));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Disconnected {
                reason: "peer went away".to_string()
            }
        );
        assert!(conn.start_kex().await.is_err());

        conn.terminate("second".to_string()).await;
        assert!(matches!(
            conn.closed_error(),
            Some(SkerryError::SessionClosed { reason }) if reason == "peer went away"
        ));
    }

    #[tokio::test]
    async fn test_inbound_counting_does_not_take_writer_lock() {
        let (conn, mut remote) = connection();

        let held = conn.writer.lock().await;
        conn.note_inbound(1000);
        conn.note_inbound(24);
        drop(held);

        conn.send_packet(&crate::ssh::message::ignore(b"hi")).await.unwrap();
        let frame = Opener::new().decode(&mut remote).await.unwrap();
        assert_eq!(frame[0], MessageType::Ignore as u8);

        // Inbound bytes plus the one outbound frame.
        let counted = conn.writer.lock().await.rekey.bytes();
        assert!(counted > 1024, "counted {}", counted);
        assert_eq!(conn.inbound_bytes.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_disconnect_codes() {
        assert_eq!(
            disconnect_code(&SkerryError::Integrity("mac".into())),
            Some(disconnect_reason::MAC_ERROR)
        );
        assert_eq!(
            disconnect_code(&SkerryError::UntrustedHost("key".into())),
            Some(disconnect_reason::HOST_KEY_NOT_VERIFIABLE)
        );
        assert_eq!(
            disconnect_code(&SkerryError::ProtocolViolation("x".into())),
            Some(disconnect_reason::PROTOCOL_ERROR)
        );
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        assert_eq!(disconnect_code(&SkerryError::Io(io)), None);
    }
}
