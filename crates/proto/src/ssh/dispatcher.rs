//! SSH Message Dispatcher.
//!
//! The one task that reads the wire. It owns the inbound stream half and
//! the [`Opener`], drives key exchange, feeds channel messages into the
//! channel table and forwards everything else (service accept, user
//! authentication, global replies) to the client.
//!
//! Any error here is fatal: the session is torn down and every waiter
//! fails with [`SkerryError::SessionClosed`].

use crate::ssh::connection::{ChannelMessage, ChannelOpenFailureReason};
use crate::ssh::connection_mgr::SshConnection;
use crate::ssh::kex::{DirectionKeys, NewKeys};
use crate::ssh::message::{self, Disconnect, MessageType};
use crate::ssh::packet::Opener;
use crate::ssh::session::SessionEvent;
use crate::ssh::wire;
use skerry_platform::{HostTrust, SkerryError, SkerryResult};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Channels handed back to the client when a dispatcher is created.
pub(crate) struct DispatcherHandles {
    /// Messages not handled by the dispatcher itself
    pub(crate) global_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Resolves when the first key exchange completes or fails
    pub(crate) initial_kex: oneshot::Receiver<SkerryResult<()>>,
}

/// Reader task state.
pub(crate) struct MessageDispatcher<R> {
    reader: R,
    opener: Opener,
    connection: Arc<SshConnection>,
    host_trust: Arc<dyn HostTrust>,
    global_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending_inbound: Option<DirectionKeys>,
    initial_kex: Option<oneshot::Sender<SkerryResult<()>>>,
}

impl<R> MessageDispatcher<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    /// Creates a dispatcher over the inbound half of the stream.
    pub(crate) fn new(
        reader: R,
        connection: Arc<SshConnection>,
        host_trust: Arc<dyn HostTrust>,
    ) -> (Self, DispatcherHandles) {
        let (global_tx, global_rx) = mpsc::unbounded_channel();
        let (kex_tx, initial_kex) = oneshot::channel();
        let dispatcher = Self {
            reader,
            opener: Opener::new(),
            connection,
            host_trust,
            global_tx,
            pending_inbound: None,
            initial_kex: Some(kex_tx),
        };
        (
            dispatcher,
            DispatcherHandles {
                global_rx,
                initial_kex,
            },
        )
    }

    /// Starts the dispatcher task.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!("Message dispatcher started");
        let err = loop {
            if let Err(err) = self.step().await {
                break err;
            }
        };

        self.connection.abort(&err).await;
        if let Some(initial) = self.initial_kex.take() {
            let _ = initial.send(Err(err));
        }
        debug!("Message dispatcher stopped");
    }

    async fn step(&mut self) -> SkerryResult<()> {
        let payload = self.opener.decode(&mut self.reader).await.map_err(|err| match err {
            SkerryError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                SkerryError::SessionClosed {
                    reason: "Connection closed by peer".to_string(),
                }
            }
            other => other,
        })?;
        let sequence = self.opener.sequence().wrapping_sub(1);
        let kind = *payload
            .first()
            .ok_or_else(|| SkerryError::ProtocolViolation("Empty payload".to_string()))?;
        trace!("Received message {} ({} bytes)", kind, payload.len());

        if !MessageType::is_kex_safe(kind) {
            self.connection.note_inbound(payload.len());
        }

        match MessageType::from_u8(kind) {
            Some(MessageType::Disconnect) => {
                let disconnect = Disconnect::from_bytes(&payload)?;
                info!(
                    "Server disconnected ({}): {}",
                    disconnect.reason_code, disconnect.description
                );
                Err(SkerryError::SessionClosed {
                    reason: format!("Disconnected by server: {}", disconnect.description),
                })
            }
            Some(MessageType::Ignore) => Ok(()),
            Some(MessageType::Debug) => {
                debug!("Server debug message");
                Ok(())
            }
            Some(MessageType::Unimplemented) => {
                let mut offset = 1;
                let rejected = wire::read_u32(&payload, &mut offset)?;
                debug!("Server did not implement our message #{}", rejected);
                Ok(())
            }
            Some(MessageType::KexInit) => self.connection.receive_kexinit(&payload).await,
            Some(MessageType::KexEcdhReply) => self.on_kex_reply(&payload).await,
            Some(MessageType::NewKeys) => self.on_newkeys(&payload).await,
            Some(MessageType::UserauthSuccess) => {
                // Delayed compression starts with the next inbound packet.
                self.opener.activate_compression();
                self.connection.mark_authenticated().await;
                self.forward(payload)
            }
            Some(MessageType::GlobalRequest) => self.on_global_request(&payload).await,
            Some(_) if ChannelMessage::is_channel_message(kind) => {
                self.on_channel_message(&payload).await
            }
            Some(_) => self.forward(payload),
            None => {
                debug!("Unknown message {}, replying UNIMPLEMENTED", kind);
                self.connection
                    .send_or_defer(message::unimplemented(sequence))
                    .await
            }
        }
    }

    fn forward(&self, payload: Vec<u8>) -> SkerryResult<()> {
        // The client may have stopped listening; that is not an error.
        if self.global_tx.send(payload).is_err() {
            trace!("No listener for global message");
        }
        Ok(())
    }

    async fn on_kex_reply(&mut self, payload: &[u8]) -> SkerryResult<()> {
        let outcome = self.connection.receive_reply(payload).await?;

        if !self
            .host_trust
            .verify(&outcome.host_key_algorithm, &outcome.host_key)
            .await
        {
            return Err(SkerryError::UntrustedHost(format!(
                "{} host key rejected",
                outcome.host_key_algorithm
            )));
        }

        let keys = outcome.keys;
        self.connection.send_newkeys(&keys.client_to_server).await?;
        self.pending_inbound = Some(keys.server_to_client);
        Ok(())
    }

    async fn on_newkeys(&mut self, payload: &[u8]) -> SkerryResult<()> {
        NewKeys::from_bytes(payload)?;
        let keys = self.pending_inbound.take().ok_or_else(|| {
            SkerryError::ProtocolViolation("NEWKEYS before key exchange reply".to_string())
        })?;
        keys.install_opener(
            &mut self.opener,
            self.connection.provider(),
            self.connection.is_authenticated(),
        )?;
        debug!("Inbound keys switched to {}", keys.cipher);

        let rounds = self.connection.finish_kex().await;
        match self.initial_kex.take() {
            Some(initial) => {
                info!("Key exchange complete");
                let _ = initial.send(Ok(()));
            }
            None => {
                let count = rounds.saturating_sub(1);
                info!("Re-key {} complete", count);
                self.connection.emit(SessionEvent::Rekeyed { count });
            }
        }
        Ok(())
    }

    async fn on_global_request(&mut self, payload: &[u8]) -> SkerryResult<()> {
        let mut offset = 1;
        let name = wire::read_string(payload, &mut offset)?;
        let want_reply = wire::read_bool(payload, &mut offset)?;
        debug!("Declining global request {}", name);
        if want_reply {
            self.connection
                .send_or_defer(vec![MessageType::RequestFailure as u8])
                .await?;
        }
        Ok(())
    }

    async fn on_channel_message(&mut self, payload: &[u8]) -> SkerryResult<()> {
        let message = match ChannelMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(_) if payload[0] == MessageType::ChannelOpen as u8 => {
                // A channel type we cannot even parse; refuse it.
                let mut offset = 1;
                let channel_type = wire::read_string(payload, &mut offset)?;
                let sender_channel = wire::read_u32(payload, &mut offset)?;
                debug!("Refusing unknown channel type {}", channel_type);
                let refusal = ChannelMessage::OpenFailure {
                    recipient_channel: sender_channel,
                    reason_code: ChannelOpenFailureReason::UnknownChannelType as u32,
                    description: format!("Unsupported channel type {}", channel_type),
                };
                return self.connection.send_or_defer(refusal.to_bytes()).await;
            }
            Err(err) => return Err(err),
        };

        let reply = self.connection.channels().lock().await.handle(message)?;
        if let Some(reply) = reply {
            self.connection.send_or_defer(reply.to_bytes()).await?;
        }
        Ok(())
    }
}
