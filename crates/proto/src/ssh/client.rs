//! SSH Client implementation.
//!
//! [`SshClient`] drives one session over any byte stream:
//!
//! 1. Version exchange
//! 2. Key exchange (host key checked by the caller's [`HostTrust`])
//! 3. User authentication with the caller's [`CredentialProvider`]
//! 4. Channels: command execution, subsystems, SFTP
//!
//! # Example
//!
//! ```rust,no_run
//! use skerry_platform::{AuthMethodKind, Credential, CredentialProvider, TrustedKeys};
//! use skerry_proto::ssh::client::{SshClient, SshClientConfig};
//! use skerry_proto::ssh::crypto::DefaultCryptoProvider;
//! use std::sync::Arc;
//! use tokio::net::TcpStream;
//!
//! struct Password;
//!
//! #[async_trait::async_trait]
//! impl CredentialProvider for Password {
//!     async fn next_credential(&self, method: AuthMethodKind, _user: &str) -> Option<Credential> {
//!         (method == AuthMethodKind::Password).then(|| Credential::password("secret"))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("127.0.0.1:22").await?;
//! let trust = TrustedKeys::new().with_key("ssh-ed25519", vec![/* host key blob */]);
//! let mut client = SshClient::connect(
//!     stream,
//!     SshClientConfig::default(),
//!     Arc::new(DefaultCryptoProvider::new()),
//!     Arc::new(trust),
//! )
//! .await?;
//!
//! client.authenticate("user", &Password).await?;
//! let output = client.exec("whoami").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{AuthReport, AuthTransport, Authenticator};
use crate::ssh::channel::{ChannelEvent, SshChannel, DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE};
use crate::ssh::connection::{ChannelType, EXTENDED_DATA_STDERR};
use crate::ssh::connection_mgr::SshConnection;
use crate::ssh::crypto::CryptoProvider;
use crate::ssh::dispatcher::{DispatcherHandles, MessageDispatcher};
use crate::ssh::kex::{Negotiated, Negotiator};
use crate::ssh::message::{self, disconnect_reason, MessageType};
use crate::ssh::session::{create_keepalive_message, KeepaliveTask, SessionEvent, KEEPALIVE_DATA_LEN};
use crate::ssh::sftp::{SftpClient, SftpConfig};
use crate::ssh::transport::{RekeyPolicy, TransportConfig};
use crate::ssh::version::{self, Version};
use async_trait::async_trait;
use skerry_platform::{AuthMethodKind, CredentialProvider, HostTrust, SkerryError, SkerryResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Service requested before user authentication.
const USERAUTH_SERVICE: &str = "ssh-userauth";

/// SSH client configuration.
#[derive(Debug, Clone)]
pub struct SshClientConfig {
    /// Transport settings (identification, algorithms, re-key thresholds).
    pub transport: TransportConfig,
    /// Time allowed for version and key exchange.
    pub handshake_timeout: Duration,
    /// Keep-alive interval.
    ///
    /// If set, SSH_MSG_IGNORE is sent at this interval. Defaults to None
    /// (disabled).
    pub keepalive_interval: Option<Duration>,
    /// Authentication methods to try, in order.
    pub auth_methods: Vec<AuthMethodKind>,
    /// Initial receive window for new channels.
    pub window_size: u32,
    /// Maximum packet size we accept on new channels.
    pub max_packet_size: u32,
    /// SFTP settings.
    pub sftp: SftpConfig,
}

impl SshClientConfig {
    /// Sets the transport settings.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Enables keep-alive messages.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Sets the authentication methods, in order of preference.
    pub fn with_auth_methods(mut self, methods: Vec<AuthMethodKind>) -> Self {
        self.auth_methods = methods;
        self
    }

    /// Sets the per-channel window and maximum packet size.
    pub fn with_channel_limits(mut self, window_size: u32, max_packet_size: u32) -> Self {
        self.window_size = window_size;
        self.max_packet_size = max_packet_size;
        self
    }

    /// Sets the SFTP settings.
    pub fn with_sftp(mut self, sftp: SftpConfig) -> Self {
        self.sftp = sftp;
        self
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            handshake_timeout: Duration::from_secs(30),
            keepalive_interval: None,
            auth_methods: vec![
                AuthMethodKind::PublicKey,
                AuthMethodKind::KeyboardInteractive,
                AuthMethodKind::Password,
            ],
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            sftp: SftpConfig::default(),
        }
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Everything written to stdout
    pub stdout: Vec<u8>,
    /// Everything written to stderr
    pub stderr: Vec<u8>,
    /// Exit status, if the server reported one
    pub exit_status: Option<u32>,
    /// Terminating signal, if the command was killed
    pub exit_signal: Option<String>,
}

/// SSH Client.
pub struct SshClient {
    connection: Arc<SshConnection>,
    global_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    dispatcher: JoinHandle<()>,
    keepalive: Option<KeepaliveTask>,
    config: SshClientConfig,
    server_version: Version,
    username: Option<String>,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("server_version", &self.server_version)
            .field("username", &self.username)
            .field("connection", &self.connection)
            .finish()
    }
}

impl SshClient {
    /// Establishes a session over `stream`.
    ///
    /// Performs the version exchange and the first key exchange. The
    /// session is ready for [`authenticate`](Self::authenticate) on return.
    ///
    /// # Errors
    ///
    /// - [`SkerryError::NegotiationFailure`] if no algorithm is shared
    /// - [`SkerryError::UntrustedHost`] if `host_trust` rejects the host key
    /// - [`SkerryError::Io`] on stream failure or handshake timeout
    pub async fn connect<S>(
        mut stream: S,
        config: SshClientConfig,
        provider: Arc<dyn CryptoProvider>,
        host_trust: Arc<dyn HostTrust>,
    ) -> SkerryResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let identification = tokio::time::timeout(
            config.handshake_timeout,
            version::exchange(&mut stream, &config.transport.version),
        )
        .await
        .map_err(|_| handshake_timeout("Version exchange"))??;
        info!("Connected to {}", identification.remote);

        let negotiator = Negotiator::new(
            config.transport.preferences(provider.as_ref()),
            &identification.local,
            &identification.remote,
        );
        let (reader, writer) = tokio::io::split(stream);
        let connection = Arc::new(SshConnection::new(
            writer,
            negotiator,
            RekeyPolicy::from_config(&config.transport),
            provider,
        ));
        let (dispatcher, handles) = MessageDispatcher::new(reader, connection.clone(), host_trust);
        let DispatcherHandles {
            global_rx,
            initial_kex,
        } = handles;
        let dispatcher = dispatcher.spawn();

        let handshake = async {
            connection.start_kex().await?;
            match initial_kex.await {
                Ok(result) => result,
                Err(_) => Err(dispatcher_gone(&connection)),
            }
        };
        let outcome = match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Err(handshake_timeout("Key exchange")),
        };
        if let Err(err) = outcome {
            connection.terminate(err.to_string()).await;
            dispatcher.abort();
            return Err(err);
        }

        let keepalive = config.keepalive_interval.map(|interval| {
            let connection = connection.clone();
            KeepaliveTask::spawn(interval, move || {
                let connection = connection.clone();
                async move {
                    connection
                        .send_packet(&create_keepalive_message(KEEPALIVE_DATA_LEN))
                        .await
                }
            })
        });

        Ok(Self {
            connection,
            global_rx,
            dispatcher,
            keepalive,
            config,
            server_version: identification.remote_version,
            username: None,
        })
    }

    /// Authenticates as `username`.
    ///
    /// Methods from [`SshClientConfig::auth_methods`] are tried in order,
    /// restricted to what the server allows.
    ///
    /// # Errors
    ///
    /// [`SkerryError::AuthenticationFailure`] naming the attempted methods
    /// once nothing is left to try; the session is then closed.
    pub async fn authenticate(
        &mut self,
        username: &str,
        credentials: &dyn CredentialProvider,
    ) -> SkerryResult<AuthReport> {
        if self.username.is_some() {
            return Err(SkerryError::InvalidArgument(
                "Session is already authenticated".to_string(),
            ));
        }

        let result = self.run_authentication(username, credentials).await;
        match result {
            Ok(report) => {
                for banner in &report.banners {
                    self.connection.emit(SessionEvent::Banner(banner.clone()));
                }
                info!("Authenticated as {}", username);
                self.username = Some(username.to_string());
                self.connection.emit(SessionEvent::Authenticated {
                    username: username.to_string(),
                });
                Ok(report)
            }
            Err(err) => {
                if let SkerryError::AuthenticationFailure { .. } = err {
                    self.connection
                        .disconnect(
                            disconnect_reason::NO_MORE_AUTH_METHODS_AVAILABLE,
                            "No more authentication methods available",
                        )
                        .await;
                } else if err.is_fatal() {
                    self.connection.abort(&err).await;
                }
                Err(err)
            }
        }
    }

    async fn run_authentication(
        &mut self,
        username: &str,
        credentials: &dyn CredentialProvider,
    ) -> SkerryResult<AuthReport> {
        self.connection
            .send_packet(&message::service_request(USERAUTH_SERVICE))
            .await?;
        let accept = next_global(&self.connection, &mut self.global_rx).await?;
        let service = message::parse_service_accept(&accept)?;
        if service != USERAUTH_SERVICE {
            return Err(SkerryError::ProtocolViolation(format!(
                "Server accepted service {} instead of {}",
                service, USERAUTH_SERVICE
            )));
        }

        let session_id = self.connection.session_id().await.ok_or_else(|| {
            SkerryError::ProtocolViolation("No session identifier".to_string())
        })?;
        let mut authenticator = Authenticator::new(self.config.auth_methods.clone());
        let mut transport = ClientAuthTransport {
            connection: &self.connection,
            global_rx: &mut self.global_rx,
        };
        authenticator
            .run(&mut transport, username, &session_id, credentials)
            .await
    }

    /// Opens a channel of the given type.
    ///
    /// # Errors
    ///
    /// [`SkerryError::ChannelOpenFailed`] if the server refuses; the
    /// session stays usable.
    pub async fn open_channel(&self, channel_type: ChannelType) -> SkerryResult<SshChannel> {
        self.require_authenticated()?;
        SshChannel::open(
            self.connection.clone(),
            channel_type,
            self.config.window_size,
            self.config.max_packet_size,
        )
        .await
    }

    /// Opens a session channel.
    pub async fn open_session(&self) -> SkerryResult<SshChannel> {
        self.open_channel(ChannelType::Session).await
    }

    /// Runs a command and collects its output.
    pub async fn exec(&self, command: &str) -> SkerryResult<ExecOutput> {
        let mut channel = self.open_session().await?;
        channel.exec(command).await?;
        debug!("Executing on channel {}: {}", channel.local_id(), command);

        let mut output = ExecOutput::default();
        while let Some(event) = channel.recv().await? {
            match event {
                ChannelEvent::Data(data) => output.stdout.extend_from_slice(&data),
                ChannelEvent::ExtendedData { data_type, data } if data_type == EXTENDED_DATA_STDERR => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelEvent::ExtendedData { .. } | ChannelEvent::Eof => {}
                ChannelEvent::ExitStatus(status) => output.exit_status = Some(status),
                ChannelEvent::ExitSignal { signal_name, .. } => output.exit_signal = Some(signal_name),
                ChannelEvent::Close => break,
            }
        }
        channel.close().await?;
        Ok(output)
    }

    /// Starts an SFTP session on a new channel.
    pub async fn sftp(&self) -> SkerryResult<SftpClient> {
        let channel = self.open_session().await?;
        channel.request_subsystem("sftp").await?;
        SftpClient::start(channel, self.config.sftp.clone()).await
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.connection.subscribe()
    }

    /// Starts a key re-exchange now.
    pub async fn rekey(&self) -> SkerryResult<()> {
        self.connection.request_rekey().await
    }

    /// Sends one keep-alive message.
    pub async fn send_keepalive(&self) -> SkerryResult<()> {
        self.connection
            .send_packet(&create_keepalive_message(KEEPALIVE_DATA_LEN))
            .await
    }

    /// The shared session state.
    pub fn connection(&self) -> &Arc<SshConnection> {
        &self.connection
    }

    /// The session identifier.
    pub async fn session_id(&self) -> Option<Vec<u8>> {
        self.connection.session_id().await
    }

    /// Algorithms in use.
    pub async fn negotiated(&self) -> Option<Negotiated> {
        self.connection.negotiated().await
    }

    /// The server's identification.
    pub fn server_version(&self) -> &Version {
        &self.server_version
    }

    /// The authenticated user name.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns true once authentication has succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    /// Returns true once the session has ended.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Disconnects from the server.
    pub async fn disconnect(mut self) -> SkerryResult<()> {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        self.connection
            .disconnect(disconnect_reason::BY_APPLICATION, "Disconnected by user")
            .await;
        self.dispatcher.abort();
        Ok(())
    }

    fn require_authenticated(&self) -> SkerryResult<()> {
        if let Some(err) = self.connection.closed_error() {
            return Err(err);
        }
        if self.username.is_none() {
            return Err(SkerryError::InvalidArgument(
                "Session is not authenticated".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        if self.connection.is_closed() {
            return;
        }
        // Tell the server and fail outstanding channel waits.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connection = self.connection.clone();
            runtime.spawn(async move {
                connection
                    .disconnect(disconnect_reason::BY_APPLICATION, "Client dropped")
                    .await;
            });
        }
    }
}

/// Authentication traffic over the session.
struct ClientAuthTransport<'a> {
    connection: &'a SshConnection,
    global_rx: &'a mut mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl AuthTransport for ClientAuthTransport<'_> {
    async fn send(&mut self, payload: &[u8]) -> SkerryResult<()> {
        self.connection.send_packet(payload).await
    }

    async fn receive(&mut self) -> SkerryResult<Vec<u8>> {
        let userauth = MessageType::UserauthRequest as u8..=79;
        loop {
            let payload = next_global(self.connection, self.global_rx).await?;
            if userauth.contains(&payload[0]) {
                return Ok(payload);
            }
            debug!("Ignoring message {} during authentication", payload[0]);
        }
    }
}

async fn next_global(
    connection: &SshConnection,
    global_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> SkerryResult<Vec<u8>> {
    match global_rx.recv().await {
        Some(payload) => Ok(payload),
        None => Err(dispatcher_gone(connection)),
    }
}

fn dispatcher_gone(connection: &SshConnection) -> SkerryError {
    connection
        .closed_error()
        .unwrap_or_else(|| SkerryError::SessionClosed {
            reason: "Message dispatcher stopped".to_string(),
        })
}

fn handshake_timeout(stage: &str) -> SkerryError {
    SkerryError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} timed out", stage),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SshClientConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.keepalive_interval, None);
        assert_eq!(config.window_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(config.auth_methods[0], AuthMethodKind::PublicKey);
    }

    #[test]
    fn test_config_builders() {
        let config = SshClientConfig::default()
            .with_keepalive(Duration::from_secs(15))
            .with_auth_methods(vec![AuthMethodKind::Password])
            .with_channel_limits(64 * 1024, 16 * 1024);
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(15)));
        assert_eq!(config.auth_methods, vec![AuthMethodKind::Password]);
        assert_eq!(config.window_size, 64 * 1024);
        assert_eq!(config.max_packet_size, 16 * 1024);
    }

    #[tokio::test]
    async fn test_connect_rejects_non_ssh_peer() {
        use crate::ssh::crypto::DefaultCryptoProvider;
        use skerry_platform::TrustedKeys;
        use tokio::io::AsyncWriteExt;

        let (client_side, mut server_side) = tokio::io::duplex(4096);
        server_side.write_all(b"SSH-1.5-ancient\r\n").await.unwrap();

        let err = SshClient::connect(
            client_side,
            SshClientConfig::default(),
            Arc::new(DefaultCryptoProvider::new()),
            Arc::new(TrustedKeys::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SkerryError::UnsupportedVersion(_) | SkerryError::ProtocolViolation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_on_silent_peer() {
        use crate::ssh::crypto::DefaultCryptoProvider;
        use skerry_platform::TrustedKeys;

        let (client_side, _server_side) = tokio::io::duplex(4096);
        let err = SshClient::connect(
            client_side,
            SshClientConfig::default().with_handshake_timeout(Duration::from_secs(5)),
            Arc::new(DefaultCryptoProvider::new()),
            Arc::new(TrustedKeys::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SkerryError::Io(ref io) if io.kind() == std::io::ErrorKind::TimedOut));
    }
}
