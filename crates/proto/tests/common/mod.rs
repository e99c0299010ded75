//! In-process SSH server for the integration tests.
//!
//! Speaks the server half of the protocol over a `tokio::io::duplex` pipe:
//! curve25519 key exchange signed with a fixed Ed25519 host key, password
//! authentication, `exec`/`env` requests, an echoing `cat` command and an
//! "sftp" subsystem backed by an in-memory tree.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use ed25519_dalek::{Signer, SigningKey};
use skerry_platform::{
    AuthMethodKind, Credential, CredentialProvider, HostTrust, SkerryError, SkerryResult,
    TrustedKeys,
};
use skerry_proto::ssh::auth::AuthFailure;
use skerry_proto::ssh::connection::{ChannelMessage, ChannelRequestType};
use skerry_proto::ssh::crypto::{CryptoProvider, DefaultCryptoProvider, KeyExchange};
use skerry_proto::ssh::kex::{
    self, EcdhInit, EcdhReply, ExchangeHashInput, KexInit, NewKeys, SessionKeys,
};
use skerry_proto::ssh::message::MessageType;
use skerry_proto::ssh::packet::{Opener, Sealer};
use skerry_proto::ssh::sftp::message::{PacketBuffer, VersionInfo};
use skerry_proto::ssh::sftp::{FileAttributes, OpenFlags, SftpMessage, SftpMessageType, StatusCode};
use skerry_proto::ssh::transport::Preferred;
use skerry_proto::ssh::version::{self, Version};
use skerry_proto::ssh::wire;
use skerry_proto::ssh::{SshClient, SshClientConfig};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// Password the mock accepts unless configured otherwise.
pub const PASSWORD: &str = "correct horse";

/// Home directory of the in-memory tree.
pub const HOME: &str = "/home/user";

const HOST_SEED: [u8; 32] = [7u8; 32];
const SERVER_WINDOW: u32 = 4 * 1024 * 1024;
const SERVER_MAX_PACKET: u32 = 64 * 1024;
const READDIR_BATCH: usize = 2;

/// Server behaviour knobs.
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub password: String,
    pub banner: Option<String>,
    pub compression: Vec<String>,
    pub rekey_after_auth: bool,
    pub sftp_version: u32,
    pub sftp_extensions: Vec<(String, String)>,
    /// Answer SFTP INIT, then ignore every request.
    pub sftp_silent: bool,
    /// Hold SFTP replies until this many are pending, then send them
    /// newest first.
    pub sftp_reply_batch: usize,
    /// Initial window granted on every channel. The mock never adjusts it.
    pub window: u32,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            password: PASSWORD.to_string(),
            banner: None,
            compression: vec!["none".to_string()],
            rekey_after_auth: false,
            sftp_version: 3,
            sftp_extensions: vec![("posix-rename@openssh.com".to_string(), "1".to_string())],
            sftp_silent: false,
            sftp_reply_batch: 1,
            window: SERVER_WINDOW,
        }
    }
}

/// What the server observed, returned when the session ends.
#[derive(Debug, Default, Clone)]
pub struct MockReport {
    pub key_exchanges: u32,
    pub auth_methods: Vec<String>,
    pub commands: Vec<String>,
    pub env: Vec<(String, String)>,
    pub ignored: u32,
    pub disconnected: bool,
}

/// A running mock server.
pub struct Mock {
    pub fs: Arc<Mutex<MemoryFs>>,
    pub task: JoinHandle<SkerryResult<MockReport>>,
}

impl Mock {
    /// Waits for the server task and returns its report.
    pub async fn finish(self) -> SkerryResult<MockReport> {
        self.task.await.expect("mock server panicked")
    }
}

/// Starts a server on one end of a pipe and returns the other end.
pub fn start(config: MockConfig) -> (DuplexStream, Mock) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let fs = Arc::new(Mutex::new(MemoryFs::seeded()));
    let task = tokio::spawn(MockServer::new(server, config, fs.clone()).run());
    (client, Mock { fs, task })
}

/// Connects a client that trusts the mock's host key.
pub async fn connect(
    config: MockConfig,
    client_config: SshClientConfig,
) -> SkerryResult<(SshClient, Mock)> {
    let (stream, mock) = start(config);
    let client = SshClient::connect(
        stream,
        client_config,
        Arc::new(DefaultCryptoProvider::new()),
        trusted(),
    )
    .await?;
    Ok((client, mock))
}

/// Connects and authenticates with the right password.
pub async fn login(config: MockConfig, client_config: SshClientConfig) -> (SshClient, Mock) {
    let (mut client, mock) = connect(config, client_config).await.expect("connect");
    client
        .authenticate("user", &Password(PASSWORD))
        .await
        .expect("authenticate");
    (client, mock)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("skerry_proto=debug")
        .try_init();
}

fn host_signing_key() -> SigningKey {
    SigningKey::from_bytes(&HOST_SEED)
}

/// The mock's host key blob: string "ssh-ed25519", string key.
pub fn host_key_blob() -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_string(&mut buf, "ssh-ed25519");
    wire::write_bytes(&mut buf, host_signing_key().verifying_key().as_bytes());
    buf.to_vec()
}

/// Trust policy pinning the mock's host key.
pub fn trusted() -> Arc<dyn HostTrust> {
    Arc::new(TrustedKeys::new().with_key("ssh-ed25519", host_key_blob()))
}

/// Trust policy that refuses every host.
pub struct RejectAll;

#[async_trait]
impl HostTrust for RejectAll {
    async fn verify(&self, _algorithm: &str, _host_key: &[u8]) -> bool {
        false
    }
}

/// Offers one fixed password.
pub struct Password(pub &'static str);

#[async_trait]
impl CredentialProvider for Password {
    async fn next_credential(&self, method: AuthMethodKind, _username: &str) -> Option<Credential> {
        (method == AuthMethodKind::Password).then(|| Credential::password(self.0))
    }
}

struct MockChannel {
    remote_id: u32,
    max_packet: u32,
    sftp: Option<PacketBuffer>,
    held: Vec<SftpMessage>,
    echo: bool,
    closed: bool,
}

struct MockServer {
    stream: DuplexStream,
    sealer: Sealer,
    opener: Opener,
    provider: DefaultCryptoProvider,
    host_key: SigningKey,
    config: MockConfig,
    client_id: String,
    server_id: String,
    session_id: Option<Vec<u8>>,
    authenticated: bool,
    backlog: VecDeque<Vec<u8>>,
    channels: HashMap<u32, MockChannel>,
    next_channel: u32,
    fs: Arc<Mutex<MemoryFs>>,
    report: MockReport,
}

impl MockServer {
    fn new(stream: DuplexStream, config: MockConfig, fs: Arc<Mutex<MemoryFs>>) -> Self {
        Self {
            stream,
            sealer: Sealer::new(),
            opener: Opener::new(),
            provider: DefaultCryptoProvider::new(),
            host_key: host_signing_key(),
            config,
            client_id: String::new(),
            server_id: String::new(),
            session_id: None,
            authenticated: false,
            backlog: VecDeque::new(),
            channels: HashMap::new(),
            next_channel: 100,
            fs,
            report: MockReport::default(),
        }
    }

    async fn run(mut self) -> SkerryResult<MockReport> {
        let identification =
            version::exchange(&mut self.stream, &Version::new("MockSSH_1.0", None)).await?;
        self.server_id = identification.local;
        self.client_id = identification.remote;

        self.key_exchange(None).await?;

        loop {
            let payload = match self.backlog.pop_front() {
                Some(payload) => payload,
                None => match self.recv().await {
                    Ok(payload) => payload,
                    Err(SkerryError::Io(_)) => break,
                    Err(err) => return Err(err),
                },
            };
            let kind = payload.first().copied().unwrap_or(0);
            match MessageType::from_u8(kind) {
                Some(MessageType::Disconnect) => {
                    self.report.disconnected = true;
                    break;
                }
                Some(MessageType::Ignore) => self.report.ignored += 1,
                Some(MessageType::KexInit) => self.key_exchange(Some(payload)).await?,
                Some(MessageType::ServiceRequest) => self.on_service_request(&payload).await?,
                Some(MessageType::UserauthRequest) => self.on_userauth(&payload).await?,
                Some(_) if ChannelMessage::is_channel_message(kind) => {
                    self.on_channel(ChannelMessage::from_bytes(&payload)?).await?
                }
                _ => {}
            }
        }
        Ok(self.report)
    }

    async fn send(&mut self, payload: &[u8]) -> SkerryResult<()> {
        let frame = self.sealer.encode(payload)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> SkerryResult<Vec<u8>> {
        self.opener.decode(&mut self.stream).await
    }

    /// Reads until a message of `expected` type arrives, queueing others.
    async fn recv_kex(&mut self, expected: MessageType) -> SkerryResult<Vec<u8>> {
        loop {
            let payload = self.recv().await?;
            if payload.first() == Some(&(expected as u8)) {
                return Ok(payload);
            }
            if payload.first() == Some(&(MessageType::Disconnect as u8)) {
                return Err(SkerryError::SessionClosed {
                    reason: "client disconnected during key exchange".to_string(),
                });
            }
            self.backlog.push_back(payload);
        }
    }

    async fn key_exchange(&mut self, client_kexinit: Option<Vec<u8>>) -> SkerryResult<()> {
        let preferred = Preferred {
            kex: self.provider.kex_algorithms(),
            host_key: self.provider.host_key_algorithms(),
            cipher: self.provider.cipher_algorithms(),
            mac: self.provider.mac_algorithms(),
            compression: self.config.compression.clone(),
        };
        let ours = KexInit::from_preferences(&preferred).to_bytes();
        self.send(&ours).await?;

        let theirs = match client_kexinit {
            Some(payload) => payload,
            None => self.recv_kex(MessageType::KexInit).await?,
        };
        let negotiated = kex::negotiate(
            &KexInit::from_bytes(&theirs)?,
            &KexInit::from_bytes(&ours)?,
            &self.provider,
        )?;

        let init = EcdhInit::from_bytes(&self.recv_kex(MessageType::KexEcdhInit).await?)?;
        let mut exchange: Box<dyn KeyExchange> = self.provider.key_exchange(&negotiated.kex)?;
        let shared_secret = exchange.agree(&init.client_public)?;
        let host_key = host_key_blob();
        let exchange_hash = ExchangeHashInput {
            client_id: &self.client_id,
            server_id: &self.server_id,
            client_kexinit: &theirs,
            server_kexinit: &ours,
            host_key: &host_key,
            client_public: &init.client_public,
            server_public: exchange.public_key(),
            shared_secret: &shared_secret,
        }
        .hash(exchange.as_ref());
        let session_id = self
            .session_id
            .get_or_insert_with(|| exchange_hash.clone())
            .clone();

        let mut signature = BytesMut::new();
        wire::write_string(&mut signature, "ssh-ed25519");
        wire::write_bytes(&mut signature, &self.host_key.sign(&exchange_hash).to_bytes());
        let reply = EcdhReply {
            host_key,
            server_public: exchange.public_key().to_vec(),
            signature: signature.to_vec(),
        };
        self.send(&reply.to_bytes()).await?;

        let keys = SessionKeys::derive(
            &negotiated,
            &self.provider,
            exchange.as_ref(),
            &shared_secret,
            &exchange_hash,
            &session_id,
        )?;
        self.send(&NewKeys::new().to_bytes()).await?;
        keys.server_to_client
            .install_sealer(&mut self.sealer, &self.provider, self.authenticated)?;

        NewKeys::from_bytes(&self.recv_kex(MessageType::NewKeys).await?)?;
        keys.client_to_server
            .install_opener(&mut self.opener, &self.provider, self.authenticated)?;

        self.report.key_exchanges += 1;
        Ok(())
    }

    async fn on_service_request(&mut self, payload: &[u8]) -> SkerryResult<()> {
        let mut offset = 1;
        let service = wire::read_string(payload, &mut offset)?;
        let mut accept = BytesMut::new();
        accept.put_u8(MessageType::ServiceAccept as u8);
        wire::write_string(&mut accept, &service);
        self.send(&accept).await
    }

    async fn on_userauth(&mut self, payload: &[u8]) -> SkerryResult<()> {
        let mut offset = 1;
        let _user = wire::read_string(payload, &mut offset)?;
        let _service = wire::read_string(payload, &mut offset)?;
        let method = wire::read_string(payload, &mut offset)?;
        self.report.auth_methods.push(method.clone());

        let accepted = if method == "password" {
            let _change = wire::read_bool(payload, &mut offset)?;
            wire::read_string(payload, &mut offset)? == self.config.password
        } else {
            false
        };

        if !accepted {
            let failure = AuthFailure {
                methods_can_continue: vec!["password".to_string()],
                partial_success: false,
            };
            return self.send(&failure.to_bytes()).await;
        }

        if let Some(text) = self.config.banner.clone() {
            let mut banner = BytesMut::new();
            banner.put_u8(MessageType::UserauthBanner as u8);
            wire::write_string(&mut banner, &text);
            wire::write_string(&mut banner, "");
            self.send(&banner).await?;
        }
        self.send(&[MessageType::UserauthSuccess as u8]).await?;
        self.authenticated = true;
        self.sealer.activate_compression();
        self.opener.activate_compression();

        if self.config.rekey_after_auth {
            self.key_exchange(None).await?;
        }
        Ok(())
    }

    async fn on_channel(&mut self, message: ChannelMessage) -> SkerryResult<()> {
        match message {
            ChannelMessage::Open {
                sender_channel,
                maximum_packet_size,
                ..
            } => {
                let id = self.next_channel;
                self.next_channel += 1;
                self.channels.insert(
                    id,
                    MockChannel {
                        remote_id: sender_channel,
                        max_packet: maximum_packet_size,
                        sftp: None,
                        held: Vec::new(),
                        echo: false,
                        closed: false,
                    },
                );
                let confirmation = ChannelMessage::OpenConfirmation {
                    recipient_channel: sender_channel,
                    sender_channel: id,
                    initial_window_size: self.config.window,
                    maximum_packet_size: SERVER_MAX_PACKET,
                };
                self.send(&confirmation.to_bytes()).await
            }
            ChannelMessage::Request {
                recipient_channel,
                request,
                want_reply,
            } => self.on_request(recipient_channel, request, want_reply).await,
            ChannelMessage::Data {
                recipient_channel,
                data,
            } => self.on_data(recipient_channel, &data).await,
            ChannelMessage::Eof { recipient_channel } => self.on_eof(recipient_channel).await,
            ChannelMessage::Close { recipient_channel } => {
                if let Some(channel) = self.channels.remove(&recipient_channel) {
                    if !channel.closed {
                        let close = ChannelMessage::Close {
                            recipient_channel: channel.remote_id,
                        };
                        self.send(&close.to_bytes()).await?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_request(
        &mut self,
        id: u32,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> SkerryResult<()> {
        let (remote, max_packet) = match self.channels.get(&id) {
            Some(channel) => (channel.remote_id, channel.max_packet),
            None => return Ok(()),
        };

        match request {
            ChannelRequestType::Exec { command } if command == "cat" => {
                self.report.commands.push(command);
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.echo = true;
                }
                self.reply(remote, want_reply, true).await
            }
            ChannelRequestType::Exec { command } => {
                self.report.commands.push(command.clone());
                self.reply(remote, want_reply, true).await?;

                let exit_status = match command.strip_prefix("fail ") {
                    Some(message) => {
                        let stderr = ChannelMessage::ExtendedData {
                            recipient_channel: remote,
                            data_type: 1,
                            data: format!("{}\n", message).into_bytes(),
                        };
                        self.send(&stderr.to_bytes()).await?;
                        1
                    }
                    None => {
                        let output = format!("ran: {}\n", command).into_bytes();
                        self.send_data(remote, max_packet, &output).await?;
                        0
                    }
                };
                let status = ChannelMessage::Request {
                    recipient_channel: remote,
                    request: ChannelRequestType::ExitStatus { exit_status },
                    want_reply: false,
                };
                self.send(&status.to_bytes()).await?;
                self.send(&ChannelMessage::Eof { recipient_channel: remote }.to_bytes())
                    .await?;
                self.send(&ChannelMessage::Close { recipient_channel: remote }.to_bytes())
                    .await?;
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.closed = true;
                }
                Ok(())
            }
            ChannelRequestType::Env { name, value } => {
                self.report.env.push((name, value));
                self.reply(remote, want_reply, true).await
            }
            ChannelRequestType::Subsystem { name } if name == "sftp" => {
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.sftp = Some(PacketBuffer::new());
                }
                self.reply(remote, want_reply, true).await
            }
            _ => self.reply(remote, want_reply, false).await,
        }
    }

    async fn reply(&mut self, remote: u32, want_reply: bool, success: bool) -> SkerryResult<()> {
        if !want_reply {
            return Ok(());
        }
        let reply = if success {
            ChannelMessage::Success {
                recipient_channel: remote,
            }
        } else {
            ChannelMessage::Failure {
                recipient_channel: remote,
            }
        };
        self.send(&reply.to_bytes()).await
    }

    async fn send_data(&mut self, remote: u32, max_packet: u32, data: &[u8]) -> SkerryResult<()> {
        for chunk in data.chunks(max_packet.max(1) as usize) {
            let message = ChannelMessage::Data {
                recipient_channel: remote,
                data: chunk.to_vec(),
            };
            self.send(&message.to_bytes()).await?;
        }
        Ok(())
    }

    /// Ends a `cat` session once the client has sent everything.
    async fn on_eof(&mut self, id: u32) -> SkerryResult<()> {
        let remote = match self.channels.get_mut(&id) {
            Some(channel) if channel.echo && !channel.closed => {
                channel.closed = true;
                channel.remote_id
            }
            _ => return Ok(()),
        };
        let status = ChannelMessage::Request {
            recipient_channel: remote,
            request: ChannelRequestType::ExitStatus { exit_status: 0 },
            want_reply: false,
        };
        self.send(&status.to_bytes()).await?;
        self.send(&ChannelMessage::Eof { recipient_channel: remote }.to_bytes())
            .await?;
        self.send(&ChannelMessage::Close { recipient_channel: remote }.to_bytes())
            .await
    }

    async fn on_data(&mut self, id: u32, data: &[u8]) -> SkerryResult<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if channel.echo {
            let (remote, max_packet) = (channel.remote_id, channel.max_packet);
            return self.send_data(remote, max_packet, data).await;
        }
        let Some(buffer) = channel.sftp.as_mut() else {
            return Ok(());
        };
        buffer.extend(data);
        let mut requests = Vec::new();
        while let Some(message) = buffer.next_message()? {
            requests.push(message);
        }
        let (remote, max_packet) = (channel.remote_id, channel.max_packet);

        for request in requests {
            if request.msg_type == SftpMessageType::Init {
                let version = VersionInfo {
                    version: self.config.sftp_version,
                    extensions: self.config.sftp_extensions.clone(),
                }
                .to_message();
                self.send_data(remote, max_packet, &version.to_bytes()).await?;
                continue;
            }
            if self.config.sftp_silent {
                continue;
            }
            let reply = self.fs.lock().expect("fs lock").handle(&request)?;

            let batch = self.config.sftp_reply_batch.max(1);
            let ready = match self.channels.get_mut(&id) {
                Some(channel) => {
                    channel.held.push(reply);
                    if channel.held.len() >= batch {
                        std::mem::take(&mut channel.held)
                    } else {
                        Vec::new()
                    }
                }
                None => Vec::new(),
            };
            for reply in ready.into_iter().rev() {
                self.send_data(remote, max_packet, &reply.to_bytes()).await?;
            }
        }
        Ok(())
    }
}

/// A node of the in-memory tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub attrs: FileAttributes,
    pub contents: Vec<u8>,
    pub target: Option<String>,
}

impl Node {
    fn dir(mode: u32) -> Self {
        Self {
            attrs: FileAttributes::new()
                .with_permissions(0o040000 | mode)
                .with_owner(1000, 1000),
            contents: Vec::new(),
            target: None,
        }
    }

    fn file(mode: u32, contents: Vec<u8>) -> Self {
        Self {
            attrs: FileAttributes::new()
                .with_size(contents.len() as u64)
                .with_permissions(0o100000 | mode)
                .with_owner(1000, 1000)
                .with_times(1_700_000_000, 1_700_000_000),
            contents,
            target: None,
        }
    }

    fn link(target: &str) -> Self {
        Self {
            attrs: FileAttributes::new().with_permissions(0o120777),
            contents: Vec::new(),
            target: Some(target.to_string()),
        }
    }

    fn is_dir(&self) -> bool {
        self.attrs.permissions.unwrap_or(0) & 0o170000 == 0o040000
    }

    fn sync_size(&mut self) {
        if !self.is_dir() && self.target.is_none() {
            self.attrs.size = Some(self.contents.len() as u64);
        }
    }
}

enum OpenHandle {
    File(String),
    Dir(VecDeque<String>),
}

/// In-memory tree served over SFTP.
pub struct MemoryFs {
    nodes: BTreeMap<String, Node>,
    handles: HashMap<Vec<u8>, (String, OpenHandle)>,
    next_handle: u32,
    /// Type of every request answered, in arrival order.
    received: Vec<SftpMessageType>,
    /// Answer READ with empty DATA instead of file contents.
    pub empty_reads: bool,
}

/// Contents of `/home/user/big.bin`.
pub fn big_contents() -> Vec<u8> {
    (0..100_000u32).map(|i| (i % 251) as u8).collect()
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn status(id: u32, code: StatusCode, message: &str) -> SftpMessage {
    let mut buf = BytesMut::new();
    buf.put_u32(id);
    buf.put_u32(code as u32);
    wire::write_string(&mut buf, message);
    wire::write_string(&mut buf, "en");
    SftpMessage::new(SftpMessageType::Status, buf.to_vec())
}

fn with_id(id: u32, msg_type: SftpMessageType, write: impl FnOnce(&mut BytesMut)) -> SftpMessage {
    let mut buf = BytesMut::new();
    buf.put_u32(id);
    write(&mut buf);
    SftpMessage::new(msg_type, buf.to_vec())
}

fn longname(name: &str, node: &Node) -> String {
    let mode = node.attrs.mode().map(|m| m.to_string()).unwrap_or_default();
    format!("{} 1 user user {:>8} Jan  1 00:00 {}", mode, node.contents.len(), name)
}

impl MemoryFs {
    /// The tree every mock session starts with.
    pub fn seeded() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::dir(0o755));
        nodes.insert("/home".to_string(), Node::dir(0o755));
        nodes.insert(HOME.to_string(), Node::dir(0o750));
        nodes.insert(
            format!("{}/notes.txt", HOME),
            Node::file(0o640, b"hello sftp\n".to_vec()),
        );
        nodes.insert(format!("{}/big.bin", HOME), Node::file(0o644, big_contents()));
        nodes.insert(format!("{}/docs", HOME), Node::dir(0o2755));
        nodes.insert(format!("{}/docs/a.md", HOME), Node::file(0o644, b"# a\n".to_vec()));
        nodes.insert(format!("{}/docs/b.md", HOME), Node::file(0o644, b"# b\n".to_vec()));
        nodes.insert(format!("{}/docs/c.md", HOME), Node::file(0o600, b"# c\n".to_vec()));
        nodes.insert(format!("{}/link", HOME), Node::link("notes.txt"));
        Self {
            nodes,
            handles: HashMap::new(),
            next_handle: 1,
            received: Vec::new(),
            empty_reads: false,
        }
    }

    /// Looks a node up by absolute path.
    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    /// How many requests of `kind` the server answered.
    pub fn received(&self, kind: SftpMessageType) -> usize {
        self.received.iter().filter(|seen| **seen == kind).count()
    }

    /// Number of handles the client left open.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|path| path.as_str() != "/" && parent(path) == dir)
            .map(|path| base_name(path).to_string())
            .collect()
    }

    fn resolve(&self, path: &str) -> String {
        match self.nodes.get(path).and_then(|node| node.target.as_deref()) {
            Some(target) if target.starts_with('/') => target.to_string(),
            Some(target) => format!("{}/{}", parent(path), target),
            None => path.to_string(),
        }
    }

    fn new_handle(&mut self, path: &str, handle: OpenHandle) -> Vec<u8> {
        let bytes = format!("h{}", self.next_handle).into_bytes();
        self.next_handle += 1;
        self.handles.insert(bytes.clone(), (path.to_string(), handle));
        bytes
    }

    fn apply(node: &mut Node, attrs: FileAttributes) {
        if let Some(size) = attrs.size {
            node.contents.resize(size as usize, 0);
        }
        if attrs.owner.is_some() {
            node.attrs.owner = attrs.owner;
        }
        if attrs.permissions.is_some() {
            node.attrs.permissions = attrs.permissions;
        }
        if attrs.times.is_some() {
            node.attrs.times = attrs.times;
        }
        node.sync_size();
    }

    /// Answers one request.
    pub fn handle(&mut self, request: &SftpMessage) -> SkerryResult<SftpMessage> {
        let data = &request.payload;
        let mut offset = 0;
        let id = wire::read_u32(data, &mut offset)?;
        self.received.push(request.msg_type);

        let reply = match request.msg_type {
            SftpMessageType::Open => {
                let path = wire::read_string(data, &mut offset)?;
                let flags = OpenFlags::from_bits(wire::read_u32(data, &mut offset)?);
                let attrs = FileAttributes::decode(data, &mut offset)?;
                self.open(id, &path, flags, attrs)
            }
            SftpMessageType::Close => {
                let handle = wire::read_bytes(data, &mut offset)?;
                match self.handles.remove(&handle) {
                    Some(_) => status(id, StatusCode::Ok, "Success"),
                    None => status(id, StatusCode::Failure, "Invalid handle"),
                }
            }
            SftpMessageType::Read => {
                let handle = wire::read_bytes(data, &mut offset)?;
                let position = wire::read_u64(data, &mut offset)? as usize;
                let len = wire::read_u32(data, &mut offset)? as usize;
                match self.handles.get(&handle) {
                    Some((_, OpenHandle::File(_))) if self.empty_reads => {
                        with_id(id, SftpMessageType::Data, |buf| wire::write_bytes(buf, &[]))
                    }
                    Some((path, OpenHandle::File(_))) => {
                        let contents = &self.nodes[path.as_str()].contents;
                        if position >= contents.len() {
                            status(id, StatusCode::Eof, "End of file")
                        } else {
                            let end = contents.len().min(position + len);
                            let chunk = contents[position..end].to_vec();
                            with_id(id, SftpMessageType::Data, |buf| {
                                wire::write_bytes(buf, &chunk)
                            })
                        }
                    }
                    _ => status(id, StatusCode::Failure, "Invalid handle"),
                }
            }
            SftpMessageType::Write => {
                let handle = wire::read_bytes(data, &mut offset)?;
                let position = wire::read_u64(data, &mut offset)? as usize;
                let bytes = wire::read_bytes(data, &mut offset)?;
                match self.handles.get(&handle) {
                    Some((path, OpenHandle::File(_))) => {
                        let path = path.clone();
                        let node = self.nodes.get_mut(&path).expect("open file exists");
                        if node.contents.len() < position + bytes.len() {
                            node.contents.resize(position + bytes.len(), 0);
                        }
                        node.contents[position..position + bytes.len()].copy_from_slice(&bytes);
                        node.sync_size();
                        status(id, StatusCode::Ok, "Success")
                    }
                    _ => status(id, StatusCode::Failure, "Invalid handle"),
                }
            }
            SftpMessageType::Stat | SftpMessageType::LStat => {
                let path = wire::read_string(data, &mut offset)?;
                let path = if request.msg_type == SftpMessageType::Stat {
                    self.resolve(&path)
                } else {
                    path
                };
                match self.nodes.get(&path) {
                    Some(node) => {
                        let attrs = node.attrs.clone();
                        with_id(id, SftpMessageType::Attrs, |buf| attrs.encode(buf))
                    }
                    None => status(id, StatusCode::NoSuchFile, "No such file"),
                }
            }
            SftpMessageType::FStat => {
                let handle = wire::read_bytes(data, &mut offset)?;
                match self.handles.get(&handle) {
                    Some((path, _)) => {
                        let attrs = self.nodes[path.as_str()].attrs.clone();
                        with_id(id, SftpMessageType::Attrs, |buf| attrs.encode(buf))
                    }
                    None => status(id, StatusCode::Failure, "Invalid handle"),
                }
            }
            SftpMessageType::SetStat => {
                let path = wire::read_string(data, &mut offset)?;
                let attrs = FileAttributes::decode(data, &mut offset)?;
                match self.nodes.get_mut(&path) {
                    Some(node) => {
                        Self::apply(node, attrs);
                        status(id, StatusCode::Ok, "Success")
                    }
                    None => status(id, StatusCode::NoSuchFile, "No such file"),
                }
            }
            SftpMessageType::FSetStat => {
                let handle = wire::read_bytes(data, &mut offset)?;
                let attrs = FileAttributes::decode(data, &mut offset)?;
                match self.handles.get(&handle) {
                    Some((path, _)) => {
                        let path = path.clone();
                        if let Some(node) = self.nodes.get_mut(&path) {
                            Self::apply(node, attrs);
                        }
                        status(id, StatusCode::Ok, "Success")
                    }
                    None => status(id, StatusCode::Failure, "Invalid handle"),
                }
            }
            SftpMessageType::OpenDir => {
                let path = wire::read_string(data, &mut offset)?;
                match self.nodes.get(&path) {
                    Some(node) if node.is_dir() => {
                        let mut names: VecDeque<String> =
                            [".".to_string(), "..".to_string()].into_iter().collect();
                        names.extend(self.children(&path));
                        let handle = self.new_handle(&path, OpenHandle::Dir(names));
                        with_id(id, SftpMessageType::Handle, |buf| {
                            wire::write_bytes(buf, &handle)
                        })
                    }
                    Some(_) => status(id, StatusCode::Failure, "Not a directory"),
                    None => status(id, StatusCode::NoSuchFile, "No such file"),
                }
            }
            SftpMessageType::ReadDir => {
                let handle = wire::read_bytes(data, &mut offset)?;
                self.read_dir(id, &handle)
            }
            SftpMessageType::Remove => {
                let path = wire::read_string(data, &mut offset)?;
                match self.nodes.get(&path) {
                    Some(node) if node.is_dir() => {
                        status(id, StatusCode::Failure, "Is a directory")
                    }
                    Some(_) => {
                        self.nodes.remove(&path);
                        status(id, StatusCode::Ok, "Success")
                    }
                    None => status(id, StatusCode::NoSuchFile, "No such file"),
                }
            }
            SftpMessageType::MkDir => {
                let path = wire::read_string(data, &mut offset)?;
                let attrs = FileAttributes::decode(data, &mut offset)?;
                if self.nodes.contains_key(&path) {
                    status(id, StatusCode::Failure, "File exists")
                } else if !self.nodes.contains_key(parent(&path)) {
                    status(id, StatusCode::NoSuchFile, "No such file")
                } else {
                    let mode = attrs.permissions.unwrap_or(0o755) & 0o7777;
                    self.nodes.insert(path, Node::dir(mode));
                    status(id, StatusCode::Ok, "Success")
                }
            }
            SftpMessageType::RmDir => {
                let path = wire::read_string(data, &mut offset)?;
                match self.nodes.get(&path) {
                    Some(node) if !node.is_dir() => {
                        status(id, StatusCode::Failure, "Not a directory")
                    }
                    Some(_) if !self.children(&path).is_empty() => {
                        status(id, StatusCode::Failure, "Directory not empty")
                    }
                    Some(_) => {
                        self.nodes.remove(&path);
                        status(id, StatusCode::Ok, "Success")
                    }
                    None => status(id, StatusCode::NoSuchFile, "No such file"),
                }
            }
            SftpMessageType::RealPath => {
                let path = wire::read_string(data, &mut offset)?;
                let resolved = match path.as_str() {
                    "" | "." => HOME.to_string(),
                    absolute if absolute.starts_with('/') => absolute.to_string(),
                    relative => format!("{}/{}", HOME, relative),
                };
                with_id(id, SftpMessageType::Name, |buf| {
                    buf.put_u32(1);
                    wire::write_string(buf, &resolved);
                    wire::write_string(buf, &resolved);
                    FileAttributes::new().encode(buf);
                })
            }
            SftpMessageType::Rename => {
                let old_path = wire::read_string(data, &mut offset)?;
                let new_path = wire::read_string(data, &mut offset)?;
                if self.nodes.contains_key(&new_path) {
                    status(id, StatusCode::Failure, "File exists")
                } else {
                    match self.nodes.remove(&old_path) {
                        Some(node) => {
                            self.nodes.insert(new_path, node);
                            status(id, StatusCode::Ok, "Success")
                        }
                        None => status(id, StatusCode::NoSuchFile, "No such file"),
                    }
                }
            }
            SftpMessageType::ReadLink => {
                let path = wire::read_string(data, &mut offset)?;
                match self.nodes.get(&path).and_then(|node| node.target.clone()) {
                    Some(target) => with_id(id, SftpMessageType::Name, |buf| {
                        buf.put_u32(1);
                        wire::write_string(buf, &target);
                        wire::write_string(buf, &target);
                        FileAttributes::new().encode(buf);
                    }),
                    None => status(id, StatusCode::NoSuchFile, "Not a link"),
                }
            }
            SftpMessageType::Symlink => {
                // OpenSSH argument order: target first, then the link.
                let target = wire::read_string(data, &mut offset)?;
                let link = wire::read_string(data, &mut offset)?;
                if self.nodes.contains_key(&link) {
                    status(id, StatusCode::Failure, "File exists")
                } else {
                    self.nodes.insert(link, Node::link(&target));
                    status(id, StatusCode::Ok, "Success")
                }
            }
            _ => status(id, StatusCode::OpUnsupported, "Unsupported"),
        };
        Ok(reply)
    }

    fn open(&mut self, id: u32, path: &str, flags: OpenFlags, attrs: FileAttributes) -> SftpMessage {
        let exists = self.nodes.contains_key(path);
        if exists && flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCLUSIVE) {
            return status(id, StatusCode::Failure, "File exists");
        }
        if !exists {
            if !flags.contains(OpenFlags::CREATE) {
                return status(id, StatusCode::NoSuchFile, "No such file");
            }
            if !self.nodes.contains_key(parent(path)) {
                return status(id, StatusCode::NoSuchFile, "No such directory");
            }
            let mode = attrs.permissions.unwrap_or(0o644) & 0o7777;
            self.nodes.insert(path.to_string(), Node::file(mode, Vec::new()));
        }

        let path = self.resolve(path);
        let Some(node) = self.nodes.get_mut(&path) else {
            return status(id, StatusCode::NoSuchFile, "Dangling link");
        };
        if node.is_dir() {
            return status(id, StatusCode::Failure, "Is a directory");
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            node.contents.clear();
            node.sync_size();
        }
        let handle = self.new_handle(&path, OpenHandle::File(path.clone()));
        with_id(id, SftpMessageType::Handle, |buf| wire::write_bytes(buf, &handle))
    }

    fn read_dir(&mut self, id: u32, handle: &[u8]) -> SftpMessage {
        let Some((dir, OpenHandle::Dir(pending))) = self.handles.get_mut(handle) else {
            return status(id, StatusCode::Failure, "Invalid handle");
        };
        if pending.is_empty() {
            return status(id, StatusCode::Eof, "End of directory");
        }
        let dir = dir.clone();
        let batch: Vec<String> = (0..READDIR_BATCH).filter_map(|_| pending.pop_front()).collect();

        let mut entries = Vec::new();
        for name in batch {
            let full = match name.as_str() {
                "." => dir.clone(),
                ".." => parent(&dir).to_string(),
                _ if dir == "/" => format!("/{}", name),
                _ => format!("{}/{}", dir, name),
            };
            let node = self.nodes.get(&full).cloned().unwrap_or_else(|| Node::dir(0o755));
            entries.push((name, node));
        }
        with_id(id, SftpMessageType::Name, |buf| {
            buf.put_u32(entries.len() as u32);
            for (name, node) in &entries {
                wire::write_string(buf, name);
                wire::write_string(buf, &longname(name, node));
                node.attrs.encode(buf);
            }
        })
    }
}
