//! SSH user authentication (RFC 4252, RFC 4256).
//!
//! This module implements the client side of user authentication:
//! - "none" - Probes the server's method list
//! - "publickey" - Signed public key authentication
//! - "password" - Password authentication
//! - "keyboard-interactive" - Challenge/response prompts
//!
//! [`Authenticator`] walks the configured methods in order, intersected with
//! whatever the server says may continue. Partial success (multi-factor)
//! marks a method satisfied and moves on to the next one the server asks
//! for.
//!
//! # Security
//!
//! - **No blind retries** - A credential the server rejected is remembered
//!   by digest and never sent again for the same method
//! - **Secrets zeroized** - Passwords and prompt answers are wiped on drop
//!
//! # Example
//!
//! ```rust
//! use skerry_proto::ssh::auth::{AuthRequest, AuthRequestMethod};
//!
//! let request = AuthRequest::new("alice", "ssh-connection", AuthRequestMethod::None);
//! assert_eq!(request.to_bytes()[0], 50);
//! ```

use crate::ssh::message::{expect_type, MessageType};
use crate::ssh::wire;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};
use skerry_platform::{
    AuthMethodKind, Credential, CredentialProvider, InteractiveChallenge, Prompt, SkerryError,
    SkerryResult,
};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Service requested after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Method-specific part of a USERAUTH_REQUEST.
#[derive(Clone)]
pub enum AuthRequestMethod {
    /// "none"
    None,
    /// "password"
    Password(Zeroizing<String>),
    /// "publickey"
    PublicKey {
        /// Algorithm name (e.g. "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature blob, if present
        signature: Option<Vec<u8>>,
    },
    /// "keyboard-interactive"
    KeyboardInteractive {
        /// Submethod hints
        submethods: String,
    },
}

impl AuthRequestMethod {
    /// Returns the method kind.
    pub fn kind(&self) -> AuthMethodKind {
        match self {
            AuthRequestMethod::None => AuthMethodKind::None,
            AuthRequestMethod::Password(_) => AuthMethodKind::Password,
            AuthRequestMethod::PublicKey { .. } => AuthMethodKind::PublicKey,
            AuthRequestMethod::KeyboardInteractive { .. } => AuthMethodKind::KeyboardInteractive,
        }
    }
}

impl std::fmt::Debug for AuthRequestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthRequestMethod({})", self.kind())
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthRequestMethod,
}

impl AuthRequest {
    /// Creates an authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthRequestMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the method.
    pub fn method(&self) -> &AuthRequestMethod {
        &self.method
    }

    /// Serializes the message.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        wire::write_string(&mut buf, &self.user_name);
        wire::write_string(&mut buf, &self.service_name);
        wire::write_string(&mut buf, self.method.kind().name());

        match &self.method {
            AuthRequestMethod::None => {}
            AuthRequestMethod::Password(password) => {
                wire::write_bool(&mut buf, false);
                wire::write_string(&mut buf, password);
            }
            AuthRequestMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                wire::write_bool(&mut buf, signature.is_some());
                wire::write_string(&mut buf, algorithm);
                wire::write_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    wire::write_bytes(&mut buf, sig);
                }
            }
            AuthRequestMethod::KeyboardInteractive { submethods } => {
                // language tag (deprecated)
                wire::write_string(&mut buf, "");
                wire::write_string(&mut buf, submethods);
            }
        }

        buf.to_vec()
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that may productively continue
    pub methods_can_continue: Vec<String>,
    /// Whether the last request succeeded as one step of several
    pub partial_success: bool,
}

impl AuthFailure {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        wire::write_name_list(&mut buf, &self.methods_can_continue);
        wire::write_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        expect_type(data, MessageType::UserauthFailure)?;
        let mut offset = 1;
        Ok(Self {
            methods_can_continue: wire::read_name_list(data, &mut offset)?,
            partial_success: wire::read_bool(data, &mut offset)?,
        })
    }
}

/// Parses SSH_MSG_USERAUTH_BANNER and returns the message text.
pub fn parse_banner(data: &[u8]) -> SkerryResult<String> {
    expect_type(data, MessageType::UserauthBanner)?;
    let mut offset = 1;
    wire::read_string(data, &mut offset)
}

/// Parses SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
pub fn parse_info_request(data: &[u8]) -> SkerryResult<InteractiveChallenge> {
    expect_type(data, MessageType::UserauthPkOk)?;
    let mut offset = 1;
    let name = wire::read_string(data, &mut offset)?;
    let instruction = wire::read_string(data, &mut offset)?;
    let _language = wire::read_string(data, &mut offset)?;
    let count = wire::read_u32(data, &mut offset)?;

    let mut prompts = Vec::new();
    for _ in 0..count {
        let text = wire::read_string(data, &mut offset)?;
        let echo = wire::read_bool(data, &mut offset)?;
        prompts.push(Prompt { text, echo });
    }

    Ok(InteractiveChallenge {
        name,
        instruction,
        prompts,
    })
}

/// Builds SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
pub fn info_response(responses: &[String]) -> Zeroizing<Vec<u8>> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::UserauthInfoResponse as u8);
    buf.put_u32(responses.len() as u32);
    for response in responses {
        wire::write_string(&mut buf, response);
    }
    Zeroizing::new(buf.to_vec())
}

/// Constructs the data signed for public key authentication (RFC 4252
/// Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    wire::write_string(&mut buf, user_name);
    wire::write_string(&mut buf, service_name);
    wire::write_string(&mut buf, AuthMethodKind::PublicKey.name());
    wire::write_bool(&mut buf, true);
    wire::write_string(&mut buf, algorithm);
    wire::write_bytes(&mut buf, public_key_blob);
    buf.to_vec()
}

/// Message path used by the authenticator.
///
/// `receive` yields only the payloads relevant to authentication (message
/// numbers 50 to 79); transport-level traffic is handled underneath.
#[async_trait]
pub trait AuthTransport: Send {
    /// Sends one payload.
    async fn send(&mut self, payload: &[u8]) -> SkerryResult<()>;

    /// Receives the next authentication payload.
    async fn receive(&mut self) -> SkerryResult<Vec<u8>>;
}

/// Authenticator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing sent yet
    Start,
    /// A credential for the method is being prepared
    Offered(AuthMethodKind),
    /// A request is on the wire
    Pending(AuthMethodKind),
    /// The last request was rejected; the server lists what may continue
    Failure {
        /// Methods the server still accepts
        remaining: Vec<String>,
    },
    /// One factor accepted, more required
    PartialSuccess {
        /// Methods accepted so far
        satisfied: Vec<AuthMethodKind>,
    },
    /// Authenticated
    Success,
}

/// Summary of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReport {
    /// Methods that completed a step, in order
    pub satisfied: Vec<AuthMethodKind>,
    /// Banners the server sent along the way
    pub banners: Vec<String>,
}

/// Client authentication state machine.
#[derive(Debug)]
pub struct Authenticator {
    methods: Vec<AuthMethodKind>,
    state: AuthState,
    allowed: Vec<String>,
    attempted: Vec<AuthMethodKind>,
    satisfied: Vec<AuthMethodKind>,
    exhausted: HashSet<AuthMethodKind>,
    rejected: HashSet<(AuthMethodKind, [u8; 32])>,
    banners: Vec<String>,
}

enum Reply {
    Success,
    Failure(AuthFailure),
}

impl Authenticator {
    /// Creates an authenticator trying `methods` in order.
    pub fn new(methods: Vec<AuthMethodKind>) -> Self {
        Self {
            methods,
            state: AuthState::Start,
            allowed: Vec::new(),
            attempted: Vec::new(),
            satisfied: Vec::new(),
            exhausted: HashSet::new(),
            rejected: HashSet::new(),
            banners: Vec::new(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Methods for which a request was sent, in first-attempt order.
    pub fn attempted(&self) -> &[AuthMethodKind] {
        &self.attempted
    }

    /// Runs authentication to completion.
    ///
    /// # Errors
    ///
    /// [`SkerryError::AuthenticationFailure`] naming the attempted methods
    /// once no configured method can continue.
    pub async fn run<T>(
        &mut self,
        transport: &mut T,
        username: &str,
        session_id: &[u8],
        credentials: &dyn CredentialProvider,
    ) -> SkerryResult<AuthReport>
    where
        T: AuthTransport + ?Sized,
    {
        let probe = AuthRequest::new(username, CONNECTION_SERVICE, AuthRequestMethod::None);
        transport.send(&probe.to_bytes()).await?;
        self.state = AuthState::Pending(AuthMethodKind::None);
        if let Reply::Failure(failure) = self.await_reply(transport, credentials).await? {
            self.record_failure(AuthMethodKind::None, None, failure);
        } else {
            return Ok(self.succeed(AuthMethodKind::None));
        }

        loop {
            let method = self.next_method().ok_or_else(|| self.failure())?;
            self.state = AuthState::Offered(method);

            let credential = match credentials.next_credential(method, username).await {
                Some(credential) if credential.method() == method => credential,
                Some(credential) => {
                    warn!(
                        "Credential provider returned {} for {}; skipping method",
                        credential.method(),
                        method
                    );
                    self.exhausted.insert(method);
                    continue;
                }
                None => {
                    debug!("No credential for {}", method);
                    self.exhausted.insert(method);
                    continue;
                }
            };

            let digest = credential_digest(&credential);
            if self.rejected.contains(&(method, digest)) {
                debug!("Credential for {} already rejected; not retrying", method);
                self.exhausted.insert(method);
                continue;
            }

            let request_method = match self
                .request_method(&credential, username, session_id, credentials)
                .await
            {
                Ok(request_method) => request_method,
                Err(e) => {
                    warn!("Cannot use {} credential: {}", method, e);
                    self.exhausted.insert(method);
                    continue;
                }
            };

            if !self.attempted.contains(&method) {
                self.attempted.push(method);
            }
            let request = AuthRequest::new(username, CONNECTION_SERVICE, request_method);
            transport.send(&Zeroizing::new(request.to_bytes())).await?;
            self.state = AuthState::Pending(method);
            debug!("Sent {} authentication request for {}", method, username);

            match self.await_reply(transport, credentials).await? {
                Reply::Success => return Ok(self.succeed(method)),
                Reply::Failure(failure) => self.record_failure(method, Some(digest), failure),
            }
        }
    }

    fn next_method(&self) -> Option<AuthMethodKind> {
        self.methods.iter().copied().find(|method| {
            *method != AuthMethodKind::None
                && self.allowed.iter().any(|name| name == method.name())
                && !self.exhausted.contains(method)
                && !self.satisfied.contains(method)
        })
    }

    fn failure(&self) -> SkerryError {
        SkerryError::AuthenticationFailure {
            attempted: self.attempted.iter().map(|m| m.name().to_string()).collect(),
        }
    }

    fn succeed(&mut self, method: AuthMethodKind) -> AuthReport {
        self.satisfied.push(method);
        self.state = AuthState::Success;
        info!("Authenticated with {}", method);
        AuthReport {
            satisfied: self.satisfied.clone(),
            banners: self.banners.clone(),
        }
    }

    fn record_failure(
        &mut self,
        method: AuthMethodKind,
        digest: Option<[u8; 32]>,
        failure: AuthFailure,
    ) {
        self.allowed = failure.methods_can_continue.clone();
        if failure.partial_success {
            debug!("Partial success with {}; server wants {:?}", method, self.allowed);
            self.satisfied.push(method);
            self.state = AuthState::PartialSuccess {
                satisfied: self.satisfied.clone(),
            };
        } else {
            if let Some(digest) = digest {
                debug!("{} rejected; server allows {:?}", method, self.allowed);
                self.rejected.insert((method, digest));
            }
            self.state = AuthState::Failure {
                remaining: failure.methods_can_continue,
            };
        }
    }

    async fn request_method(
        &self,
        credential: &Credential,
        username: &str,
        session_id: &[u8],
        credentials: &dyn CredentialProvider,
    ) -> SkerryResult<AuthRequestMethod> {
        Ok(match credential {
            Credential::Password(password) => AuthRequestMethod::Password(password.clone()),
            Credential::PublicKey {
                algorithm,
                public_key,
            } => {
                let data = construct_signature_data(
                    session_id,
                    username,
                    CONNECTION_SERVICE,
                    algorithm,
                    public_key,
                );
                let signature = credentials.sign(algorithm, public_key, &data).await?;
                AuthRequestMethod::PublicKey {
                    algorithm: algorithm.clone(),
                    public_key: public_key.clone(),
                    signature: Some(signature),
                }
            }
            Credential::KeyboardInteractive { submethods } => {
                AuthRequestMethod::KeyboardInteractive {
                    submethods: submethods.clone(),
                }
            }
        })
    }

    async fn await_reply<T>(
        &mut self,
        transport: &mut T,
        credentials: &dyn CredentialProvider,
    ) -> SkerryResult<Reply>
    where
        T: AuthTransport + ?Sized,
    {
        loop {
            let payload = transport.receive().await?;
            match MessageType::from_u8(payload.first().copied().unwrap_or(0)) {
                Some(MessageType::UserauthSuccess) => return Ok(Reply::Success),
                Some(MessageType::UserauthFailure) => {
                    return Ok(Reply::Failure(AuthFailure::from_bytes(&payload)?))
                }
                Some(MessageType::UserauthBanner) => {
                    let banner = parse_banner(&payload)?;
                    debug!("Authentication banner received ({} bytes)", banner.len());
                    self.banners.push(banner);
                }
                Some(MessageType::UserauthPkOk)
                    if self.state == AuthState::Pending(AuthMethodKind::KeyboardInteractive) =>
                {
                    let challenge = parse_info_request(&payload)?;
                    let answers = match credentials.respond(&challenge).await {
                        Some(answers) if answers.len() == challenge.prompts.len() => answers,
                        Some(_) | None => {
                            // An empty response set makes the server fail the attempt.
                            debug!("Keyboard-interactive challenge declined");
                            Vec::new()
                        }
                    };
                    let answers = Zeroizing::new(answers);
                    transport.send(&info_response(&answers)).await?;
                }
                _ => {
                    return Err(SkerryError::ProtocolViolation(format!(
                        "Unexpected message {} during authentication",
                        payload.first().copied().unwrap_or(0)
                    )))
                }
            }
        }
    }
}

fn credential_digest(credential: &Credential) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(credential.method().name().as_bytes());
    match credential {
        Credential::Password(password) => hasher.update(password.as_bytes()),
        Credential::PublicKey {
            algorithm,
            public_key,
        } => {
            hasher.update(algorithm.as_bytes());
            hasher.update(public_key);
        }
        Credential::KeyboardInteractive { submethods } => hasher.update(submethods.as_bytes()),
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned server replies and records what the client sent.
    struct Scripted {
        replies: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl Scripted {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                replies: replies.into(),
                sent: Vec::new(),
            }
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent
                .iter()
                .filter(|p| p[0] == MessageType::UserauthRequest as u8)
                .map(|p| {
                    let mut offset = 1;
                    wire::read_string(p, &mut offset).unwrap();
                    wire::read_string(p, &mut offset).unwrap();
                    wire::read_string(p, &mut offset).unwrap()
                })
                .collect()
        }
    }

    #[async_trait]
    impl AuthTransport for Scripted {
        async fn send(&mut self, payload: &[u8]) -> SkerryResult<()> {
            self.sent.push(payload.to_vec());
            Ok(())
        }

        async fn receive(&mut self) -> SkerryResult<Vec<u8>> {
            self.replies
                .pop_front()
                .ok_or_else(|| SkerryError::SessionClosed {
                    reason: "script exhausted".to_string(),
                })
        }
    }

    fn failure(methods: &[&str], partial: bool) -> Vec<u8> {
        AuthFailure {
            methods_can_continue: methods.iter().map(|s| s.to_string()).collect(),
            partial_success: partial,
        }
        .to_bytes()
    }

    fn success() -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }

    /// Always offers the same key and the same password.
    struct FixedCredentials {
        signed: Mutex<usize>,
    }

    #[async_trait]
    impl CredentialProvider for FixedCredentials {
        async fn next_credential(
            &self,
            method: AuthMethodKind,
            _username: &str,
        ) -> Option<Credential> {
            match method {
                AuthMethodKind::PublicKey => Some(Credential::PublicKey {
                    algorithm: "ssh-ed25519".to_string(),
                    public_key: vec![1, 2, 3],
                }),
                AuthMethodKind::Password => Some(Credential::password("hunter2")),
                _ => None,
            }
        }

        async fn sign(&self, _alg: &str, _key: &[u8], data: &[u8]) -> SkerryResult<Vec<u8>> {
            *self.signed.lock().unwrap() += 1;
            Ok(Sha256::digest(data).to_vec())
        }
    }

    fn fixed() -> FixedCredentials {
        FixedCredentials {
            signed: Mutex::new(0),
        }
    }

    #[tokio::test]
    async fn test_rejected_publickey_falls_back_to_password() {
        let mut transport = Scripted::new(vec![
            failure(&["publickey", "password"], false),
            failure(&["publickey", "password"], false),
            success(),
        ]);
        let credentials = fixed();
        let mut auth = Authenticator::new(vec![AuthMethodKind::PublicKey, AuthMethodKind::Password]);

        let report = auth
            .run(&mut transport, "alice", &[0xaa; 32], &credentials)
            .await
            .unwrap();

        assert_eq!(transport.sent_methods(), vec!["none", "publickey", "password"]);
        assert_eq!(*credentials.signed.lock().unwrap(), 1);
        assert_eq!(report.satisfied, vec![AuthMethodKind::Password]);
        assert_eq!(auth.state(), &AuthState::Success);
    }

    #[tokio::test]
    async fn test_exhaustion_names_attempted_methods() {
        let mut transport = Scripted::new(vec![
            failure(&["publickey", "password"], false),
            failure(&["publickey", "password"], false),
            failure(&["publickey", "password"], false),
        ]);
        let mut auth = Authenticator::new(vec![AuthMethodKind::PublicKey, AuthMethodKind::Password]);

        let result = auth.run(&mut transport, "alice", &[0; 32], &fixed()).await;
        match result {
            Err(SkerryError::AuthenticationFailure { attempted }) => {
                assert_eq!(attempted, vec!["publickey", "password"]);
            }
            other => panic!("expected AuthenticationFailure, got {:?}", other),
        }
        // Each credential went out exactly once.
        assert_eq!(transport.sent_methods(), vec!["none", "publickey", "password"]);
    }

    #[tokio::test]
    async fn test_methods_intersected_with_server_list() {
        let mut transport = Scripted::new(vec![failure(&["password"], false), success()]);
        let mut auth = Authenticator::new(vec![AuthMethodKind::PublicKey, AuthMethodKind::Password]);
        auth.run(&mut transport, "bob", &[0; 32], &fixed()).await.unwrap();
        assert_eq!(transport.sent_methods(), vec!["none", "password"]);
        assert_eq!(auth.attempted(), &[AuthMethodKind::Password]);
    }

    #[tokio::test]
    async fn test_partial_success_chains_methods() {
        let mut transport = Scripted::new(vec![
            failure(&["publickey"], false),
            failure(&["password"], true),
            success(),
        ]);
        let mut auth = Authenticator::new(vec![AuthMethodKind::PublicKey, AuthMethodKind::Password]);
        let report = auth.run(&mut transport, "carol", &[0; 32], &fixed()).await.unwrap();
        assert_eq!(
            report.satisfied,
            vec![AuthMethodKind::PublicKey, AuthMethodKind::Password]
        );
    }

    #[tokio::test]
    async fn test_none_accepted_immediately() {
        let mut banner = BytesMut::new();
        banner.put_u8(MessageType::UserauthBanner as u8);
        wire::write_string(&mut banner, "Authorized use only");
        wire::write_string(&mut banner, "");

        let mut transport = Scripted::new(vec![banner.to_vec(), success()]);
        let mut auth = Authenticator::new(vec![AuthMethodKind::Password]);
        let report = auth.run(&mut transport, "dave", &[0; 32], &fixed()).await.unwrap();
        assert_eq!(report.banners, vec!["Authorized use only"]);
        assert_eq!(report.satisfied, vec![AuthMethodKind::None]);
    }

    struct Interactive;

    #[async_trait]
    impl CredentialProvider for Interactive {
        async fn next_credential(
            &self,
            method: AuthMethodKind,
            _username: &str,
        ) -> Option<Credential> {
            (method == AuthMethodKind::KeyboardInteractive).then(|| {
                Credential::KeyboardInteractive {
                    submethods: String::new(),
                }
            })
        }

        async fn respond(&self, challenge: &InteractiveChallenge) -> Option<Vec<String>> {
            Some(challenge.prompts.iter().map(|_| "123456".to_string()).collect())
        }
    }

    #[tokio::test]
    async fn test_keyboard_interactive_answers_prompts() {
        let mut request = BytesMut::new();
        request.put_u8(MessageType::UserauthPkOk as u8);
        wire::write_string(&mut request, "");
        wire::write_string(&mut request, "Enter code");
        wire::write_string(&mut request, "");
        request.put_u32(1);
        wire::write_string(&mut request, "Code: ");
        wire::write_bool(&mut request, false);

        let mut transport = Scripted::new(vec![
            failure(&["keyboard-interactive"], false),
            request.to_vec(),
            success(),
        ]);
        let mut auth = Authenticator::new(vec![AuthMethodKind::KeyboardInteractive]);
        auth.run(&mut transport, "erin", &[0; 32], &Interactive).await.unwrap();

        let response = transport
            .sent
            .iter()
            .find(|p| p[0] == MessageType::UserauthInfoResponse as u8)
            .unwrap();
        let mut offset = 1;
        assert_eq!(wire::read_u32(response, &mut offset).unwrap(), 1);
        assert_eq!(wire::read_string(response, &mut offset).unwrap(), "123456");
    }

    #[tokio::test]
    async fn test_unexpected_message_is_protocol_violation() {
        let mut transport = Scripted::new(vec![vec![MessageType::ChannelData as u8]]);
        let mut auth = Authenticator::new(vec![AuthMethodKind::Password]);
        let result = auth.run(&mut transport, "x", &[0; 32], &fixed()).await;
        assert!(matches!(result, Err(SkerryError::ProtocolViolation(_))));
    }

    #[test]
    fn test_signature_data_layout() {
        let data = construct_signature_data(&[1, 2], "u", "ssh-connection", "ssh-ed25519", &[9]);
        let mut offset = 0;
        assert_eq!(wire::read_bytes(&data, &mut offset).unwrap(), vec![1, 2]);
        assert_eq!(wire::read_u8(&data, &mut offset).unwrap(), 50);
        assert_eq!(wire::read_string(&data, &mut offset).unwrap(), "u");
    }

    #[test]
    fn test_auth_failure_round_trip() {
        let failure = AuthFailure {
            methods_can_continue: vec!["publickey".to_string()],
            partial_success: true,
        };
        assert_eq!(AuthFailure::from_bytes(&failure.to_bytes()).unwrap(), failure);
    }
}
