//! Collaborator traits consumed by the SSH client.
//!
//! The protocol crate never loads keys, passwords or known-hosts files
//! itself. Those come from the embedding application through the traits
//! defined here:
//!
//! - [`HostTrust`] decides whether a server host key is acceptable.
//! - [`CredentialProvider`] supplies the next credential for an
//!   authentication method, signs public-key challenges and answers
//!   keyboard-interactive prompts.

use crate::error::{SkerryError, SkerryResult};
use async_trait::async_trait;
use std::fmt;
use zeroize::Zeroizing;

/// Authentication methods understood by the client (RFC 4252, RFC 4256).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethodKind {
    /// "none", used to probe the server's method list
    None,
    /// "password"
    Password,
    /// "publickey"
    PublicKey,
    /// "keyboard-interactive"
    KeyboardInteractive,
}

impl AuthMethodKind {
    /// Returns the wire name of the method.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethodKind::None => "none",
            AuthMethodKind::Password => "password",
            AuthMethodKind::PublicKey => "publickey",
            AuthMethodKind::KeyboardInteractive => "keyboard-interactive",
        }
    }

    /// Parses a wire method name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(AuthMethodKind::None),
            "password" => Some(AuthMethodKind::Password),
            "publickey" => Some(AuthMethodKind::PublicKey),
            "keyboard-interactive" => Some(AuthMethodKind::KeyboardInteractive),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A credential handed to the authenticator.
///
/// Secrets are wiped from memory when the credential is dropped.
#[derive(Clone)]
pub enum Credential {
    /// Password authentication
    Password(Zeroizing<String>),
    /// Public-key authentication; the signature is produced later by
    /// [`CredentialProvider::sign`]
    PublicKey {
        /// Signature algorithm (e.g. "ssh-ed25519")
        algorithm: String,
        /// Public key blob in SSH wire format
        public_key: Vec<u8>,
    },
    /// Keyboard-interactive; prompts are answered by
    /// [`CredentialProvider::respond`]
    KeyboardInteractive {
        /// Comma-separated submethod hints (usually empty)
        submethods: String,
    },
}

impl Credential {
    /// Creates a password credential.
    pub fn password(password: impl Into<String>) -> Self {
        Credential::Password(Zeroizing::new(password.into()))
    }

    /// Returns the method this credential authenticates with.
    pub fn method(&self) -> AuthMethodKind {
        match self {
            Credential::Password(_) => AuthMethodKind::Password,
            Credential::PublicKey { .. } => AuthMethodKind::PublicKey,
            Credential::KeyboardInteractive { .. } => AuthMethodKind::KeyboardInteractive,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Credential::Password(***)"),
            Credential::PublicKey { algorithm, .. } => f
                .debug_struct("Credential::PublicKey")
                .field("algorithm", algorithm)
                .finish_non_exhaustive(),
            Credential::KeyboardInteractive { submethods } => f
                .debug_struct("Credential::KeyboardInteractive")
                .field("submethods", submethods)
                .finish(),
        }
    }
}

/// One prompt of a keyboard-interactive info request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub text: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// A keyboard-interactive info request (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveChallenge {
    /// Challenge name
    pub name: String,
    /// Instruction text
    pub instruction: String,
    /// Prompts to answer, in order
    pub prompts: Vec<Prompt>,
}

/// Decides whether a server host key is trusted.
///
/// Called once per key exchange, after the server's signature over the
/// exchange hash has been verified. Returning `false` aborts the session
/// with [`SkerryError::UntrustedHost`].
#[async_trait]
pub trait HostTrust: Send + Sync {
    /// Returns true if the host key is accepted.
    ///
    /// # Arguments
    ///
    /// * `algorithm` - Host key algorithm (e.g. "ssh-ed25519")
    /// * `host_key` - Host key blob in SSH wire format
    async fn verify(&self, algorithm: &str, host_key: &[u8]) -> bool;
}

/// Supplies credentials to the authenticator.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns the next credential to try for `method`, or `None` when no
    /// (further) credential exists for it.
    ///
    /// The authenticator never resubmits a credential the server has
    /// already rejected, so a provider that keeps returning the same
    /// credential simply exhausts the method.
    async fn next_credential(&self, method: AuthMethodKind, username: &str) -> Option<Credential>;

    /// Signs `data` with the private half of `public_key`.
    ///
    /// # Errors
    ///
    /// The default implementation has no keys and returns
    /// [`SkerryError::Crypto`].
    async fn sign(&self, algorithm: &str, public_key: &[u8], data: &[u8]) -> SkerryResult<Vec<u8>> {
        let _ = (public_key, data);
        Err(SkerryError::Crypto(format!(
            "no signer available for {}",
            algorithm
        )))
    }

    /// Answers a keyboard-interactive challenge, one response per prompt.
    ///
    /// Returning `None` abandons the method.
    async fn respond(&self, challenge: &InteractiveChallenge) -> Option<Vec<String>> {
        let _ = challenge;
        None
    }
}

/// A [`HostTrust`] that accepts an explicit set of host key blobs.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: Vec<(String, Vec<u8>)>,
}

impl TrustedKeys {
    /// Creates an empty trust set that rejects every host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a trusted key.
    pub fn with_key(mut self, algorithm: impl Into<String>, host_key: Vec<u8>) -> Self {
        self.keys.push((algorithm.into(), host_key));
        self
    }

    /// Returns the number of trusted keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no key is trusted.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl HostTrust for TrustedKeys {
    async fn verify(&self, algorithm: &str, host_key: &[u8]) -> bool {
        self.keys
            .iter()
            .any(|(alg, key)| alg == algorithm && key.as_slice() == host_key)
    }
}
