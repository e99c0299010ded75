//! Client-side SSH protocol stack.
//!
//! This crate provides a Rust implementation of the client half of SSH:
//!
//! - **Transport** - version exchange, curve25519 key exchange, AES-GCM /
//!   AES-CTR ciphers, HMAC-SHA2, zlib compression and automatic re-keying
//! - **Authentication** - none, password, public key and keyboard-interactive
//! - **Connection** - multiplexed channels with flow control, `exec`,
//!   `env` and subsystems
//! - **SFTP** - a pipelined version 3 client with typed file attributes
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use skerry_platform::{
//!     AuthMethodKind, Credential, CredentialProvider, HostTrust, SkerryResult,
//! };
//! use skerry_proto::ssh::{DefaultCryptoProvider, SshClient, SshClientConfig};
//! use std::sync::Arc;
//! use tokio::net::TcpStream;
//!
//! struct AcceptAll;
//!
//! #[async_trait]
//! impl HostTrust for AcceptAll {
//!     async fn verify(&self, _algorithm: &str, _host_key: &[u8]) -> bool {
//!         true
//!     }
//! }
//!
//! struct Password;
//!
//! #[async_trait]
//! impl CredentialProvider for Password {
//!     async fn next_credential(&self, method: AuthMethodKind, _user: &str) -> Option<Credential> {
//!         (method == AuthMethodKind::Password).then(|| Credential::password("secret"))
//!     }
//! }
//!
//! # async fn run() -> SkerryResult<()> {
//! let stream = TcpStream::connect("example.com:22").await?;
//! let mut client = SshClient::connect(
//!     stream,
//!     SshClientConfig::default(),
//!     Arc::new(DefaultCryptoProvider),
//!     Arc::new(AcceptAll),
//! )
//! .await?;
//! client.authenticate("alice", &Password).await?;
//!
//! let output = client.exec("uname -a").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//!
//! let sftp = client.sftp().await?;
//! for entry in sftp.list_directory(".").await? {
//!     println!("{}", entry.filename);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - Constant-time MAC verification
//! - Secure memory handling with `zeroize`
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
