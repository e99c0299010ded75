//! SSH (Secure Shell) client protocol implementation.
//!
//! This module implements the client side of RFC 4251-4254 and SFTP v3.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire encoding** ([`wire`], [`message`]) - RFC 4251 data types and message numbers
//! 2. **Packet layer** ([`packet`], [`compression`], [`crypto`]) - Binary packet
//!    protocol with pluggable ciphers and MACs (RFC 4253 Section 6)
//! 3. **Transport** ([`version`], [`kex`], [`transport`]) - Version exchange,
//!    algorithm negotiation, key exchange and re-keying (RFC 4253)
//! 4. **Authentication** ([`auth`]) - User authentication (RFC 4252)
//! 5. **Connection** ([`connection`], [`channel`]) - Channel multiplexing (RFC 4254)
//! 6. **Session** ([`client`], [`session`]) - The public client, lifecycle events
//!    and keep-alive
//! 7. **SFTP** ([`sftp`]) - File transfer over the "sftp" subsystem
//!
//! Internally one dispatcher task reads the wire and one lock serializes
//! every outbound frame.
//!
//! # Security Considerations
//!
//! - **Input Validation**: Packet lengths, padding and every decoded field
//!   are bounds-checked; violations end the session
//! - **Constant-Time Operations**: MAC tags are compared in constant time
//! - **Memory Safety**: Key material is zeroized on drop using [`zeroize`]
//! - **Host Trust**: No session proceeds until the caller's trust policy
//!   accepts the server's host key
//! - **No Unsafe Code**: Pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust
//! use skerry_proto::ssh::packet::Packet;
//!
//! let packet = Packet::new(b"SSH-MSG-KEXINIT payload".to_vec()).unwrap();
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-KEXINIT payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod channel;
pub mod client;
pub mod compression;
pub mod connection;
pub mod connection_mgr;
pub mod crypto;
mod dispatcher;
pub mod kex;
pub mod message;
pub mod packet;
pub mod session;
pub mod sftp;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{AuthReport, Authenticator};
pub use channel::{ChannelEvent, ChannelReader, ChannelWriter, SshChannel};
pub use client::{ExecOutput, SshClient, SshClientConfig};
pub use compression::Compression;
pub use connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
pub use crypto::{CryptoProvider, DefaultCryptoProvider};
pub use kex::{negotiate_algorithm, KexInit, Negotiated, NewKeys};
pub use message::MessageType;
pub use packet::Packet;
pub use session::SessionEvent;
pub use sftp::{FileAttributes, FileMode, OpenFlags, RemoteFile, SftpClient, SftpConfig};
pub use transport::TransportConfig;
pub use version::Version;
