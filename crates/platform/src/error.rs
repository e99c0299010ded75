//! Error types for skerry.
//!
//! Every public operation in the workspace returns [`SkerryResult`]. The
//! variants follow the failure classes of an SSH client session:
//!
//! - **Transport-fatal**: [`SkerryError::Integrity`], [`SkerryError::ProtocolViolation`].
//!   The wire cannot be trusted afterwards and the session is torn down.
//! - **Establishment-fatal**: [`SkerryError::NegotiationFailure`],
//!   [`SkerryError::UntrustedHost`], [`SkerryError::AuthenticationFailure`].
//! - **Operation-local**: [`SkerryError::CommandTimeout`], [`SkerryError::File`],
//!   [`SkerryError::InvalidArgument`]. Sibling operations are unaffected.

use std::fmt;
use thiserror::Error;

/// Unified error type for all skerry operations.
#[derive(Debug, Error)]
pub enum SkerryError {
    /// I/O error on the underlying byte stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame failed its integrity check
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// The peer sent something the protocol does not allow
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No mutually supported algorithm in a required category
    #[error("Negotiation failed for {category}: client offered [{client}], server offered [{server}]")]
    NegotiationFailure {
        /// Algorithm category (e.g. "kex", "cipher c2s")
        category: String,
        /// Client name-list
        client: String,
        /// Server name-list
        server: String,
    },

    /// The host-trust collaborator rejected the server's host key
    #[error("Untrusted host key: {0}")]
    UntrustedHost(String),

    /// Every configured authentication method was exhausted
    #[error("Authentication failed (attempted: {})", .attempted.join(", "))]
    AuthenticationFailure {
        /// Methods attempted, in order
        attempted: Vec<String>,
    },

    /// An SFTP request did not complete before its deadline
    #[error("Request {request_id} timed out")]
    CommandTimeout {
        /// The id of the abandoned request
        request_id: u32,
    },

    /// A typed file-operation failure reported by the peer
    #[error("{kind}: {message}")]
    File {
        /// Failure class
        kind: FileErrorKind,
        /// Message supplied by the server
        message: String,
    },

    /// The peer's subsystem version is below what we support
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),

    /// Malformed caller input rejected before any wire interaction
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The session has been torn down
    #[error("Session closed: {reason}")]
    SessionClosed {
        /// Why the session ended
        reason: String,
    },

    /// The peer refused to open a channel
    #[error("Channel open failed ({reason_code}): {description}")]
    ChannelOpenFailed {
        /// SSH_OPEN_* reason code
        reason_code: u32,
        /// Description supplied by the server
        description: String,
    },

    /// The channel has already been closed
    #[error("Channel {channel} is closed")]
    ChannelClosed {
        /// Local channel id
        channel: u32,
    },

    /// The peer answered a channel request with failure
    #[error("Channel request rejected: {0}")]
    RequestRejected(String),

    /// Cryptographic provider failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SkerryError {
    /// Returns true if this error ends the session.
    ///
    /// Operation-local failures (timeouts, file errors, bad arguments,
    /// refused channel opens) leave the session usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SkerryError::Io(_)
                | SkerryError::Integrity(_)
                | SkerryError::ProtocolViolation(_)
                | SkerryError::NegotiationFailure { .. }
                | SkerryError::UntrustedHost(_)
                | SkerryError::AuthenticationFailure { .. }
                | SkerryError::SessionClosed { .. }
        )
    }

    /// Wraps this error as the cause of a closed session.
    pub fn into_session_closed(self) -> SkerryError {
        match self {
            closed @ SkerryError::SessionClosed { .. } => closed,
            other => SkerryError::SessionClosed {
                reason: other.to_string(),
            },
        }
    }
}

/// Classes of file-operation failure surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileErrorKind {
    /// The path does not exist
    NoSuchFile,
    /// The server refused access
    PermissionDenied,
    /// The server does not support the operation
    Unsupported,
    /// End of file or end of a directory listing
    EndOfFile,
    /// Any other failure
    Failure,
}

impl fmt::Display for FileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FileErrorKind::NoSuchFile => "No such file",
            FileErrorKind::PermissionDenied => "Permission denied",
            FileErrorKind::Unsupported => "Operation unsupported",
            FileErrorKind::EndOfFile => "End of file",
            FileErrorKind::Failure => "Failure",
        };
        f.write_str(text)
    }
}

/// Result type alias for skerry operations
pub type SkerryResult<T> = Result<T, SkerryError>;
