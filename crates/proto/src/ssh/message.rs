//! SSH message numbers and transport-generic messages (RFC 4253, RFC 4252, RFC 4254).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service request
//! - **Algorithm Negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key Exchange Method** (30-49): ECDH init/reply
//! - **User Authentication** (50-79): Requests, failures, method-specific 60-61
//! - **Connection Protocol** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use skerry_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! assert_eq!(MessageType::from_u8(94), Some(MessageType::ChannelData));
//! ```

use crate::ssh::wire;
use bytes::{BufMut, BytesMut};
use skerry_platform::{SkerryError, SkerryResult};

/// SSH message numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Disconnect - terminates the connection.
    Disconnect = 1,
    /// Ignore - padding or keepalive.
    Ignore = 2,
    /// Unimplemented - response to an unknown message number.
    Unimplemented = 3,
    /// Debug information.
    Debug = 4,
    /// Service request (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,
    /// Algorithm negotiation.
    KexInit = 20,
    /// Switch to the newly derived keys.
    NewKeys = 21,
    /// ECDH key exchange init (RFC 5656).
    KexEcdhInit = 30,
    /// ECDH key exchange reply.
    KexEcdhReply = 31,
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Method-specific 60: PK_OK for publickey, INFO_REQUEST for
    /// keyboard-interactive.
    UserauthPkOk = 60,
    /// Keyboard-interactive INFO_RESPONSE.
    UserauthInfoResponse = 61,
    /// Global request.
    GlobalRequest = 80,
    /// Global request success.
    RequestSuccess = 81,
    /// Global request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel request success.
    ChannelSuccess = 99,
    /// Channel request failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        let msg = match byte {
            1 => MessageType::Disconnect,
            2 => MessageType::Ignore,
            3 => MessageType::Unimplemented,
            4 => MessageType::Debug,
            5 => MessageType::ServiceRequest,
            6 => MessageType::ServiceAccept,
            20 => MessageType::KexInit,
            21 => MessageType::NewKeys,
            30 => MessageType::KexEcdhInit,
            31 => MessageType::KexEcdhReply,
            50 => MessageType::UserauthRequest,
            51 => MessageType::UserauthFailure,
            52 => MessageType::UserauthSuccess,
            53 => MessageType::UserauthBanner,
            60 => MessageType::UserauthPkOk,
            61 => MessageType::UserauthInfoResponse,
            80 => MessageType::GlobalRequest,
            81 => MessageType::RequestSuccess,
            82 => MessageType::RequestFailure,
            90 => MessageType::ChannelOpen,
            91 => MessageType::ChannelOpenConfirmation,
            92 => MessageType::ChannelOpenFailure,
            93 => MessageType::ChannelWindowAdjust,
            94 => MessageType::ChannelData,
            95 => MessageType::ChannelExtendedData,
            96 => MessageType::ChannelEof,
            97 => MessageType::ChannelClose,
            98 => MessageType::ChannelRequest,
            99 => MessageType::ChannelSuccess,
            100 => MessageType::ChannelFailure,
            _ => return None,
        };
        Some(msg)
    }

    /// Returns the RFC name of the message.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexEcdhInit => "SSH_MSG_KEX_ECDH_INIT",
            MessageType::KexEcdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }

    /// Returns true for messages allowed while a key exchange is running
    /// (RFC 4253 Section 7.1).
    pub fn is_kex_safe(byte: u8) -> bool {
        matches!(byte, 1..=4 | 20..=49)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Checks that a payload starts with the expected message number.
pub(crate) fn expect_type(data: &[u8], expected: MessageType) -> SkerryResult<()> {
    match data.first() {
        Some(&byte) if byte == expected as u8 => Ok(()),
        Some(&byte) => Err(SkerryError::ProtocolViolation(format!(
            "Expected {}, got message {}",
            expected, byte
        ))),
        None => Err(SkerryError::ProtocolViolation(format!(
            "Expected {}, got empty payload",
            expected
        ))),
    }
}

/// SSH_MSG_DISCONNECT reason codes (RFC 4253 Section 11.1).
pub mod disconnect_reason {
    /// Protocol error
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Key exchange failed
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// MAC error
    pub const MAC_ERROR: u32 = 5;
    /// Host key not verifiable
    pub const HOST_KEY_NOT_VERIFIABLE: u32 = 9;
    /// Disconnected by application
    pub const BY_APPLICATION: u32 = 11;
    /// No more authentication methods available
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
}

/// SSH_MSG_DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason_code: u32,
    /// Human-readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason_code: u32, description: impl Into<String>) -> Self {
        Self {
            reason_code,
            description: description.into(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        wire::write_string(&mut buf, &self.description);
        wire::write_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        expect_type(data, MessageType::Disconnect)?;
        let mut offset = 1;
        let reason_code = wire::read_u32(data, &mut offset)?;
        let description = wire::read_string(data, &mut offset)?;
        Ok(Self {
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_SERVICE_REQUEST payload.
pub fn service_request(service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::ServiceRequest as u8);
    wire::write_string(&mut buf, service);
    buf.to_vec()
}

/// Parses SSH_MSG_SERVICE_ACCEPT and returns the service name.
pub fn parse_service_accept(data: &[u8]) -> SkerryResult<String> {
    expect_type(data, MessageType::ServiceAccept)?;
    let mut offset = 1;
    wire::read_string(data, &mut offset)
}

/// SSH_MSG_IGNORE payload carrying `data`.
pub fn ignore(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Ignore as u8);
    wire::write_bytes(&mut buf, data);
    buf.to_vec()
}

/// SSH_MSG_UNIMPLEMENTED payload for the packet numbered `sequence`.
pub fn unimplemented(sequence: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence);
    buf.to_vec()
}
