//! SSH connection protocol messages (RFC 4254).
//!
//! Every channel-scoped message is one variant of [`ChannelMessage`]:
//! - Channel open, confirmation and failure
//! - Flow control (window adjust)
//! - Data and extended data
//! - EOF and close
//! - Channel requests: exec, shell, subsystem, env, exit-status, exit-signal
//!
//! # Security
//!
//! - **Window size limits** - Windows never grow past [`MAX_WINDOW_SIZE`]
//! - **Maximum packet size** - Peers may not ask for more than [`MAX_PACKET_SIZE`]
//!
//! # Example
//!
//! ```rust
//! use skerry_proto::ssh::connection::{ChannelMessage, ChannelType};
//!
//! let open = ChannelMessage::Open {
//!     channel_type: ChannelType::Session,
//!     sender_channel: 0,
//!     initial_window_size: 2 * 1024 * 1024,
//!     maximum_packet_size: 32 * 1024,
//! };
//! let bytes = open.to_bytes();
//! assert_eq!(ChannelMessage::from_bytes(&bytes).unwrap(), open);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire;
use bytes::{BufMut, BytesMut};
use skerry_platform::{SkerryError, SkerryResult};

/// Maximum window size (RFC 4254 Section 5.2: 2^32 - 1).
pub const MAX_WINDOW_SIZE: u32 = u32::MAX;

/// Largest maximum packet size accepted from the peer (256 KB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Extended data type for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (exec, shell, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from the wire code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns a human-readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start the user's shell
    Shell,
    /// Start subsystem (e.g. "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Exit status of the remote command
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Remote command terminated by a signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
    /// Any other request; the type-specific data is kept raw
    Other {
        /// Request name
        name: String,
        /// Remaining bytes
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name.as_str(),
        }
    }
}

/// A channel-scoped message (RFC 4254 Sections 5 and 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// SSH_MSG_CHANNEL_OPEN
    Open {
        /// Channel type
        channel_type: ChannelType,
        /// Sender's channel id
        sender_channel: u32,
        /// Initial window size
        initial_window_size: u32,
        /// Maximum packet size
        maximum_packet_size: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    OpenConfirmation {
        /// Our channel id
        recipient_channel: u32,
        /// Peer's channel id
        sender_channel: u32,
        /// Peer's initial window
        initial_window_size: u32,
        /// Peer's maximum packet size
        maximum_packet_size: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    OpenFailure {
        /// Our channel id
        recipient_channel: u32,
        /// Reason code
        reason_code: u32,
        /// Description
        description: String,
    },
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    WindowAdjust {
        /// Recipient channel
        recipient_channel: u32,
        /// Bytes added to the window
        bytes_to_add: u32,
    },
    /// SSH_MSG_CHANNEL_DATA
    Data {
        /// Recipient channel
        recipient_channel: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ExtendedData {
        /// Recipient channel
        recipient_channel: u32,
        /// Data type code (1 = stderr)
        data_type: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EOF
    Eof {
        /// Recipient channel
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_CLOSE
    Close {
        /// Recipient channel
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_REQUEST
    Request {
        /// Recipient channel
        recipient_channel: u32,
        /// Request
        request: ChannelRequestType,
        /// Whether a reply is wanted
        want_reply: bool,
    },
    /// SSH_MSG_CHANNEL_SUCCESS
    Success {
        /// Recipient channel
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_FAILURE
    Failure {
        /// Recipient channel
        recipient_channel: u32,
    },
}

impl ChannelMessage {
    /// Returns true if `byte` is a channel-scoped message number.
    pub fn is_channel_message(byte: u8) -> bool {
        (MessageType::ChannelOpen as u8..=MessageType::ChannelFailure as u8).contains(&byte)
    }

    /// The local channel this message is addressed to, if any.
    pub fn recipient(&self) -> Option<u32> {
        match self {
            ChannelMessage::Open { .. } => None,
            ChannelMessage::OpenConfirmation {
                recipient_channel, ..
            }
            | ChannelMessage::OpenFailure {
                recipient_channel, ..
            }
            | ChannelMessage::WindowAdjust {
                recipient_channel, ..
            }
            | ChannelMessage::Data {
                recipient_channel, ..
            }
            | ChannelMessage::ExtendedData {
                recipient_channel, ..
            }
            | ChannelMessage::Eof { recipient_channel }
            | ChannelMessage::Close { recipient_channel }
            | ChannelMessage::Request {
                recipient_channel, ..
            }
            | ChannelMessage::Success { recipient_channel }
            | ChannelMessage::Failure { recipient_channel } => Some(*recipient_channel),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            ChannelMessage::Open {
                channel_type,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => {
                buf.put_u8(MessageType::ChannelOpen as u8);
                wire::write_string(&mut buf, channel_type.name());
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window_size);
                buf.put_u32(*maximum_packet_size);
                if let ChannelType::DirectTcpip {
                    host,
                    port,
                    originator_address,
                    originator_port,
                } = channel_type
                {
                    wire::write_string(&mut buf, host);
                    buf.put_u32(*port);
                    wire::write_string(&mut buf, originator_address);
                    buf.put_u32(*originator_port);
                }
            }
            ChannelMessage::OpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => {
                buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
                buf.put_u32(*recipient_channel);
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window_size);
                buf.put_u32(*maximum_packet_size);
            }
            ChannelMessage::OpenFailure {
                recipient_channel,
                reason_code,
                description,
            } => {
                buf.put_u8(MessageType::ChannelOpenFailure as u8);
                buf.put_u32(*recipient_channel);
                buf.put_u32(*reason_code);
                wire::write_string(&mut buf, description);
                wire::write_string(&mut buf, "");
            }
            ChannelMessage::WindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => {
                buf.put_u8(MessageType::ChannelWindowAdjust as u8);
                buf.put_u32(*recipient_channel);
                buf.put_u32(*bytes_to_add);
            }
            ChannelMessage::Data {
                recipient_channel,
                data,
            } => {
                buf.put_u8(MessageType::ChannelData as u8);
                buf.put_u32(*recipient_channel);
                wire::write_bytes(&mut buf, data);
            }
            ChannelMessage::ExtendedData {
                recipient_channel,
                data_type,
                data,
            } => {
                buf.put_u8(MessageType::ChannelExtendedData as u8);
                buf.put_u32(*recipient_channel);
                buf.put_u32(*data_type);
                wire::write_bytes(&mut buf, data);
            }
            ChannelMessage::Eof { recipient_channel } => {
                buf.put_u8(MessageType::ChannelEof as u8);
                buf.put_u32(*recipient_channel);
            }
            ChannelMessage::Close { recipient_channel } => {
                buf.put_u8(MessageType::ChannelClose as u8);
                buf.put_u32(*recipient_channel);
            }
            ChannelMessage::Request {
                recipient_channel,
                request,
                want_reply,
            } => {
                buf.put_u8(MessageType::ChannelRequest as u8);
                buf.put_u32(*recipient_channel);
                wire::write_string(&mut buf, request.name());
                wire::write_bool(&mut buf, *want_reply);
                match request {
                    ChannelRequestType::Env { name, value } => {
                        wire::write_string(&mut buf, name);
                        wire::write_string(&mut buf, value);
                    }
                    ChannelRequestType::Exec { command } => wire::write_string(&mut buf, command),
                    ChannelRequestType::Shell => {}
                    ChannelRequestType::Subsystem { name } => wire::write_string(&mut buf, name),
                    ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
                    ChannelRequestType::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                    } => {
                        wire::write_string(&mut buf, signal_name);
                        wire::write_bool(&mut buf, *core_dumped);
                        wire::write_string(&mut buf, error_message);
                        wire::write_string(&mut buf, "");
                    }
                    ChannelRequestType::Other { data, .. } => buf.put_slice(data),
                }
            }
            ChannelMessage::Success { recipient_channel } => {
                buf.put_u8(MessageType::ChannelSuccess as u8);
                buf.put_u32(*recipient_channel);
            }
            ChannelMessage::Failure { recipient_channel } => {
                buf.put_u8(MessageType::ChannelFailure as u8);
                buf.put_u32(*recipient_channel);
            }
        }
        buf.to_vec()
    }

    /// Parses a channel-scoped message.
    ///
    /// # Errors
    ///
    /// [`SkerryError::ProtocolViolation`] if the message is truncated or is
    /// not a channel message.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        let mut offset = 0;
        let kind = wire::read_u8(data, &mut offset)?;
        let message_type = MessageType::from_u8(kind)
            .filter(|_| Self::is_channel_message(kind))
            .ok_or_else(|| {
                SkerryError::ProtocolViolation(format!("Not a channel message: {}", kind))
            })?;

        let message = match message_type {
            MessageType::ChannelOpen => {
                let type_name = wire::read_string(data, &mut offset)?;
                let sender_channel = wire::read_u32(data, &mut offset)?;
                let initial_window_size = wire::read_u32(data, &mut offset)?;
                let maximum_packet_size = wire::read_u32(data, &mut offset)?;
                let channel_type = match type_name.as_str() {
                    "session" => ChannelType::Session,
                    "direct-tcpip" => ChannelType::DirectTcpip {
                        host: wire::read_string(data, &mut offset)?,
                        port: wire::read_u32(data, &mut offset)?,
                        originator_address: wire::read_string(data, &mut offset)?,
                        originator_port: wire::read_u32(data, &mut offset)?,
                    },
                    other => {
                        return Err(SkerryError::ProtocolViolation(format!(
                            "Unsupported channel type: '{}'",
                            other
                        )))
                    }
                };
                ChannelMessage::Open {
                    channel_type,
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                }
            }
            MessageType::ChannelOpenConfirmation => ChannelMessage::OpenConfirmation {
                recipient_channel: wire::read_u32(data, &mut offset)?,
                sender_channel: wire::read_u32(data, &mut offset)?,
                initial_window_size: wire::read_u32(data, &mut offset)?,
                maximum_packet_size: wire::read_u32(data, &mut offset)?,
            },
            MessageType::ChannelOpenFailure => {
                let recipient_channel = wire::read_u32(data, &mut offset)?;
                let reason_code = wire::read_u32(data, &mut offset)?;
                // Some servers omit the description and language tag.
                let description = wire::read_string(data, &mut offset).unwrap_or_default();
                ChannelMessage::OpenFailure {
                    recipient_channel,
                    reason_code,
                    description,
                }
            }
            MessageType::ChannelWindowAdjust => ChannelMessage::WindowAdjust {
                recipient_channel: wire::read_u32(data, &mut offset)?,
                bytes_to_add: wire::read_u32(data, &mut offset)?,
            },
            MessageType::ChannelData => ChannelMessage::Data {
                recipient_channel: wire::read_u32(data, &mut offset)?,
                data: wire::read_bytes(data, &mut offset)?,
            },
            MessageType::ChannelExtendedData => ChannelMessage::ExtendedData {
                recipient_channel: wire::read_u32(data, &mut offset)?,
                data_type: wire::read_u32(data, &mut offset)?,
                data: wire::read_bytes(data, &mut offset)?,
            },
            MessageType::ChannelEof => ChannelMessage::Eof {
                recipient_channel: wire::read_u32(data, &mut offset)?,
            },
            MessageType::ChannelClose => ChannelMessage::Close {
                recipient_channel: wire::read_u32(data, &mut offset)?,
            },
            MessageType::ChannelRequest => {
                let recipient_channel = wire::read_u32(data, &mut offset)?;
                let name = wire::read_string(data, &mut offset)?;
                let want_reply = wire::read_bool(data, &mut offset)?;
                let request = match name.as_str() {
                    "env" => ChannelRequestType::Env {
                        name: wire::read_string(data, &mut offset)?,
                        value: wire::read_string(data, &mut offset)?,
                    },
                    "exec" => ChannelRequestType::Exec {
                        command: wire::read_string(data, &mut offset)?,
                    },
                    "shell" => ChannelRequestType::Shell,
                    "subsystem" => ChannelRequestType::Subsystem {
                        name: wire::read_string(data, &mut offset)?,
                    },
                    "exit-status" => ChannelRequestType::ExitStatus {
                        exit_status: wire::read_u32(data, &mut offset)?,
                    },
                    "exit-signal" => ChannelRequestType::ExitSignal {
                        signal_name: wire::read_string(data, &mut offset)?,
                        core_dumped: wire::read_bool(data, &mut offset)?,
                        error_message: wire::read_string(data, &mut offset)?,
                    },
                    _ => ChannelRequestType::Other {
                        name,
                        data: data[offset..].to_vec(),
                    },
                };
                ChannelMessage::Request {
                    recipient_channel,
                    request,
                    want_reply,
                }
            }
            MessageType::ChannelSuccess => ChannelMessage::Success {
                recipient_channel: wire::read_u32(data, &mut offset)?,
            },
            MessageType::ChannelFailure => ChannelMessage::Failure {
                recipient_channel: wire::read_u32(data, &mut offset)?,
            },
            other => {
                return Err(SkerryError::ProtocolViolation(format!(
                    "Not a channel message: {}",
                    other
                )))
            }
        };
        Ok(message)
    }
}
