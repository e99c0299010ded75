//! SFTP protocol messages.
//!
//! Every SFTP packet on the subsystem stream is framed as
//!
//! ```text
//! uint32    length      (type byte + body)
//! byte      type
//! byte[n]   body        (requests and responses start with uint32 id)
//! ```
//!
//! Requests and responses are closed sets, modelled as [`Request`] and
//! [`Response`]. [`PacketBuffer`] reassembles packets from channel data,
//! which may split or join them arbitrarily.

use super::types::{FileAttributes, OpenFlags};
use crate::ssh::wire;
use bytes::{Buf, BufMut, BytesMut};
use skerry_platform::{FileErrorKind, SkerryError, SkerryResult};

/// SFTP protocol version spoken by this client.
pub const SFTP_VERSION: u32 = 3;

/// Largest packet accepted from the server (type byte and body).
pub const MAX_PACKET_LEN: usize = 256 * 1024 + 1024;

/// SFTP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SftpMessageType {
    /// SSH_FXP_INIT - Initialize SFTP session
    Init = 1,
    /// SSH_FXP_VERSION - Version response
    Version = 2,
    /// SSH_FXP_OPEN - Open file
    Open = 3,
    /// SSH_FXP_CLOSE - Close file/directory
    Close = 4,
    /// SSH_FXP_READ - Read from file
    Read = 5,
    /// SSH_FXP_WRITE - Write to file
    Write = 6,
    /// SSH_FXP_LSTAT - Get file attributes (no follow symlinks)
    LStat = 7,
    /// SSH_FXP_FSTAT - Get file attributes by handle
    FStat = 8,
    /// SSH_FXP_SETSTAT - Set file attributes
    SetStat = 9,
    /// SSH_FXP_FSETSTAT - Set file attributes by handle
    FSetStat = 10,
    /// SSH_FXP_OPENDIR - Open directory
    OpenDir = 11,
    /// SSH_FXP_READDIR - Read directory
    ReadDir = 12,
    /// SSH_FXP_REMOVE - Remove file
    Remove = 13,
    /// SSH_FXP_MKDIR - Create directory
    MkDir = 14,
    /// SSH_FXP_RMDIR - Remove directory
    RmDir = 15,
    /// SSH_FXP_REALPATH - Canonicalize path
    RealPath = 16,
    /// SSH_FXP_STAT - Get file attributes
    Stat = 17,
    /// SSH_FXP_RENAME - Rename file/directory
    Rename = 18,
    /// SSH_FXP_READLINK - Read symbolic link
    ReadLink = 19,
    /// SSH_FXP_SYMLINK - Create symbolic link
    Symlink = 20,

    // Response messages
    /// SSH_FXP_STATUS - Status response
    Status = 101,
    /// SSH_FXP_HANDLE - File handle response
    Handle = 102,
    /// SSH_FXP_DATA - Data response
    Data = 103,
    /// SSH_FXP_NAME - Name response
    Name = 104,
    /// SSH_FXP_ATTRS - Attributes response
    Attrs = 105,

    // Extended messages
    /// SSH_FXP_EXTENDED - Extended request
    Extended = 200,
    /// SSH_FXP_EXTENDED_REPLY - Extended response
    ExtendedReply = 201,
}

impl SftpMessageType {
    /// Convert from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            7 => Some(Self::LStat),
            8 => Some(Self::FStat),
            9 => Some(Self::SetStat),
            10 => Some(Self::FSetStat),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            16 => Some(Self::RealPath),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            19 => Some(Self::ReadLink),
            20 => Some(Self::Symlink),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            200 => Some(Self::Extended),
            201 => Some(Self::ExtendedReply),
            _ => None,
        }
    }
}

/// One framed SFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpMessage {
    /// Message type
    pub msg_type: SftpMessageType,
    /// Message body, after the type byte
    pub payload: Vec<u8>,
}

impl SftpMessage {
    /// Creates a new SFTP message.
    pub fn new(msg_type: SftpMessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Serializes to bytes, including the length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.put_u32((self.payload.len() + 1) as u32);
        buf.put_u8(self.msg_type as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses one complete packet, length prefix included.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        let mut offset = 0;
        let length = wire::read_u32(data, &mut offset)? as usize;
        if data.len() != 4 + length {
            return Err(SkerryError::ProtocolViolation(format!(
                "SFTP length {} does not match {} bytes",
                length,
                data.len() - 4
            )));
        }
        Self::from_body(&data[4..])
    }

    /// Parses the type byte and body of a packet whose length prefix was
    /// already consumed.
    fn from_body(body: &[u8]) -> SkerryResult<Self> {
        let (&kind, payload) = body
            .split_first()
            .ok_or_else(|| SkerryError::ProtocolViolation("Empty SFTP packet".to_string()))?;
        let msg_type = SftpMessageType::from_u8(kind).ok_or_else(|| {
            SkerryError::ProtocolViolation(format!("Unknown SFTP message type: {}", kind))
        })?;
        Ok(Self::new(msg_type, payload.to_vec()))
    }
}

/// Reassembles SFTP packets from a byte stream.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: BytesMut,
}

impl PacketBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes received from the channel.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as packets.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Takes the next complete packet, if one is buffered.
    ///
    /// # Errors
    ///
    /// [`SkerryError::ProtocolViolation`] on a zero or oversized length, or
    /// an unknown message type.
    pub fn next_message(&mut self) -> SkerryResult<Option<SftpMessage>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length == 0 || length > MAX_PACKET_LEN {
            return Err(SkerryError::ProtocolViolation(format!(
                "Invalid SFTP packet length {}",
                length
            )));
        }
        if self.buf.len() < 4 + length {
            return Ok(None);
        }

        self.buf.advance(4);
        let body = self.buf.split_to(length);
        SftpMessage::from_body(&body).map(Some)
    }
}

/// SFTP status codes (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// SSH_FX_OK - Success
    Ok = 0,
    /// SSH_FX_EOF - End of file
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE - No such file
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED - Permission denied
    PermissionDenied = 3,
    /// SSH_FX_FAILURE - General failure
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE - Bad message
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION - No connection
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST - Connection lost
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED - Operation not supported
    OpUnsupported = 8,
}

impl StatusCode {
    /// Convert from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            _ => None,
        }
    }

    /// The failure class reported to callers.
    pub fn error_kind(self) -> FileErrorKind {
        match self {
            Self::Eof => FileErrorKind::EndOfFile,
            Self::NoSuchFile => FileErrorKind::NoSuchFile,
            Self::PermissionDenied => FileErrorKind::PermissionDenied,
            Self::OpUnsupported => FileErrorKind::Unsupported,
            Self::Ok
            | Self::Failure
            | Self::BadMessage
            | Self::NoConnection
            | Self::ConnectionLost => FileErrorKind::Failure,
        }
    }
}

/// Body of an SSH_FXP_STATUS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Raw status code
    pub code: u32,
    /// Human-readable message
    pub message: String,
    /// Language tag of the message
    pub language: String,
}

impl Status {
    /// Creates a status with an empty language tag.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: code as u32,
            message: message.into(),
            language: String::new(),
        }
    }

    /// Returns true for SSH_FX_OK.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok as u32
    }

    /// Converts to a typed failure. Unknown codes are generic failures.
    pub fn into_error(self) -> SkerryError {
        let kind = StatusCode::from_u32(self.code)
            .map(StatusCode::error_kind)
            .unwrap_or(FileErrorKind::Failure);
        SkerryError::File {
            kind,
            message: self.message,
        }
    }

    /// `Ok(())` for SSH_FX_OK, the typed failure otherwise.
    pub fn into_result(self) -> SkerryResult<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }
}

/// One entry of an SSH_FXP_NAME response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// File name (a bare name for listings, a full path for realpath)
    pub filename: String,
    /// `ls -l` style line produced by the server
    pub longname: String,
    /// Attributes; may be empty
    pub attrs: FileAttributes,
}

/// A client request, without its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// SSH_FXP_OPEN
    Open {
        /// Path to open
        path: String,
        /// SSH_FXF_* flags
        flags: OpenFlags,
        /// Attributes for a newly created file
        attrs: FileAttributes,
    },
    /// SSH_FXP_CLOSE
    Close {
        /// Handle to release
        handle: Vec<u8>,
    },
    /// SSH_FXP_READ
    Read {
        /// File handle
        handle: Vec<u8>,
        /// Byte offset
        offset: u64,
        /// Maximum bytes to return
        len: u32,
    },
    /// SSH_FXP_WRITE
    Write {
        /// File handle
        handle: Vec<u8>,
        /// Byte offset
        offset: u64,
        /// Bytes to write
        data: Vec<u8>,
    },
    /// SSH_FXP_LSTAT
    LStat {
        /// Path, not followed if a link
        path: String,
    },
    /// SSH_FXP_FSTAT
    FStat {
        /// Open handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_SETSTAT
    SetStat {
        /// Target path
        path: String,
        /// Attributes to apply
        attrs: FileAttributes,
    },
    /// SSH_FXP_FSETSTAT
    FSetStat {
        /// Open handle
        handle: Vec<u8>,
        /// Attributes to apply
        attrs: FileAttributes,
    },
    /// SSH_FXP_OPENDIR
    OpenDir {
        /// Directory path
        path: String,
    },
    /// SSH_FXP_READDIR
    ReadDir {
        /// Directory handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_REMOVE
    Remove {
        /// File to remove
        path: String,
    },
    /// SSH_FXP_MKDIR
    MkDir {
        /// Directory to create
        path: String,
        /// Initial attributes
        attrs: FileAttributes,
    },
    /// SSH_FXP_RMDIR
    RmDir {
        /// Directory to remove
        path: String,
    },
    /// SSH_FXP_REALPATH
    RealPath {
        /// Path to canonicalize
        path: String,
    },
    /// SSH_FXP_STAT
    Stat {
        /// Path, followed if a link
        path: String,
    },
    /// SSH_FXP_RENAME
    Rename {
        /// Existing path
        old_path: String,
        /// New path
        new_path: String,
    },
    /// SSH_FXP_READLINK
    ReadLink {
        /// Link path
        path: String,
    },
    /// SSH_FXP_SYMLINK
    Symlink {
        /// Path of the link to create
        link_path: String,
        /// Path the link points to
        target_path: String,
        /// Send the target first, as OpenSSH's sftp-server expects
        reversed: bool,
    },
}

impl Request {
    /// The packet type of this request.
    pub fn message_type(&self) -> SftpMessageType {
        match self {
            Request::Open { .. } => SftpMessageType::Open,
            Request::Close { .. } => SftpMessageType::Close,
            Request::Read { .. } => SftpMessageType::Read,
            Request::Write { .. } => SftpMessageType::Write,
            Request::LStat { .. } => SftpMessageType::LStat,
            Request::FStat { .. } => SftpMessageType::FStat,
            Request::SetStat { .. } => SftpMessageType::SetStat,
            Request::FSetStat { .. } => SftpMessageType::FSetStat,
            Request::OpenDir { .. } => SftpMessageType::OpenDir,
            Request::ReadDir { .. } => SftpMessageType::ReadDir,
            Request::Remove { .. } => SftpMessageType::Remove,
            Request::MkDir { .. } => SftpMessageType::MkDir,
            Request::RmDir { .. } => SftpMessageType::RmDir,
            Request::RealPath { .. } => SftpMessageType::RealPath,
            Request::Stat { .. } => SftpMessageType::Stat,
            Request::Rename { .. } => SftpMessageType::Rename,
            Request::ReadLink { .. } => SftpMessageType::ReadLink,
            Request::Symlink { .. } => SftpMessageType::Symlink,
        }
    }

    /// Builds the framed packet for request `id`.
    pub fn to_message(&self, id: u32) -> SftpMessage {
        let mut buf = BytesMut::new();
        buf.put_u32(id);
        match self {
            Request::Open { path, flags, attrs } => {
                wire::write_string(&mut buf, path);
                buf.put_u32(flags.bits());
                attrs.encode(&mut buf);
            }
            Request::Close { handle }
            | Request::FStat { handle }
            | Request::ReadDir { handle } => wire::write_bytes(&mut buf, handle),
            Request::Read { handle, offset, len } => {
                wire::write_bytes(&mut buf, handle);
                buf.put_u64(*offset);
                buf.put_u32(*len);
            }
            Request::Write {
                handle,
                offset,
                data,
            } => {
                wire::write_bytes(&mut buf, handle);
                buf.put_u64(*offset);
                wire::write_bytes(&mut buf, data);
            }
            Request::LStat { path }
            | Request::OpenDir { path }
            | Request::Remove { path }
            | Request::RmDir { path }
            | Request::RealPath { path }
            | Request::Stat { path }
            | Request::ReadLink { path } => wire::write_string(&mut buf, path),
            Request::SetStat { path, attrs } | Request::MkDir { path, attrs } => {
                wire::write_string(&mut buf, path);
                attrs.encode(&mut buf);
            }
            Request::FSetStat { handle, attrs } => {
                wire::write_bytes(&mut buf, handle);
                attrs.encode(&mut buf);
            }
            Request::Rename { old_path, new_path } => {
                wire::write_string(&mut buf, old_path);
                wire::write_string(&mut buf, new_path);
            }
            Request::Symlink {
                link_path,
                target_path,
                reversed,
            } => {
                let (first, second) = if *reversed {
                    (target_path, link_path)
                } else {
                    (link_path, target_path)
                };
                wire::write_string(&mut buf, first);
                wire::write_string(&mut buf, second);
            }
        }
        SftpMessage::new(self.message_type(), buf.to_vec())
    }
}

/// A server response, without its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// SSH_FXP_STATUS
    Status(Status),
    /// SSH_FXP_HANDLE
    Handle(Vec<u8>),
    /// SSH_FXP_DATA
    Data(Vec<u8>),
    /// SSH_FXP_NAME
    Name(Vec<NameEntry>),
    /// SSH_FXP_ATTRS
    Attrs(FileAttributes),
    /// SSH_FXP_EXTENDED_REPLY
    ExtendedReply(Vec<u8>),
}

impl Response {
    /// Decodes a response packet into its request id and body.
    ///
    /// # Errors
    ///
    /// [`SkerryError::ProtocolViolation`] for request-only packet types,
    /// truncated bodies or trailing bytes.
    pub fn decode(message: &SftpMessage) -> SkerryResult<(u32, Self)> {
        let data = &message.payload;
        let mut offset = 0;
        let id = wire::read_u32(data, &mut offset)?;

        let response = match message.msg_type {
            SftpMessageType::Status => {
                let code = wire::read_u32(data, &mut offset)?;
                // Some servers omit the message and language tag.
                let (message, language) = if offset < data.len() {
                    let message = wire::read_string(data, &mut offset)?;
                    let language = wire::read_string(data, &mut offset)?;
                    (message, language)
                } else {
                    (String::new(), String::new())
                };
                Response::Status(Status {
                    code,
                    message,
                    language,
                })
            }
            SftpMessageType::Handle => Response::Handle(wire::read_bytes(data, &mut offset)?),
            SftpMessageType::Data => Response::Data(wire::read_bytes(data, &mut offset)?),
            SftpMessageType::Name => {
                let count = wire::read_u32(data, &mut offset)?;
                let mut entries = Vec::with_capacity((count as usize).min(data.len() / 12));
                for _ in 0..count {
                    let filename = wire::read_string(data, &mut offset)?;
                    let longname = wire::read_string(data, &mut offset)?;
                    let attrs = FileAttributes::decode(data, &mut offset)?;
                    entries.push(NameEntry {
                        filename,
                        longname,
                        attrs,
                    });
                }
                Response::Name(entries)
            }
            SftpMessageType::Attrs => Response::Attrs(FileAttributes::decode(data, &mut offset)?),
            SftpMessageType::ExtendedReply => {
                let body = data[offset..].to_vec();
                offset = data.len();
                Response::ExtendedReply(body)
            }
            other => {
                return Err(SkerryError::ProtocolViolation(format!(
                    "Unexpected SFTP packet {:?} from server",
                    other
                )))
            }
        };

        if offset != data.len() {
            return Err(SkerryError::ProtocolViolation(format!(
                "{} trailing bytes in SFTP response {}",
                data.len() - offset,
                id
            )));
        }
        Ok((id, response))
    }

    /// Short name for log and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Response::Status(_) => "STATUS",
            Response::Handle(_) => "HANDLE",
            Response::Data(_) => "DATA",
            Response::Name(_) => "NAME",
            Response::Attrs(_) => "ATTRS",
            Response::ExtendedReply(_) => "EXTENDED_REPLY",
        }
    }
}

/// Builds SSH_FXP_INIT.
pub fn init(version: u32) -> SftpMessage {
    SftpMessage::new(SftpMessageType::Init, version.to_be_bytes().to_vec())
}

/// Contents of SSH_FXP_VERSION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Version offered by the server
    pub version: u32,
    /// Extension name/data pairs
    pub extensions: Vec<(String, String)>,
}

impl VersionInfo {
    /// Parses SSH_FXP_VERSION.
    pub fn decode(message: &SftpMessage) -> SkerryResult<Self> {
        if message.msg_type != SftpMessageType::Version {
            return Err(SkerryError::ProtocolViolation(format!(
                "Expected SFTP VERSION, got {:?}",
                message.msg_type
            )));
        }

        let data = &message.payload;
        let mut offset = 0;
        let version = wire::read_u32(data, &mut offset)?;
        let mut extensions = Vec::new();
        while offset < data.len() {
            let name = wire::read_string(data, &mut offset)?;
            let value = wire::read_bytes(data, &mut offset)?;
            extensions.push((name, String::from_utf8_lossy(&value).into_owned()));
        }
        Ok(Self {
            version,
            extensions,
        })
    }

    /// Builds SSH_FXP_VERSION.
    pub fn to_message(&self) -> SftpMessage {
        let mut buf = BytesMut::new();
        buf.put_u32(self.version);
        for (name, value) in &self.extensions {
            wire::write_string(&mut buf, name);
            wire::write_string(&mut buf, value);
        }
        SftpMessage::new(SftpMessageType::Version, buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(SftpMessageType::from_u8(1), Some(SftpMessageType::Init));
        assert_eq!(SftpMessageType::from_u8(101), Some(SftpMessageType::Status));
        assert_eq!(SftpMessageType::from_u8(255), None);
    }

    #[test]
    fn test_init_serialization() {
        let bytes = init(SFTP_VERSION).to_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 5, 1, 0, 0, 0, 3]);
        assert_eq!(SftpMessage::from_bytes(&bytes).unwrap(), init(3));
    }

    #[test]
    fn test_request_layout() {
        let request = Request::Read {
            handle: b"h1".to_vec(),
            offset: 4096,
            len: 512,
        };
        let bytes = request.to_message(7).to_bytes();

        let mut expected = vec![0, 0, 0, 23, SftpMessageType::Read as u8];
        expected.extend_from_slice(&7u32.to_be_bytes());
        expected.extend_from_slice(&[0, 0, 0, 2, b'h', b'1']);
        expected.extend_from_slice(&4096u64.to_be_bytes());
        expected.extend_from_slice(&512u32.to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_symlink_argument_order() {
        let request = |reversed| Request::Symlink {
            link_path: "link".to_string(),
            target_path: "target".to_string(),
            reversed,
        };

        let openssh = request(true).to_message(1).payload;
        let mut offset = 4;
        assert_eq!(wire::read_string(&openssh, &mut offset).unwrap(), "target");

        let draft = request(false).to_message(1).payload;
        let mut offset = 4;
        assert_eq!(wire::read_string(&draft, &mut offset).unwrap(), "link");
    }

    #[test]
    fn test_status_decoding_and_taxonomy() {
        let mut payload = BytesMut::new();
        payload.put_u32(9);
        payload.put_u32(StatusCode::NoSuchFile as u32);
        wire::write_string(&mut payload, "no such file");
        wire::write_string(&mut payload, "en");
        let message = SftpMessage::new(SftpMessageType::Status, payload.to_vec());

        let (id, response) = Response::decode(&message).unwrap();
        assert_eq!(id, 9);
        let Response::Status(status) = response else {
            panic!("expected status");
        };
        assert!(!status.is_ok());
        match status.into_error() {
            SkerryError::File { kind, message } => {
                assert_eq!(kind, FileErrorKind::NoSuchFile);
                assert_eq!(message, "no such file");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(StatusCode::Eof.error_kind(), FileErrorKind::EndOfFile);
        assert_eq!(StatusCode::OpUnsupported.error_kind(), FileErrorKind::Unsupported);
        assert_eq!(StatusCode::BadMessage.error_kind(), FileErrorKind::Failure);
        let unknown = Status {
            code: 77,
            message: String::new(),
            language: String::new(),
        };
        assert!(matches!(
            unknown.into_error(),
            SkerryError::File { kind: FileErrorKind::Failure, .. }
        ));
    }

    #[test]
    fn test_short_status_accepted() {
        let message = SftpMessage::new(SftpMessageType::Status, vec![0, 0, 0, 1, 0, 0, 0, 0]);
        let (id, response) = Response::decode(&message).unwrap();
        assert_eq!(id, 1);
        assert!(matches!(response, Response::Status(status) if status.is_ok()));
    }

    #[test]
    fn test_name_response_decoding() {
        let mut payload = BytesMut::new();
        payload.put_u32(3);
        payload.put_u32(2);
        for name in ["a.txt", "b"] {
            wire::write_string(&mut payload, name);
            wire::write_string(&mut payload, "");
            FileAttributes::new().with_size(1).encode(&mut payload);
        }
        let message = SftpMessage::new(SftpMessageType::Name, payload.to_vec());

        let (_, response) = Response::decode(&message).unwrap();
        let Response::Name(entries) = response else {
            panic!("expected name");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].filename, "b");
        assert_eq!(entries[1].attrs.size, Some(1));
    }

    #[test]
    fn test_request_type_from_server_rejected() {
        let message = SftpMessage::new(SftpMessageType::Open, vec![0, 0, 0, 1]);
        assert!(matches!(
            Response::decode(&message),
            Err(SkerryError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let message = SftpMessage::new(SftpMessageType::Handle, vec![0, 0, 0, 1, 0, 0, 0, 1, b'h', 0]);
        assert!(matches!(
            Response::decode(&message),
            Err(SkerryError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_packet_buffer_reassembles_split_and_joined_packets() {
        let first = init(3).to_bytes();
        let second = VersionInfo {
            version: 3,
            extensions: vec![("posix-rename@openssh.com".to_string(), "1".to_string())],
        }
        .to_message()
        .to_bytes();

        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut buffer = PacketBuffer::new();
        buffer.extend(&stream[..3]);
        assert_eq!(buffer.next_message().unwrap(), None);
        buffer.extend(&stream[3..]);

        assert_eq!(buffer.next_message().unwrap(), Some(init(3)));
        let version = buffer.next_message().unwrap().unwrap();
        let info = VersionInfo::decode(&version).unwrap();
        assert_eq!(info.extensions[0].0, "posix-rename@openssh.com");
        assert_eq!(buffer.next_message().unwrap(), None);
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn test_packet_buffer_rejects_bad_lengths() {
        let mut buffer = PacketBuffer::new();
        buffer.extend(&[0, 0, 0, 0]);
        assert!(buffer.next_message().is_err());

        let mut buffer = PacketBuffer::new();
        buffer.extend(&((MAX_PACKET_LEN + 1) as u32).to_be_bytes());
        assert!(buffer.next_message().is_err());
    }
}
