//! SFTP data types: file attributes, permission modes and open flags.
//!
//! [`FileAttributes`] maps one-to-one onto the v3 `ATTRS` encoding. Every
//! field is optional and only fields whose presence bit is set on the wire
//! are populated, so a decoded value re-encodes to the same bytes.

use crate::ssh::wire;
use bytes::{BufMut, BytesMut};
use skerry_platform::{SkerryError, SkerryResult};
use std::fmt;
use std::ops::BitOr;

/// File attribute presence flags (SSH_FILEXFER_ATTR_*).
#[derive(Debug, Clone, Copy)]
pub struct AttrFlags;

impl AttrFlags {
    /// SSH_FILEXFER_ATTR_SIZE
    pub const SIZE: u32 = 0x00000001;
    /// SSH_FILEXFER_ATTR_UIDGID
    pub const UIDGID: u32 = 0x00000002;
    /// SSH_FILEXFER_ATTR_PERMISSIONS
    pub const PERMISSIONS: u32 = 0x00000004;
    /// SSH_FILEXFER_ATTR_ACMODTIME
    pub const ACMODTIME: u32 = 0x00000008;
    /// SSH_FILEXFER_ATTR_EXTENDED
    pub const EXTENDED: u32 = 0x80000000;

    /// Every flag defined by protocol version 3.
    pub const ALL: u32 =
        Self::SIZE | Self::UIDGID | Self::PERMISSIONS | Self::ACMODTIME | Self::EXTENDED;
}

/// Numeric owner of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
}

/// Access and modification times, in seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    /// Last access
    pub atime: u32,
    /// Last modification
    pub mtime: u32,
}

/// File attributes.
///
/// `None` means the server did not report the field. It is never
/// substituted with zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// File size in bytes
    pub size: Option<u64>,
    /// Owner and group
    pub owner: Option<Owner>,
    /// Raw mode: file type bits plus permission bits
    pub permissions: Option<u32>,
    /// Access and modification times
    pub times: Option<FileTimes>,
    /// Extension pairs, in wire order
    pub extensions: Option<Vec<(String, Vec<u8>)>>,
}

impl FileAttributes {
    /// Creates empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets the owner.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some(Owner { uid, gid });
        self
    }

    /// Sets the raw mode.
    pub fn with_permissions(mut self, mode: u32) -> Self {
        self.permissions = Some(mode);
        self
    }

    /// Sets access and modification times.
    pub fn with_times(mut self, atime: u32, mtime: u32) -> Self {
        self.times = Some(FileTimes { atime, mtime });
        self
    }

    /// Appends an extension pair.
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.extensions
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }

    /// The decoded mode, when permissions were reported.
    pub fn mode(&self) -> Option<FileMode> {
        self.permissions.map(FileMode::from_bits)
    }

    /// Presence flags for the fields that are set.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.owner.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }
        if self.extensions.is_some() {
            flags |= AttrFlags::EXTENDED;
        }
        flags
    }

    /// Appends the wire encoding to `buf`.
    ///
    /// ```text
    /// uint32   flags
    /// uint64   size            present if flag SIZE
    /// uint32   uid             present if flag UIDGID
    /// uint32   gid             present if flag UIDGID
    /// uint32   permissions     present if flag PERMISSIONS
    /// uint32   atime           present if flag ACMODTIME
    /// uint32   mtime           present if flag ACMODTIME
    /// uint32   extended_count  present if flag EXTENDED
    /// string   extended_type
    /// string   extended_data
    /// ...      more extended pairs
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.flags());
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some(owner) = self.owner {
            buf.put_u32(owner.uid);
            buf.put_u32(owner.gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let Some(times) = self.times {
            buf.put_u32(times.atime);
            buf.put_u32(times.mtime);
        }
        if let Some(extensions) = &self.extensions {
            buf.put_u32(extensions.len() as u32);
            for (name, value) in extensions {
                wire::write_string(buf, name);
                wire::write_bytes(buf, value);
            }
        }
    }

    /// Encodes to a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Decodes attributes starting at `offset`, advancing it.
    ///
    /// # Errors
    ///
    /// [`SkerryError::ProtocolViolation`] if the input is truncated or
    /// carries presence flags this protocol version does not define.
    pub fn decode(data: &[u8], offset: &mut usize) -> SkerryResult<Self> {
        let flags = wire::read_u32(data, offset)?;
        if flags & !AttrFlags::ALL != 0 {
            return Err(SkerryError::ProtocolViolation(format!(
                "Unknown attribute flags {:#010x}",
                flags & !AttrFlags::ALL
            )));
        }

        let mut attrs = Self::new();
        if flags & AttrFlags::SIZE != 0 {
            attrs.size = Some(wire::read_u64(data, offset)?);
        }
        if flags & AttrFlags::UIDGID != 0 {
            let uid = wire::read_u32(data, offset)?;
            let gid = wire::read_u32(data, offset)?;
            attrs.owner = Some(Owner { uid, gid });
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            attrs.permissions = Some(wire::read_u32(data, offset)?);
        }
        if flags & AttrFlags::ACMODTIME != 0 {
            let atime = wire::read_u32(data, offset)?;
            let mtime = wire::read_u32(data, offset)?;
            attrs.times = Some(FileTimes { atime, mtime });
        }
        if flags & AttrFlags::EXTENDED != 0 {
            let count = wire::read_u32(data, offset)?;
            // Each pair takes at least eight bytes; cap the allocation by what is left.
            let mut extensions = Vec::with_capacity((count as usize).min(data.len() / 8));
            for _ in 0..count {
                let name = wire::read_string(data, offset)?;
                let value = wire::read_bytes(data, offset)?;
                extensions.push((name, value));
            }
            attrs.extensions = Some(extensions);
        }
        Ok(attrs)
    }

    /// Decodes attributes that occupy all of `data`.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        let mut offset = 0;
        let attrs = Self::decode(data, &mut offset)?;
        if offset != data.len() {
            return Err(SkerryError::ProtocolViolation(format!(
                "{} trailing bytes after attributes",
                data.len() - offset
            )));
        }
        Ok(attrs)
    }
}

/// Kind of file, from the type bits of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Character device
    CharDevice,
    /// Block device
    BlockDevice,
    /// Named pipe
    Fifo,
    /// Unix domain socket
    Socket,
    /// No or unrecognized type bits
    Unknown,
}

/// A POSIX file mode.
///
/// Holds the raw mask and derives every facet from it, so the type bits
/// and permission bits can never disagree with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

impl FileMode {
    /// Mask of the file type bits
    pub const TYPE_MASK: u32 = 0o170000;
    /// Socket
    pub const SOCKET: u32 = 0o140000;
    /// Symbolic link
    pub const SYMLINK: u32 = 0o120000;
    /// Regular file
    pub const REGULAR: u32 = 0o100000;
    /// Block device
    pub const BLOCK_DEVICE: u32 = 0o060000;
    /// Directory
    pub const DIRECTORY: u32 = 0o040000;
    /// Character device
    pub const CHAR_DEVICE: u32 = 0o020000;
    /// Named pipe
    pub const FIFO: u32 = 0o010000;

    /// Mask of the nine rwx bits
    pub const PERMISSION_MASK: u32 = 0o777;
    /// Owner read
    pub const USER_READ: u32 = 0o400;
    /// Owner write
    pub const USER_WRITE: u32 = 0o200;
    /// Owner execute
    pub const USER_EXEC: u32 = 0o100;
    /// Group read
    pub const GROUP_READ: u32 = 0o040;
    /// Group write
    pub const GROUP_WRITE: u32 = 0o020;
    /// Group execute
    pub const GROUP_EXEC: u32 = 0o010;
    /// Others read
    pub const OTHER_READ: u32 = 0o004;
    /// Others write
    pub const OTHER_WRITE: u32 = 0o002;
    /// Others execute
    pub const OTHER_EXEC: u32 = 0o001;

    /// Default file permissions (0644 = rw-r--r--)
    pub const DEFAULT_FILE: u32 = 0o644;
    /// Default directory permissions (0755 = rwxr-xr-x)
    pub const DEFAULT_DIR: u32 = 0o755;

    /// Wraps a raw mode.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw mode.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// The nine rwx bits.
    pub const fn permissions(self) -> u32 {
        self.0 & Self::PERMISSION_MASK
    }

    /// Replaces the rwx bits, keeping type, setuid, setgid and sticky bits.
    pub const fn with_permissions(self, permissions: u32) -> Self {
        Self((self.0 & !Self::PERMISSION_MASK) | (permissions & Self::PERMISSION_MASK))
    }

    /// Parses a three-digit octal permission string such as `"755"`.
    ///
    /// # Errors
    ///
    /// [`SkerryError::InvalidArgument`] unless the input is exactly three
    /// digits in `0..=7`.
    pub fn parse_permissions(mode: &str) -> SkerryResult<u32> {
        let digits = mode.as_bytes();
        if digits.len() != 3 || !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
            return Err(SkerryError::InvalidArgument(format!(
                "Mode {:?} is not three octal digits",
                mode
            )));
        }
        Ok(digits
            .iter()
            .fold(0, |acc, d| (acc << 3) | u32::from(d - b'0')))
    }

    /// The file type encoded in the type bits.
    pub fn file_type(self) -> FileType {
        match self.0 & Self::TYPE_MASK {
            Self::REGULAR => FileType::Regular,
            Self::DIRECTORY => FileType::Directory,
            Self::SYMLINK => FileType::Symlink,
            Self::CHAR_DEVICE => FileType::CharDevice,
            Self::BLOCK_DEVICE => FileType::BlockDevice,
            Self::FIFO => FileType::Fifo,
            Self::SOCKET => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    /// Regular file.
    pub fn is_regular(self) -> bool {
        self.file_type() == FileType::Regular
    }

    /// Directory.
    pub fn is_dir(self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// Symbolic link.
    pub fn is_symlink(self) -> bool {
        self.file_type() == FileType::Symlink
    }

    /// Character device.
    pub fn is_char_device(self) -> bool {
        self.file_type() == FileType::CharDevice
    }

    /// Block device.
    pub fn is_block_device(self) -> bool {
        self.file_type() == FileType::BlockDevice
    }

    /// Named pipe.
    pub fn is_fifo(self) -> bool {
        self.file_type() == FileType::Fifo
    }

    /// Socket.
    pub fn is_socket(self) -> bool {
        self.file_type() == FileType::Socket
    }

    /// Owner may read.
    pub fn user_read(self) -> bool {
        self.has(Self::USER_READ)
    }

    /// Owner may write.
    pub fn user_write(self) -> bool {
        self.has(Self::USER_WRITE)
    }

    /// Owner may execute.
    pub fn user_exec(self) -> bool {
        self.has(Self::USER_EXEC)
    }

    /// Group may read.
    pub fn group_read(self) -> bool {
        self.has(Self::GROUP_READ)
    }

    /// Group may write.
    pub fn group_write(self) -> bool {
        self.has(Self::GROUP_WRITE)
    }

    /// Group may execute.
    pub fn group_exec(self) -> bool {
        self.has(Self::GROUP_EXEC)
    }

    /// Others may read.
    pub fn other_read(self) -> bool {
        self.has(Self::OTHER_READ)
    }

    /// Others may write.
    pub fn other_write(self) -> bool {
        self.has(Self::OTHER_WRITE)
    }

    /// Others may execute.
    pub fn other_exec(self) -> bool {
        self.has(Self::OTHER_EXEC)
    }
}

impl From<u32> for FileMode {
    fn from(bits: u32) -> Self {
        Self::from_bits(bits)
    }
}

/// `ls -l` style rendering, e.g. `drwxr-xr-x`.
impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const BITS: [(u32, char); 9] = [
            (FileMode::USER_READ, 'r'),
            (FileMode::USER_WRITE, 'w'),
            (FileMode::USER_EXEC, 'x'),
            (FileMode::GROUP_READ, 'r'),
            (FileMode::GROUP_WRITE, 'w'),
            (FileMode::GROUP_EXEC, 'x'),
            (FileMode::OTHER_READ, 'r'),
            (FileMode::OTHER_WRITE, 'w'),
            (FileMode::OTHER_EXEC, 'x'),
        ];

        let kind = match self.file_type() {
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::BlockDevice => 'b',
            FileType::CharDevice => 'c',
            FileType::Fifo => 'p',
            FileType::Socket => 's',
            FileType::Regular | FileType::Unknown => '-',
        };

        let mut s = String::with_capacity(10);
        s.push(kind);
        for (bit, ch) in BITS {
            s.push(if self.has(bit) { ch } else { '-' });
        }
        f.write_str(&s)
    }
}

/// File open flags (SSH_FXF_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// SSH_FXF_READ - Open for reading
    pub const READ: Self = Self(0x00000001);
    /// SSH_FXF_WRITE - Open for writing
    pub const WRITE: Self = Self(0x00000002);
    /// SSH_FXF_APPEND - Force writes to append
    pub const APPEND: Self = Self(0x00000004);
    /// SSH_FXF_CREAT - Create if it doesn't exist
    pub const CREATE: Self = Self(0x00000008);
    /// SSH_FXF_TRUNC - Truncate to 0 length
    pub const TRUNCATE: Self = Self(0x00000010);
    /// SSH_FXF_EXCL - Fail if the file exists
    pub const EXCLUSIVE: Self = Self(0x00000020);

    /// Wraps a raw flag word as received on the wire.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw flag word.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
