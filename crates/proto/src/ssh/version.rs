//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides send an identification string before any binary packet:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server may send other lines before its identification string; they
//! are skipped.
//!
//! # Security
//!
//! - Maximum identification line length: 255 characters
//! - At most [`MAX_PRE_BANNER_LINES`] lines before the identification string,
//!   each up to [`MAX_PRE_BANNER_LINE_LENGTH`] bytes
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed
//!
//! # Example
//!
//! ```rust
//! use skerry_proto::ssh::version::Version;
//!
//! let version = Version::new("skerry_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-skerry_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6 Debian").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! assert_eq!(parsed.comments(), Some("Debian"));
//! ```

use skerry_platform::{SkerryError, SkerryResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum length of an identification line, excluding CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of lines accepted before the identification string.
pub const MAX_PRE_BANNER_LINES: usize = 64;

/// Maximum length of a line preceding the identification string.
pub const MAX_PRE_BANNER_LINE_LENGTH: usize = 8192;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an identification with protocol version "2.0".
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns this library's identification.
    pub fn default_skerry() -> Self {
        Self::new(&format!("skerry_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (with or without CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`SkerryError::ProtocolViolation`] if the line is too long,
    /// contains a null byte or does not start with "SSH-", and
    /// [`SkerryError::UnsupportedVersion`] for protocol versions other than
    /// "2.0" and "1.99".
    pub fn parse(line: &str) -> SkerryResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkerryError::ProtocolViolation(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SkerryError::ProtocolViolation(
                "Version string contains null byte".to_string(),
            ));
        }

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            SkerryError::ProtocolViolation(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            ))
        })?;

        let (proto_version, rest) = rest.split_once('-').ok_or_else(|| {
            SkerryError::ProtocolViolation(format!("Invalid version string format: '{}'", line))
        })?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SkerryError::UnsupportedVersion(format!(
                "SSH protocol '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g. "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g. "OpenSSH_9.6").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Result of the identification exchange.
///
/// The raw lines (without CR LF) feed the key exchange hash, so they are
/// kept exactly as sent and received.
#[derive(Debug, Clone)]
pub struct Identification {
    /// Our identification line
    pub local: String,
    /// The server's identification line
    pub remote: String,
    /// Parsed server identification
    pub remote_version: Version,
}

/// Sends our identification and reads the server's.
///
/// Reads one byte at a time so that no binary packet data following the
/// identification line is consumed.
pub async fn exchange<S>(stream: &mut S, local: &Version) -> SkerryResult<Identification>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&local.to_wire_format()).await?;
    stream.flush().await?;

    for _ in 0..=MAX_PRE_BANNER_LINES {
        let line = read_line(stream).await?;
        if line.starts_with(b"SSH-") {
            if line.len() > MAX_VERSION_LENGTH {
                return Err(SkerryError::ProtocolViolation(
                    "Identification line too long".to_string(),
                ));
            }
            let line = String::from_utf8(line).map_err(|_| {
                SkerryError::ProtocolViolation("Identification line is not UTF-8".to_string())
            })?;
            let remote_version = Version::parse(&line)?;
            debug!("Server identification: {}", line);
            return Ok(Identification {
                local: local.to_string(),
                remote: line,
                remote_version,
            });
        }
        debug!(
            "Skipping pre-identification line: {}",
            String::from_utf8_lossy(&line)
        );
    }

    Err(SkerryError::ProtocolViolation(format!(
        "No identification string within {} lines",
        MAX_PRE_BANNER_LINES
    )))
}

/// Reads one line without its CR LF.
///
/// The cap is the looser pre-identification limit; the caller applies the
/// identification limit once it knows which kind of line this is.
async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> SkerryResult<Vec<u8>> {
    let mut buffer = Vec::with_capacity(64);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        buffer.push(byte);
        if buffer.len() > MAX_PRE_BANNER_LINE_LENGTH + 1 {
            return Err(SkerryError::ProtocolViolation(
                "Line before identification too long".to_string(),
            ));
        }
    }
    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        let version = Version::new("skerry_0.1.0", Some("client"));
        assert_eq!(version.to_string(), "SSH-2.0-skerry_0.1.0 client");
        assert_eq!(version.to_wire_format(), b"SSH-2.0-skerry_0.1.0 client\r\n");
    }

    #[test]
    fn test_version_parse_with_crlf() {
        let version = Version::parse("SSH-1.99-OpenSSH_8.9\r\n").unwrap();
        assert_eq!(version.proto_version(), "1.99");
        assert_eq!(version.software(), "OpenSSH_8.9");
    }

    #[test]
    fn test_version_parse_invalid_prefix() {
        let result = Version::parse("INVALID-2.0-Test");
        assert!(matches!(result, Err(SkerryError::ProtocolViolation(_))));
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        let result = Version::parse("SSH-1.5-OldServer");
        assert!(matches!(result, Err(SkerryError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_version_parse_too_long() {
        let long_string = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long_string).is_err());
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
    }

    #[tokio::test]
    async fn test_exchange_skips_banner_lines() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"Welcome to the host\r\nSSH-2.0-OpenSSH_9.6 Debian\r\n\x00\x00")
            .await
            .unwrap();

        let ident = exchange(&mut client, &Version::new("skerry_test", None))
            .await
            .unwrap();
        assert_eq!(ident.local, "SSH-2.0-skerry_test");
        assert_eq!(ident.remote, "SSH-2.0-OpenSSH_9.6 Debian");
        assert_eq!(ident.remote_version.software(), "OpenSSH_9.6");

        // Binary data after the identification line is left unread.
        assert_eq!(client.read_u16().await.unwrap(), 0);

        let mut sent = vec![0u8; 21];
        server.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, b"SSH-2.0-skerry_test\r\n");
    }

    #[tokio::test]
    async fn test_exchange_accepts_long_banner_lines() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let notice = format!("NOTICE: {}\r\n", "authorized use only ".repeat(30));
        assert!(notice.len() > MAX_VERSION_LENGTH);
        server.write_all(notice.as_bytes()).await.unwrap();
        server.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();

        let ident = exchange(&mut client, &Version::new("skerry_test", None))
            .await
            .unwrap();
        assert_eq!(ident.remote, "SSH-2.0-OpenSSH_9.6");
    }

    #[tokio::test]
    async fn test_exchange_rejects_long_identification() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let line = format!("SSH-2.0-{}\r\n", "A".repeat(300));
        server.write_all(line.as_bytes()).await.unwrap();

        let result = exchange(&mut client, &Version::new("skerry_test", None)).await;
        assert!(matches!(result, Err(SkerryError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_exchange_rejects_endless_banner_line() {
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);
        server
            .write_all(&vec![b'x'; MAX_PRE_BANNER_LINE_LENGTH + 16])
            .await
            .unwrap();

        let result = exchange(&mut client, &Version::new("skerry_test", None)).await;
        assert!(matches!(result, Err(SkerryError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_exchange_eof_is_io_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        drop(server);
        let result = exchange(&mut client, &Version::default_skerry()).await;
        assert!(result.is_err());
    }
}
