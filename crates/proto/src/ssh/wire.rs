//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Readers take the message bytes and a cursor offset, advance the cursor
//! past the field and fail with [`SkerryError::ProtocolViolation`] on
//! truncated or malformed input. Writers append to a [`BytesMut`].
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use skerry_proto::ssh::wire;
//!
//! let mut buf = BytesMut::new();
//! wire::write_string(&mut buf, "ssh-userauth");
//! wire::write_name_list(&mut buf, &["zlib".to_string(), "none".to_string()]);
//!
//! let mut offset = 0;
//! assert_eq!(wire::read_string(&buf, &mut offset).unwrap(), "ssh-userauth");
//! assert_eq!(wire::read_name_list(&buf, &mut offset).unwrap(), vec!["zlib", "none"]);
//! ```

use bytes::{BufMut, BytesMut};
use skerry_platform::{SkerryError, SkerryResult};

fn truncated(what: &str, offset: usize) -> SkerryError {
    SkerryError::ProtocolViolation(format!("Truncated {} at offset {}", what, offset))
}

/// Reads a single byte.
pub fn read_u8(data: &[u8], offset: &mut usize) -> SkerryResult<u8> {
    let byte = *data.get(*offset).ok_or_else(|| truncated("byte", *offset))?;
    *offset += 1;
    Ok(byte)
}

/// Reads a boolean (any non-zero byte is true).
pub fn read_bool(data: &[u8], offset: &mut usize) -> SkerryResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads a big-endian uint32.
pub fn read_u32(data: &[u8], offset: &mut usize) -> SkerryResult<u32> {
    let end = offset
        .checked_add(4)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| truncated("uint32", *offset))?;
    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset = end;
    Ok(value)
}

/// Reads a big-endian uint64.
pub fn read_u64(data: &[u8], offset: &mut usize) -> SkerryResult<u64> {
    let high = read_u32(data, offset)? as u64;
    let low = read_u32(data, offset)? as u64;
    Ok((high << 32) | low)
}

/// Reads a length-prefixed byte string.
pub fn read_bytes(data: &[u8], offset: &mut usize) -> SkerryResult<Vec<u8>> {
    let start = *offset;
    let length = read_u32(data, offset)? as usize;
    match offset.checked_add(length) {
        Some(end) if end <= data.len() => {
            let bytes = data[*offset..end].to_vec();
            *offset = end;
            Ok(bytes)
        }
        _ => {
            *offset = start;
            Err(truncated("string", start))
        }
    }
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string(data: &[u8], offset: &mut usize) -> SkerryResult<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| SkerryError::ProtocolViolation("String contains invalid UTF-8".to_string()))
}

/// Reads a name-list: comma-separated ASCII names.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> SkerryResult<Vec<String>> {
    let list = read_string(data, offset)?;
    if list.is_empty() {
        return Ok(Vec::new());
    }
    if !list.is_ascii() || list.contains('\n') {
        return Err(SkerryError::ProtocolViolation(
            "Name-list contains non-ASCII or newline characters".to_string(),
        ));
    }
    Ok(list.split(',').map(String::from).collect())
}

/// Writes a boolean.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a length-prefixed byte string.
pub fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_bytes(buf, s.as_bytes());
}

/// Writes a name-list.
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    write_string(buf, &names.join(","));
}

/// Writes an unsigned big-endian integer as an mpint.
///
/// Leading zeros are stripped and a zero byte is prepended when the high
/// bit is set, so the value stays positive.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    let first = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[first..];

    if trimmed.is_empty() {
        buf.put_u32(0);
        return;
    }

    if trimmed[0] & 0x80 != 0 {
        buf.put_u32(trimmed.len() as u32 + 1);
        buf.put_u8(0);
    } else {
        buf.put_u32(trimmed.len() as u32);
    }
    buf.put_slice(trimmed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u32_truncated() {
        let mut offset = 0;
        let result = read_u32(&[0, 0, 1], &mut offset);
        assert!(matches!(result, Err(SkerryError::ProtocolViolation(_))));
        assert_eq!(offset, 0);
    }

    #[test]
    fn test_read_bytes_length_exceeds_data() {
        let data = [0, 0, 0, 10, 1, 2, 3];
        let mut offset = 0;
        assert!(read_bytes(&data, &mut offset).is_err());
    }

    #[test]
    fn test_read_u64() {
        let data = [0, 0, 0, 1, 0, 0, 0, 2];
        let mut offset = 0;
        assert_eq!(read_u64(&data, &mut offset).unwrap(), (1u64 << 32) | 2);
        assert_eq!(offset, 8);
    }

    #[test]
    fn test_name_list_empty() {
        let mut buf = BytesMut::new();
        write_name_list(&mut buf, &[]);
        let mut offset = 0;
        assert!(read_name_list(&buf, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn test_name_list_rejects_newline() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "aes128-ctr\nnone");
        let mut offset = 0;
        assert!(read_name_list(&buf, &mut offset).is_err());
    }

    #[test]
    fn test_mpint_encoding() {
        let mut buf = BytesMut::new();
        write_mpint(&mut buf, &[0x00, 0x00, 0x7f]);
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0x7f]);

        let mut buf = BytesMut::new();
        write_mpint(&mut buf, &[0x80, 0x01]);
        assert_eq!(&buf[..], &[0, 0, 0, 3, 0x00, 0x80, 0x01]);

        let mut buf = BytesMut::new();
        write_mpint(&mut buf, &[0, 0]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }
}
