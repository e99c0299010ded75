//! Payload compression (RFC 4253 Section 6.2).
//!
//! Supports `none`, `zlib` and the delayed `zlib@openssh.com`, which only
//! starts compressing once user authentication has succeeded. The zlib
//! stream runs across packets: each packet ends with a partial flush, never
//! a stream reset.

use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use skerry_platform::{SkerryError, SkerryResult};

/// Upper bound on a decompressed payload.
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024;

/// Negotiated compression method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// No compression
    None,
    /// zlib from the first packet after NEWKEYS
    Zlib,
    /// zlib from the first packet after authentication succeeds
    ZlibDelayed,
}

impl Compression {
    /// Parses a negotiated method name.
    pub fn from_name(name: &str) -> SkerryResult<Self> {
        match name {
            "none" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib),
            "zlib@openssh.com" => Ok(Compression::ZlibDelayed),
            other => Err(SkerryError::Crypto(format!(
                "Unsupported compression algorithm: {}",
                other
            ))),
        }
    }

    /// Method names this implementation understands, preferred first.
    pub fn supported() -> Vec<String> {
        vec![
            "none".to_string(),
            "zlib@openssh.com".to_string(),
            "zlib".to_string(),
        ]
    }
}

/// Outbound compression state for one direction.
#[derive(Debug)]
pub struct Compressor {
    method: Compression,
    stream: Option<Compress>,
}

impl Compressor {
    /// Creates the compressor; delayed methods stay idle until
    /// [`activate`](Self::activate).
    pub fn new(method: Compression, authenticated: bool) -> Self {
        let mut compressor = Self {
            method,
            stream: None,
        };
        if method == Compression::Zlib || authenticated {
            compressor.activate();
        }
        compressor
    }

    /// Disabled compressor.
    pub fn none() -> Self {
        Self::new(Compression::None, false)
    }

    /// Starts compressing if the method calls for it.
    pub fn activate(&mut self) {
        if self.method != Compression::None && self.stream.is_none() {
            self.stream = Some(Compress::new(flate2::Compression::fast(), true));
        }
    }

    /// Returns true once payloads are being compressed.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Compresses one payload.
    pub fn compress(&mut self, input: &[u8]) -> SkerryResult<Vec<u8>> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            None => return Ok(input.to_vec()),
        };

        let start = stream.total_in();
        let mut output = Vec::with_capacity(input.len() + 64);
        loop {
            let consumed = (stream.total_in() - start) as usize;
            stream
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Partial)
                .map_err(|e| SkerryError::ProtocolViolation(format!("zlib compress: {}", e)))?;
            let consumed = (stream.total_in() - start) as usize;
            if consumed == input.len() && output.len() < output.capacity() {
                break;
            }
            output.reserve(output.capacity().max(64));
        }
        Ok(output)
    }
}

/// Inbound decompression state for one direction.
#[derive(Debug)]
pub struct Decompressor {
    method: Compression,
    stream: Option<Decompress>,
}

impl Decompressor {
    /// Creates the decompressor; delayed methods stay idle until
    /// [`activate`](Self::activate).
    pub fn new(method: Compression, authenticated: bool) -> Self {
        let mut decompressor = Self {
            method,
            stream: None,
        };
        if method == Compression::Zlib || authenticated {
            decompressor.activate();
        }
        decompressor
    }

    /// Disabled decompressor.
    pub fn none() -> Self {
        Self::new(Compression::None, false)
    }

    /// Starts decompressing if the method calls for it.
    pub fn activate(&mut self) {
        if self.method != Compression::None && self.stream.is_none() {
            self.stream = Some(Decompress::new(true));
        }
    }

    /// Returns true once payloads are being decompressed.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Decompresses one payload.
    ///
    /// # Errors
    ///
    /// [`SkerryError::ProtocolViolation`] for corrupt data or output larger
    /// than [`MAX_DECOMPRESSED_SIZE`].
    pub fn decompress(&mut self, input: &[u8]) -> SkerryResult<Vec<u8>> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            None => return Ok(input.to_vec()),
        };

        let start = stream.total_in();
        let mut output = Vec::with_capacity(input.len() * 2 + 64);
        loop {
            let consumed = (stream.total_in() - start) as usize;
            let status = stream
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| SkerryError::ProtocolViolation(format!("zlib decompress: {}", e)))?;
            let consumed = (stream.total_in() - start) as usize;
            if status == Status::StreamEnd
                || (consumed == input.len() && output.len() < output.capacity())
            {
                break;
            }
            if output.len() > MAX_DECOMPRESSED_SIZE {
                return Err(SkerryError::ProtocolViolation(
                    "Decompressed payload too large".to_string(),
                ));
            }
            output.reserve(output.capacity().max(64));
        }
        if output.len() > MAX_DECOMPRESSED_SIZE {
            return Err(SkerryError::ProtocolViolation(
                "Decompressed payload too large".to_string(),
            ));
        }
        Ok(output)
    }
}
