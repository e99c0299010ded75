//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or AEAD tag
//! ```
//!
//! # Codec
//!
//! [`Sealer`] and [`Opener`] are the outbound and inbound halves of the
//! codec. Each owns its direction's sequence number, cipher, MAC and
//! compression state. Every encoded or decoded frame consumes exactly one
//! sequence number; the counter never wraps, and exhausting it is a fatal
//! [`SkerryError::ProtocolViolation`].
//!
//! Encoding compresses the payload, pads to the cipher block size with
//! random bytes, computes the MAC over `sequence || cleartext frame`, then
//! encrypts. Decoding reverses this and rejects any frame whose tag does
//! not verify with [`SkerryError::Integrity`].
//!
//! # Example
//!
//! ```rust
//! use skerry_proto::ssh::packet::{Opener, Sealer};
//!
//! # tokio_test_block_on(async {
//! let mut sealer = Sealer::new();
//! let mut opener = Opener::new();
//!
//! let frame = sealer.encode(b"payload").unwrap();
//! let payload = opener.decode(&mut &frame[..]).await.unwrap();
//! assert_eq!(payload, b"payload");
//! assert_eq!(sealer.sequence(), 1);
//! assert_eq!(opener.sequence(), 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use crate::ssh::compression::{Compressor, Decompressor};
use crate::ssh::crypto::{ClearCipher, PacketCipher, PacketMac};
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skerry_platform::{SkerryError, SkerryResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum outbound packet length (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Maximum inbound packet length accepted from the peer.
pub const MAX_INBOUND_PACKET_SIZE: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Default block size when no cipher is active.
pub const DEFAULT_BLOCK_SIZE: usize = 8;

/// A cleartext SSH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet padded to the default 8-byte block size.
    pub fn new(payload: Vec<u8>) -> SkerryResult<Self> {
        Self::with_block_size(payload, DEFAULT_BLOCK_SIZE, false)
    }

    /// Creates a packet padded for a cipher.
    ///
    /// `length_is_cleartext` excludes the 4-byte length field from the
    /// alignment computation, as AEAD modes require.
    ///
    /// # Errors
    ///
    /// [`SkerryError::InvalidArgument`] if the padded packet would exceed
    /// [`MAX_PACKET_SIZE`].
    pub fn with_block_size(
        payload: Vec<u8>,
        block_size: usize,
        length_is_cleartext: bool,
    ) -> SkerryResult<Self> {
        let block_size = block_size.max(DEFAULT_BLOCK_SIZE);
        let aligned = 1 + payload.len() + if length_is_cleartext { 0 } else { 4 };
        let mut padding_len = block_size - (aligned % block_size);
        if padding_len < MIN_PADDING_LEN {
            padding_len += block_size;
        }

        let packet_length = 1 + payload.len() + padding_len;
        if packet_length > MAX_PACKET_SIZE {
            return Err(SkerryError::InvalidArgument(format!(
                "Packet size {} exceeds maximum {}",
                packet_length, MAX_PACKET_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Serializes the cleartext frame (no MAC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses a cleartext frame (no MAC).
    ///
    /// # Errors
    ///
    /// [`SkerryError::ProtocolViolation`] if the length field disagrees
    /// with the data, or the padding length is out of range.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        if data.len() < 5 {
            return Err(SkerryError::ProtocolViolation(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let packet_length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if packet_length != data.len() - 4 {
            return Err(SkerryError::ProtocolViolation(format!(
                "Packet length {} does not match frame of {} bytes",
                packet_length,
                data.len() - 4
            )));
        }

        let padding_length = data[4] as usize;
        if padding_length < MIN_PADDING_LEN {
            return Err(SkerryError::ProtocolViolation(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }
        if padding_length + 1 > packet_length {
            return Err(SkerryError::ProtocolViolation(format!(
                "Padding length {} exceeds packet length {}",
                padding_length, packet_length
            )));
        }

        let payload_end = 4 + packet_length - padding_length;
        Ok(Self {
            payload: data[5..payload_end].to_vec(),
            padding: data[payload_end..].to_vec(),
        })
    }
}

/// Per-direction sequence counter that refuses to wrap.
#[derive(Debug, Default)]
struct SequenceCounter {
    next: u32,
    exhausted: bool,
}

impl SequenceCounter {
    fn take(&mut self) -> SkerryResult<u32> {
        if self.exhausted {
            return Err(SkerryError::ProtocolViolation(
                "Packet sequence number space exhausted".to_string(),
            ));
        }
        let current = self.next;
        match current.checked_add(1) {
            Some(next) => self.next = next,
            None => self.exhausted = true,
        }
        Ok(current)
    }
}

/// Outbound half of the packet codec.
pub struct Sealer {
    sequence: SequenceCounter,
    cipher: Box<dyn PacketCipher>,
    mac: Option<Box<dyn PacketMac>>,
    compressor: Compressor,
}

impl Default for Sealer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sealer {
    /// Creates a sealer with no encryption, MAC or compression.
    pub fn new() -> Self {
        Self {
            sequence: SequenceCounter::default(),
            cipher: Box::new(ClearCipher),
            mac: None,
            compressor: Compressor::none(),
        }
    }

    /// Switches to newly derived keys. The sequence number carries on.
    pub fn install(
        &mut self,
        cipher: Box<dyn PacketCipher>,
        mac: Option<Box<dyn PacketMac>>,
        compressor: Compressor,
    ) {
        self.cipher = cipher;
        self.mac = mac;
        self.compressor = compressor;
    }

    /// Starts delayed compression.
    pub fn activate_compression(&mut self) {
        self.compressor.activate();
    }

    /// Returns the sequence number of the next frame.
    pub fn sequence(&self) -> u32 {
        self.sequence.next
    }

    /// Returns the active cipher's name.
    pub fn cipher_name(&self) -> &str {
        self.cipher.name()
    }

    /// Encodes one payload into a wire frame.
    pub fn encode(&mut self, payload: &[u8]) -> SkerryResult<Vec<u8>> {
        let payload = self.compressor.compress(payload)?;
        let packet = Packet::with_block_size(
            payload,
            self.cipher.block_size(),
            self.cipher.length_is_cleartext(),
        )?;
        let sequence = self.sequence.take()?;

        let mut frame = packet.to_bytes();
        let tag = self.mac.as_ref().map(|mac| mac.compute(sequence, &frame));
        self.cipher.seal(sequence, &mut frame)?;
        if let Some(tag) = tag {
            frame.extend_from_slice(&tag);
        }
        Ok(frame)
    }
}

/// Inbound half of the packet codec.
pub struct Opener {
    sequence: SequenceCounter,
    cipher: Box<dyn PacketCipher>,
    mac: Option<Box<dyn PacketMac>>,
    decompressor: Decompressor,
}

impl Default for Opener {
    fn default() -> Self {
        Self::new()
    }
}

impl Opener {
    /// Creates an opener with no encryption, MAC or compression.
    pub fn new() -> Self {
        Self {
            sequence: SequenceCounter::default(),
            cipher: Box::new(ClearCipher),
            mac: None,
            decompressor: Decompressor::none(),
        }
    }

    /// Switches to newly derived keys. The sequence number carries on.
    pub fn install(
        &mut self,
        cipher: Box<dyn PacketCipher>,
        mac: Option<Box<dyn PacketMac>>,
        decompressor: Decompressor,
    ) {
        self.cipher = cipher;
        self.mac = mac;
        self.decompressor = decompressor;
    }

    /// Starts delayed decompression.
    pub fn activate_compression(&mut self) {
        self.decompressor.activate();
    }

    /// Returns the sequence number of the next frame.
    pub fn sequence(&self) -> u32 {
        self.sequence.next
    }

    /// Reads and decodes exactly one frame.
    ///
    /// # Errors
    ///
    /// - [`SkerryError::Io`] if the stream fails or ends
    /// - [`SkerryError::Integrity`] if the MAC or AEAD tag does not verify
    /// - [`SkerryError::ProtocolViolation`] for malformed framing
    pub async fn decode<R>(&mut self, reader: &mut R) -> SkerryResult<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut first = [0u8; 4];
        reader.read_exact(&mut first).await?;
        let sequence = self.sequence.take()?;

        let length = self.cipher.decrypt_length(sequence, first)?;
        let packet_length = u32::from_be_bytes(length) as usize;
        if !(MIN_PADDING_LEN + 1..=MAX_INBOUND_PACKET_SIZE).contains(&packet_length) {
            return Err(SkerryError::ProtocolViolation(format!(
                "Invalid packet length: {}",
                packet_length
            )));
        }

        let block_size = self.cipher.block_size().max(DEFAULT_BLOCK_SIZE);
        let aligned = if self.cipher.length_is_cleartext() {
            packet_length
        } else {
            packet_length + 4
        };
        if aligned % block_size != 0 {
            return Err(SkerryError::ProtocolViolation(format!(
                "Packet length {} not aligned to block size {}",
                packet_length, block_size
            )));
        }

        let mut frame = Vec::with_capacity(4 + packet_length + self.cipher.tag_len());
        frame.extend_from_slice(&length);
        frame.resize(4 + packet_length + self.cipher.tag_len(), 0);
        reader.read_exact(&mut frame[4..]).await?;

        let mut received_mac = vec![0u8; self.mac.as_ref().map_or(0, |mac| mac.mac_len())];
        reader.read_exact(&mut received_mac).await?;

        self.cipher.open(sequence, &mut frame)?;
        if let Some(mac) = &self.mac {
            if !mac.verify(sequence, &frame, &received_mac) {
                return Err(SkerryError::Integrity(format!(
                    "MAC verification failed for packet {}",
                    sequence
                )));
            }
        }

        let packet = Packet::from_bytes(&frame)?;
        self.decompressor.decompress(packet.payload())
    }
}
