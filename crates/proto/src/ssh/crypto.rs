//! Cryptographic capability interface and the default provider.
//!
//! The transport never touches primitives directly. It asks a
//! [`CryptoProvider`] for cipher, MAC and key-exchange instances by their
//! negotiated algorithm names, and drives them through the object-safe
//! [`PacketCipher`], [`PacketMac`] and [`KeyExchange`] traits.
//!
//! [`DefaultCryptoProvider`] implements the interface with vetted crates:
//!
//! - curve25519-sha256 (`ring` X25519, `sha2`)
//! - ssh-ed25519 host keys (`ed25519-dalek`)
//! - aes256-gcm@openssh.com, aes128-gcm@openssh.com (`ring` AEAD)
//! - aes256-ctr, aes128-ctr (`aes` + `ctr`)
//! - hmac-sha2-256, hmac-sha2-512 (`hmac`)
//!
//! # Security
//!
//! - **AEAD ciphers** authenticate the cleartext packet length as AAD
//! - **MAC verification** is constant time (`subtle`)
//! - **Key material** is zeroized on drop (`zeroize`)

use crate::ssh::wire;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256, Sha512};
use skerry_platform::{SkerryError, SkerryResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Static properties of a cipher, needed before instances exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    /// Key length in bytes
    pub key_len: usize,
    /// IV length in bytes
    pub iv_len: usize,
    /// Block size used for padding alignment
    pub block_size: usize,
    /// Whether the cipher authenticates the frame itself (no separate MAC)
    pub aead: bool,
}

/// One direction of packet encryption.
///
/// A frame is `uint32 packet_length || byte padding_length || payload || padding`.
pub trait PacketCipher: Send {
    /// Algorithm name.
    fn name(&self) -> &str;

    /// Block size used for padding alignment.
    fn block_size(&self) -> usize;

    /// Length of the authentication tag appended by [`seal`](Self::seal).
    fn tag_len(&self) -> usize {
        0
    }

    /// Whether the length field is authenticated but not encrypted, and
    /// excluded from block alignment.
    fn length_is_cleartext(&self) -> bool {
        false
    }

    /// Recovers the cleartext length field from the first four bytes on
    /// the wire.
    fn decrypt_length(&mut self, sequence: u32, encrypted: [u8; 4]) -> SkerryResult<[u8; 4]>;

    /// Encrypts a frame in place, appending the tag if any.
    fn seal(&mut self, sequence: u32, frame: &mut Vec<u8>) -> SkerryResult<()>;

    /// Decrypts a frame in place.
    ///
    /// On entry `frame` holds the cleartext length (as returned by
    /// [`decrypt_length`](Self::decrypt_length)) followed by the remaining
    /// ciphertext and tag. On success the tag is removed.
    ///
    /// # Errors
    ///
    /// [`SkerryError::Integrity`] if authentication fails.
    fn open(&mut self, sequence: u32, frame: &mut Vec<u8>) -> SkerryResult<()>;
}

/// One direction of packet integrity protection.
pub trait PacketMac: Send {
    /// Algorithm name.
    fn name(&self) -> &str;

    /// Tag length in bytes.
    fn mac_len(&self) -> usize;

    /// Computes `MAC(key, sequence || frame)`.
    fn compute(&self, sequence: u32, frame: &[u8]) -> Vec<u8>;

    /// Verifies a received tag in constant time.
    fn verify(&self, sequence: u32, frame: &[u8], tag: &[u8]) -> bool {
        let expected = self.compute(sequence, frame);
        expected.len() == tag.len() && bool::from(expected.ct_eq(tag))
    }
}

/// An ephemeral key-exchange instance.
pub trait KeyExchange: Send {
    /// Method name.
    fn name(&self) -> &str;

    /// Our ephemeral public value.
    fn public_key(&self) -> &[u8];

    /// Computes the shared secret from the peer's public value.
    ///
    /// The private half is consumed; a second call fails.
    fn agree(&mut self, peer_public: &[u8]) -> SkerryResult<Zeroizing<Vec<u8>>>;

    /// The method's hash function, used for the exchange hash and key
    /// derivation.
    fn hash(&self, data: &[u8]) -> Vec<u8>;
}

/// Capability interface over concrete cryptography.
pub trait CryptoProvider: Send + Sync {
    /// Supported key-exchange methods, most preferred first.
    fn kex_algorithms(&self) -> Vec<String>;

    /// Supported host key algorithms, most preferred first.
    fn host_key_algorithms(&self) -> Vec<String>;

    /// Supported ciphers, most preferred first.
    fn cipher_algorithms(&self) -> Vec<String>;

    /// Supported MACs, most preferred first.
    fn mac_algorithms(&self) -> Vec<String>;

    /// Starts a key exchange.
    fn key_exchange(&self, name: &str) -> SkerryResult<Box<dyn KeyExchange>>;

    /// Static cipher properties.
    fn cipher_spec(&self, name: &str) -> SkerryResult<CipherSpec>;

    /// Creates one direction of a cipher.
    ///
    /// `seal` selects the encrypting direction.
    fn cipher(
        &self,
        name: &str,
        key: &[u8],
        iv: &[u8],
        seal: bool,
    ) -> SkerryResult<Box<dyn PacketCipher>>;

    /// Key length of a MAC algorithm.
    fn mac_key_len(&self, name: &str) -> SkerryResult<usize>;

    /// Creates one direction of a MAC.
    fn mac(&self, name: &str, key: &[u8]) -> SkerryResult<Box<dyn PacketMac>>;

    /// Verifies the server's signature over the exchange hash.
    ///
    /// # Errors
    ///
    /// [`SkerryError::UntrustedHost`] if the signature does not verify.
    fn verify_host_signature(
        &self,
        algorithm: &str,
        host_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> SkerryResult<()>;
}

fn unsupported(kind: &str, name: &str) -> SkerryError {
    SkerryError::Crypto(format!("Unsupported {} algorithm: {}", kind, name))
}

/// Pass-through cipher used before the first NEWKEYS.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearCipher;

impl PacketCipher for ClearCipher {
    fn name(&self) -> &str {
        "none"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn decrypt_length(&mut self, _sequence: u32, encrypted: [u8; 4]) -> SkerryResult<[u8; 4]> {
        Ok(encrypted)
    }

    fn seal(&mut self, _sequence: u32, _frame: &mut Vec<u8>) -> SkerryResult<()> {
        Ok(())
    }

    fn open(&mut self, _sequence: u32, _frame: &mut Vec<u8>) -> SkerryResult<()> {
        Ok(())
    }
}

/// AES-GCM as specified for SSH in RFC 5647 / OpenSSH PROTOCOL.
///
/// The 12-byte nonce is a fixed 4-byte field followed by a 64-bit
/// invocation counter that increments once per packet.
struct GcmCipher {
    name: &'static str,
    key: LessSafeKey,
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmCipher {
    fn new(name: &'static str, key: &[u8], iv: &[u8]) -> SkerryResult<Self> {
        let algorithm = if key.len() == 32 { &AES_256_GCM } else { &AES_128_GCM };
        let unbound = UnboundKey::new(algorithm, key)
            .map_err(|_| SkerryError::Crypto(format!("Invalid key for {}", name)))?;
        if iv.len() < 12 {
            return Err(SkerryError::Crypto(format!("IV too short for {}", name)));
        }
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);
        Ok(Self {
            name,
            key: LessSafeKey::new(unbound),
            fixed,
            invocation: u64::from_be_bytes(counter),
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::assume_unique_for_key(nonce)
    }
}

impl PacketCipher for GcmCipher {
    fn name(&self) -> &str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn tag_len(&self) -> usize {
        AES_256_GCM.tag_len()
    }

    fn length_is_cleartext(&self) -> bool {
        true
    }

    fn decrypt_length(&mut self, _sequence: u32, encrypted: [u8; 4]) -> SkerryResult<[u8; 4]> {
        Ok(encrypted)
    }

    fn seal(&mut self, _sequence: u32, frame: &mut Vec<u8>) -> SkerryResult<()> {
        if frame.len() < 4 {
            return Err(SkerryError::Crypto("Frame shorter than length field".into()));
        }
        let mut length = [0u8; 4];
        length.copy_from_slice(&frame[..4]);
        let nonce = self.next_nonce();
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(length), &mut frame[4..])
            .map_err(|_| SkerryError::Crypto(format!("{} seal failed", self.name)))?;
        frame.extend_from_slice(tag.as_ref());
        Ok(())
    }

    fn open(&mut self, _sequence: u32, frame: &mut Vec<u8>) -> SkerryResult<()> {
        if frame.len() < 4 + self.tag_len() {
            return Err(SkerryError::Integrity("Frame shorter than tag".into()));
        }
        let mut length = [0u8; 4];
        length.copy_from_slice(&frame[..4]);
        let nonce = self.next_nonce();
        let plain_len = self
            .key
            .open_in_place(nonce, Aad::from(length), &mut frame[4..])
            .map_err(|_| SkerryError::Integrity(format!("{} authentication failed", self.name)))?
            .len();
        frame.truncate(4 + plain_len);
        Ok(())
    }
}

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

enum CtrStream {
    Aes128(Box<Aes128Ctr>),
    Aes256(Box<Aes256Ctr>),
}

/// AES-CTR (RFC 4344). The keystream runs continuously across packets.
struct CtrCipher {
    name: &'static str,
    stream: CtrStream,
}

impl CtrCipher {
    fn new(name: &'static str, key: &[u8], iv: &[u8]) -> SkerryResult<Self> {
        let invalid = |_| SkerryError::Crypto(format!("Invalid key or IV for {}", name));
        let iv = iv.get(..16).ok_or_else(|| SkerryError::Crypto(format!("IV too short for {}", name)))?;
        let stream = match key.len() {
            16 => CtrStream::Aes128(Box::new(Aes128Ctr::new_from_slices(key, iv).map_err(invalid)?)),
            32 => CtrStream::Aes256(Box::new(Aes256Ctr::new_from_slices(key, iv).map_err(invalid)?)),
            other => {
                return Err(SkerryError::Crypto(format!(
                    "Invalid key length {} for {}",
                    other, name
                )))
            }
        };
        Ok(Self { name, stream })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match &mut self.stream {
            CtrStream::Aes128(c) => c.apply_keystream(data),
            CtrStream::Aes256(c) => c.apply_keystream(data),
        }
    }
}

impl PacketCipher for CtrCipher {
    fn name(&self) -> &str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn decrypt_length(&mut self, _sequence: u32, encrypted: [u8; 4]) -> SkerryResult<[u8; 4]> {
        let mut length = encrypted;
        self.apply(&mut length);
        Ok(length)
    }

    fn seal(&mut self, _sequence: u32, frame: &mut Vec<u8>) -> SkerryResult<()> {
        self.apply(frame);
        Ok(())
    }

    fn open(&mut self, _sequence: u32, frame: &mut Vec<u8>) -> SkerryResult<()> {
        if frame.len() > 4 {
            self.apply(&mut frame[4..]);
        }
        Ok(())
    }
}

/// HMAC-SHA2 MAC algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key and tag size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Parses a MAC algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

enum KeyedMac {
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

/// MAC key bound to one direction.
pub struct MacKey {
    algorithm: MacAlgorithm,
    keyed: KeyedMac,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a MAC key, truncating longer key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SkerryResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(SkerryError::Crypto(format!(
                "Insufficient key material for {}: expected {}, got {}",
                algorithm.name(),
                algorithm.key_size(),
                key_material.len()
            )));
        }

        let key = Zeroizing::new(key_material[..algorithm.key_size()].to_vec());
        let invalid = |_| SkerryError::Crypto(format!("Invalid key for {}", algorithm.name()));
        let keyed = match algorithm {
            MacAlgorithm::HmacSha256 => {
                KeyedMac::Sha256(<Hmac<Sha256> as Mac>::new_from_slice(&key).map_err(invalid)?)
            }
            MacAlgorithm::HmacSha512 => {
                KeyedMac::Sha512(<Hmac<Sha512> as Mac>::new_from_slice(&key).map_err(invalid)?)
            }
        };

        Ok(Self { algorithm, keyed })
    }
}

impl PacketMac for MacKey {
    fn name(&self) -> &str {
        self.algorithm.name()
    }

    fn mac_len(&self) -> usize {
        self.algorithm.key_size()
    }

    fn compute(&self, sequence: u32, frame: &[u8]) -> Vec<u8> {
        match &self.keyed {
            KeyedMac::Sha256(keyed) => {
                let mut mac = keyed.clone();
                mac.update(&sequence.to_be_bytes());
                mac.update(frame);
                mac.finalize().into_bytes().to_vec()
            }
            KeyedMac::Sha512(keyed) => {
                let mut mac = keyed.clone();
                mac.update(&sequence.to_be_bytes());
                mac.update(frame);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

/// Curve25519 key exchange (RFC 8731).
pub struct Curve25519Exchange {
    name: String,
    private_key: Option<EphemeralPrivateKey>,
    public_key: Vec<u8>,
}

impl Curve25519Exchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new(name: &str) -> SkerryResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| SkerryError::Crypto("Failed to generate Curve25519 key".to_string()))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| SkerryError::Crypto("Failed to compute Curve25519 public key".to_string()))?
            .as_ref()
            .to_vec();

        Ok(Self {
            name: name.to_string(),
            private_key: Some(private_key),
            public_key,
        })
    }
}

impl KeyExchange for Curve25519Exchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn agree(&mut self, peer_public: &[u8]) -> SkerryResult<Zeroizing<Vec<u8>>> {
        if peer_public.len() != 32 {
            return Err(SkerryError::ProtocolViolation(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let private_key = self
            .private_key
            .take()
            .ok_or_else(|| SkerryError::Crypto("Key exchange already completed".to_string()))?;
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(private_key, &peer, |material| Zeroizing::new(material.to_vec()))
            .map_err(|_| SkerryError::Crypto("Curve25519 key agreement failed".to_string()))
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}

/// Default provider built on `ring`, RustCrypto and `ed25519-dalek`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCryptoProvider;

impl DefaultCryptoProvider {
    /// Creates the provider.
    pub fn new() -> Self {
        Self
    }
}

const CIPHERS: &[(&str, CipherSpec)] = &[
    (
        "aes256-gcm@openssh.com",
        CipherSpec { key_len: 32, iv_len: 12, block_size: 16, aead: true },
    ),
    (
        "aes128-gcm@openssh.com",
        CipherSpec { key_len: 16, iv_len: 12, block_size: 16, aead: true },
    ),
    (
        "aes256-ctr",
        CipherSpec { key_len: 32, iv_len: 16, block_size: 16, aead: false },
    ),
    (
        "aes128-ctr",
        CipherSpec { key_len: 16, iv_len: 16, block_size: 16, aead: false },
    ),
];

impl CryptoProvider for DefaultCryptoProvider {
    fn kex_algorithms(&self) -> Vec<String> {
        vec![
            "curve25519-sha256".to_string(),
            "curve25519-sha256@libssh.org".to_string(),
        ]
    }

    fn host_key_algorithms(&self) -> Vec<String> {
        vec!["ssh-ed25519".to_string()]
    }

    fn cipher_algorithms(&self) -> Vec<String> {
        CIPHERS.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn mac_algorithms(&self) -> Vec<String> {
        vec!["hmac-sha2-256".to_string(), "hmac-sha2-512".to_string()]
    }

    fn key_exchange(&self, name: &str) -> SkerryResult<Box<dyn KeyExchange>> {
        match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                Ok(Box::new(Curve25519Exchange::new(name)?))
            }
            other => Err(unsupported("key exchange", other)),
        }
    }

    fn cipher_spec(&self, name: &str) -> SkerryResult<CipherSpec> {
        CIPHERS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, spec)| *spec)
            .ok_or_else(|| unsupported("cipher", name))
    }

    fn cipher(
        &self,
        name: &str,
        key: &[u8],
        iv: &[u8],
        _seal: bool,
    ) -> SkerryResult<Box<dyn PacketCipher>> {
        let spec = self.cipher_spec(name)?;
        let key = key
            .get(..spec.key_len)
            .ok_or_else(|| SkerryError::Crypto(format!("Key too short for {}", name)))?;
        match name {
            "aes256-gcm@openssh.com" => Ok(Box::new(GcmCipher::new("aes256-gcm@openssh.com", key, iv)?)),
            "aes128-gcm@openssh.com" => Ok(Box::new(GcmCipher::new("aes128-gcm@openssh.com", key, iv)?)),
            "aes256-ctr" => Ok(Box::new(CtrCipher::new("aes256-ctr", key, iv)?)),
            "aes128-ctr" => Ok(Box::new(CtrCipher::new("aes128-ctr", key, iv)?)),
            other => Err(unsupported("cipher", other)),
        }
    }

    fn mac_key_len(&self, name: &str) -> SkerryResult<usize> {
        MacAlgorithm::from_name(name)
            .map(|alg| alg.key_size())
            .ok_or_else(|| unsupported("MAC", name))
    }

    fn mac(&self, name: &str, key: &[u8]) -> SkerryResult<Box<dyn PacketMac>> {
        let algorithm = MacAlgorithm::from_name(name).ok_or_else(|| unsupported("MAC", name))?;
        Ok(Box::new(MacKey::new(algorithm, key)?))
    }

    fn verify_host_signature(
        &self,
        algorithm: &str,
        host_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> SkerryResult<()> {
        if algorithm != "ssh-ed25519" {
            return Err(unsupported("host key", algorithm));
        }

        let mut offset = 0;
        let key_type = wire::read_string(host_key, &mut offset)?;
        let key_bytes = wire::read_bytes(host_key, &mut offset)?;
        if key_type != algorithm {
            return Err(SkerryError::ProtocolViolation(format!(
                "Host key type {} does not match negotiated {}",
                key_type, algorithm
            )));
        }

        let mut offset = 0;
        let sig_type = wire::read_string(signature, &mut offset)?;
        let sig_bytes = wire::read_bytes(signature, &mut offset)?;
        if sig_type != algorithm {
            return Err(SkerryError::ProtocolViolation(format!(
                "Signature type {} does not match negotiated {}",
                sig_type, algorithm
            )));
        }

        let key_array: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SkerryError::ProtocolViolation("Ed25519 key must be 32 bytes".into()))?;
        let sig_array: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SkerryError::ProtocolViolation("Ed25519 signature must be 64 bytes".into()))?;

        let verifying_key = VerifyingKey::from_bytes(&key_array)
            .map_err(|_| SkerryError::UntrustedHost("Malformed Ed25519 host key".to_string()))?;
        verifying_key
            .verify(data, &Signature::from_bytes(&sig_array))
            .map_err(|_| {
                SkerryError::UntrustedHost("Host signature over exchange hash is invalid".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal_and_open(name: &str) {
        let provider = DefaultCryptoProvider::new();
        let spec = provider.cipher_spec(name).unwrap();
        let key = vec![7u8; spec.key_len];
        let iv = vec![3u8; spec.iv_len];
        let mut sealer = provider.cipher(name, &key, &iv, true).unwrap();
        let mut opener = provider.cipher(name, &key, &iv, false).unwrap();

        for sequence in 0..3u32 {
            let plain: Vec<u8> = [&[0, 0, 0, 28][..], &[6u8; 28][..]].concat();
            let mut frame = plain.clone();
            sealer.seal(sequence, &mut frame).unwrap();
            assert_eq!(frame.len(), plain.len() + sealer.tag_len());
            assert_ne!(&frame[4..plain.len()], &plain[4..]);

            let mut length = [0u8; 4];
            length.copy_from_slice(&frame[..4]);
            let length = opener.decrypt_length(sequence, length).unwrap();
            assert_eq!(length, [0, 0, 0, 28]);
            frame[..4].copy_from_slice(&length);
            opener.open(sequence, &mut frame).unwrap();
            assert_eq!(frame, plain);
        }
    }

    #[test]
    fn test_gcm_seal_open() {
        seal_and_open("aes256-gcm@openssh.com");
        seal_and_open("aes128-gcm@openssh.com");
    }

    #[test]
    fn test_ctr_seal_open() {
        seal_and_open("aes256-ctr");
        seal_and_open("aes128-ctr");
    }

    #[test]
    fn test_gcm_tamper_is_integrity_error() {
        let provider = DefaultCryptoProvider::new();
        let key = [1u8; 32];
        let iv = [2u8; 12];
        let mut sealer = provider.cipher("aes256-gcm@openssh.com", &key, &iv, true).unwrap();
        let mut opener = provider.cipher("aes256-gcm@openssh.com", &key, &iv, false).unwrap();

        let mut frame = vec![0, 0, 0, 16, 4, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
        sealer.seal(0, &mut frame).unwrap();
        frame[6] ^= 0x01;
        let result = opener.open(0, &mut frame);
        assert!(matches!(result, Err(SkerryError::Integrity(_))));
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let provider = DefaultCryptoProvider::new();
        let mac = provider.mac("hmac-sha2-256", &[9u8; 32]).unwrap();
        let tag = mac.compute(5, b"frame");
        assert_eq!(tag.len(), 32);
        assert!(mac.verify(5, b"frame", &tag));
        assert!(!mac.verify(6, b"frame", &tag));
        assert!(!mac.verify(5, b"frame!", &tag));
        assert!(!mac.verify(5, b"frame", &tag[..31]));
    }

    #[test]
    fn test_mac_key_too_short() {
        let result = MacKey::new(MacAlgorithm::HmacSha512, &[0u8; 32]);
        assert!(matches!(result, Err(SkerryError::Crypto(_))));
    }

    #[test]
    fn test_curve25519_agreement() {
        let provider = DefaultCryptoProvider::new();
        let mut client = provider.key_exchange("curve25519-sha256").unwrap();
        let mut server = provider.key_exchange("curve25519-sha256").unwrap();
        let client_public = client.public_key().to_vec();
        let server_public = server.public_key().to_vec();

        let a = client.agree(&server_public).unwrap();
        let b = server.agree(&client_public).unwrap();
        assert_eq!(*a, *b);
        assert!(client.agree(&server_public).is_err());
        assert_eq!(client.hash(b"abc").len(), 32);
    }

    #[test]
    fn test_curve25519_rejects_short_key() {
        let mut exchange = Curve25519Exchange::new("curve25519-sha256").unwrap();
        assert!(matches!(
            exchange.agree(&[1, 2, 3]),
            Err(SkerryError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_unknown_algorithms() {
        let provider = DefaultCryptoProvider::new();
        assert!(provider.key_exchange("diffie-hellman-group1-sha1").is_err());
        assert!(provider.cipher_spec("3des-cbc").is_err());
        assert!(provider.mac("hmac-md5", &[0; 16]).is_err());
    }

    #[test]
    fn test_ed25519_host_signature() {
        use bytes::BytesMut;
        use ed25519_dalek::{Signer, SigningKey};

        let signing = SigningKey::from_bytes(&[42u8; 32]);
        let mut host_key = BytesMut::new();
        wire::write_string(&mut host_key, "ssh-ed25519");
        wire::write_bytes(&mut host_key, signing.verifying_key().as_bytes());

        let data = b"exchange hash";
        let mut signature = BytesMut::new();
        wire::write_string(&mut signature, "ssh-ed25519");
        wire::write_bytes(&mut signature, &signing.sign(data).to_bytes());

        let provider = DefaultCryptoProvider::new();
        provider
            .verify_host_signature("ssh-ed25519", &host_key, data, &signature)
            .unwrap();

        let result = provider.verify_host_signature("ssh-ed25519", &host_key, b"other", &signature);
        assert!(matches!(result, Err(SkerryError::UntrustedHost(_))));
    }
}
