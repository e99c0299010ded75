//! SSH key exchange (RFC 4253 Section 7, RFC 8731).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS
//! - Algorithm negotiation (first client preference the server supports)
//! - The ECDH exchange hash and key derivation
//! - [`Negotiator`], the sans-io state machine driving one connection's
//!   initial key exchange and every re-key after it
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first match wins)
//! 3. Client sends SSH_MSG_KEX_ECDH_INIT, server answers with its host key,
//!    ephemeral public value and a signature over the exchange hash
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches keys right after its NEWKEYS
//!
//! # States
//!
//! ```text
//! Init -> AlgorithmsExchanged -> KeyExchanging -> KeysDerived
//!                                                   ^      |
//!                                                   |      v
//!                                                   ReKeying
//! ```
//!
//! # Example
//!
//! ```rust
//! use skerry_proto::ssh::kex::{negotiate_algorithm, NewKeys};
//!
//! let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes256-ctr");
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::compression::{Compression, Compressor, Decompressor};
use crate::ssh::crypto::{CryptoProvider, KeyExchange, PacketCipher, PacketMac};
use crate::ssh::message::{expect_type, MessageType};
use crate::ssh::packet::{Opener, Sealer};
use crate::ssh::transport::Preferred;
use crate::ssh::wire;
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skerry_platform::{SkerryError, SkerryResult};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    ciphers_client_to_server: Vec<String>,
    ciphers_server_to_client: Vec<String>,
    macs_client_to_server: Vec<String>,
    macs_server_to_client: Vec<String>,
    compression_client_to_server: Vec<String>,
    compression_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT offering the same lists in both directions.
    pub fn from_preferences(preferred: &Preferred) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: preferred.kex.clone(),
            server_host_key_algorithms: preferred.host_key.clone(),
            ciphers_client_to_server: preferred.cipher.clone(),
            ciphers_server_to_client: preferred.cipher.clone(),
            macs_client_to_server: preferred.mac.clone(),
            macs_server_to_client: preferred.mac.clone(),
            compression_client_to_server: preferred.compression.clone(),
            compression_server_to_client: preferred.compression.clone(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the ciphers (client to server).
    pub fn ciphers_client_to_server(&self) -> &[String] {
        &self.ciphers_client_to_server
    }

    /// Returns the ciphers (server to client).
    pub fn ciphers_server_to_client(&self) -> &[String] {
        &self.ciphers_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn macs_client_to_server(&self) -> &[String] {
        &self.macs_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn macs_server_to_client(&self) -> &[String] {
        &self.macs_server_to_client
    }

    /// Returns the compression methods (client to server).
    pub fn compression_client_to_server(&self) -> &[String] {
        &self.compression_client_to_server
    }

    /// Returns the compression methods (server to client).
    pub fn compression_server_to_client(&self) -> &[String] {
        &self.compression_server_to_client
    }

    /// Returns whether a guessed key exchange packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message.
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        for list in self.name_lists() {
            wire::write_name_list(&mut buf, list);
        }
        wire::write_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.to_vec()
    }

    fn name_lists(&self) -> [&Vec<String>; 10] {
        [
            &self.kex_algorithms,
            &self.server_host_key_algorithms,
            &self.ciphers_client_to_server,
            &self.ciphers_server_to_client,
            &self.macs_client_to_server,
            &self.macs_server_to_client,
            &self.compression_client_to_server,
            &self.compression_server_to_client,
            &self.languages_client_to_server,
            &self.languages_server_to_client,
        ]
    }

    /// Parses the message.
    ///
    /// # Errors
    ///
    /// [`SkerryError::ProtocolViolation`] if the message is truncated, has
    /// the wrong type, or a name-list is malformed.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        expect_type(data, MessageType::KexInit)?;
        if data.len() < 17 {
            return Err(SkerryError::ProtocolViolation(format!(
                "KEXINIT message too short: {} bytes (minimum 17)",
                data.len()
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[1..17]);
        let mut offset = 17;

        let kex_algorithms = wire::read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = wire::read_name_list(data, &mut offset)?;
        let ciphers_client_to_server = wire::read_name_list(data, &mut offset)?;
        let ciphers_server_to_client = wire::read_name_list(data, &mut offset)?;
        let macs_client_to_server = wire::read_name_list(data, &mut offset)?;
        let macs_server_to_client = wire::read_name_list(data, &mut offset)?;
        let compression_client_to_server = wire::read_name_list(data, &mut offset)?;
        let compression_server_to_client = wire::read_name_list(data, &mut offset)?;
        let languages_client_to_server = wire::read_name_list(data, &mut offset)?;
        let languages_server_to_client = wire::read_name_list(data, &mut offset)?;
        let first_kex_packet_follows = wire::read_bool(data, &mut offset)?;
        let _reserved = wire::read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            ciphers_client_to_server,
            ciphers_server_to_client,
            macs_client_to_server,
            macs_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// The sequence number is NOT reset when keys change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates the message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        expect_type(data, MessageType::NewKeys)?;
        Ok(Self)
    }
}

/// SSH_MSG_KEX_ECDH_INIT (RFC 5656 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdhInit {
    /// Client ephemeral public value (Q_C)
    pub client_public: Vec<u8>,
}

impl EcdhInit {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexEcdhInit as u8);
        wire::write_bytes(&mut buf, &self.client_public);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        expect_type(data, MessageType::KexEcdhInit)?;
        let mut offset = 1;
        Ok(Self {
            client_public: wire::read_bytes(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_KEX_ECDH_REPLY (RFC 5656 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdhReply {
    /// Server host key blob (K_S)
    pub host_key: Vec<u8>,
    /// Server ephemeral public value (Q_S)
    pub server_public: Vec<u8>,
    /// Signature over the exchange hash
    pub signature: Vec<u8>,
}

impl EcdhReply {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexEcdhReply as u8);
        wire::write_bytes(&mut buf, &self.host_key);
        wire::write_bytes(&mut buf, &self.server_public);
        wire::write_bytes(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkerryResult<Self> {
        expect_type(data, MessageType::KexEcdhReply)?;
        let mut offset = 1;
        Ok(Self {
            host_key: wire::read_bytes(data, &mut offset)?,
            server_public: wire::read_bytes(data, &mut offset)?,
            signature: wire::read_bytes(data, &mut offset)?,
        })
    }
}

/// Picks the first client algorithm that the server also lists.
///
/// # Errors
///
/// [`SkerryError::NegotiationFailure`] naming the category and both lists
/// when nothing is mutual.
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> SkerryResult<String> {
    client_list
        .iter()
        .find(|candidate| server_list.contains(candidate))
        .cloned()
        .ok_or_else(|| SkerryError::NegotiationFailure {
            category: category.to_string(),
            client: client_list.join(","),
            server: server_list.join(","),
        })
}

/// Algorithms agreed for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: String,
    /// Cipher server to client
    pub cipher_server_to_client: String,
    /// MAC client to server (`None` for AEAD ciphers)
    pub mac_client_to_server: Option<String>,
    /// MAC server to client (`None` for AEAD ciphers)
    pub mac_server_to_client: Option<String>,
    /// Compression client to server
    pub compression_client_to_server: Compression,
    /// Compression server to client
    pub compression_server_to_client: Compression,
}

/// Negotiates every category from the client's and server's KEXINIT.
pub fn negotiate(
    client: &KexInit,
    server: &KexInit,
    provider: &dyn CryptoProvider,
) -> SkerryResult<Negotiated> {
    let kex = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
    let host_key = negotiate_algorithm(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;
    let cipher_client_to_server = negotiate_algorithm(
        "cipher client to server",
        &client.ciphers_client_to_server,
        &server.ciphers_client_to_server,
    )?;
    let cipher_server_to_client = negotiate_algorithm(
        "cipher server to client",
        &client.ciphers_server_to_client,
        &server.ciphers_server_to_client,
    )?;

    let mac_client_to_server = if provider.cipher_spec(&cipher_client_to_server)?.aead {
        None
    } else {
        Some(negotiate_algorithm(
            "mac client to server",
            &client.macs_client_to_server,
            &server.macs_client_to_server,
        )?)
    };
    let mac_server_to_client = if provider.cipher_spec(&cipher_server_to_client)?.aead {
        None
    } else {
        Some(negotiate_algorithm(
            "mac server to client",
            &client.macs_server_to_client,
            &server.macs_server_to_client,
        )?)
    };

    let compression_client_to_server = Compression::from_name(&negotiate_algorithm(
        "compression client to server",
        &client.compression_client_to_server,
        &server.compression_client_to_server,
    )?)?;
    let compression_server_to_client = Compression::from_name(&negotiate_algorithm(
        "compression server to client",
        &client.compression_server_to_client,
        &server.compression_server_to_client,
    )?)?;

    Ok(Negotiated {
        kex,
        host_key,
        cipher_client_to_server,
        cipher_server_to_client,
        mac_client_to_server,
        mac_server_to_client,
        compression_client_to_server,
        compression_server_to_client,
    })
}

/// Inputs to the ECDH exchange hash (RFC 5656 Section 4).
#[derive(Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// V_C, without CR LF
    pub client_id: &'a str,
    /// V_S, without CR LF
    pub server_id: &'a str,
    /// I_C, the client's KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// K_S
    pub host_key: &'a [u8],
    /// Q_C
    pub client_public: &'a [u8],
    /// Q_S
    pub server_public: &'a [u8],
    /// K
    pub shared_secret: &'a [u8],
}

impl ExchangeHashInput<'_> {
    /// Computes H with the key exchange method's hash.
    pub fn hash(&self, exchange: &dyn KeyExchange) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_string(&mut buf, self.client_id);
        wire::write_string(&mut buf, self.server_id);
        wire::write_bytes(&mut buf, self.client_kexinit);
        wire::write_bytes(&mut buf, self.server_kexinit);
        wire::write_bytes(&mut buf, self.host_key);
        wire::write_bytes(&mut buf, self.client_public);
        wire::write_bytes(&mut buf, self.server_public);
        wire::write_mpint(&mut buf, self.shared_secret);
        let hash = exchange.hash(&buf);
        buf[..].zeroize();
        hash
    }
}

/// Derives key material (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// ```
pub fn derive_key(
    exchange: &dyn KeyExchange,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut encoded = BytesMut::new();
    wire::write_mpint(&mut encoded, shared_secret);
    let secret = Zeroizing::new(encoded.to_vec());
    encoded[..].zeroize();

    let mut input = Zeroizing::new(Vec::new());
    input.extend_from_slice(&secret);
    input.extend_from_slice(exchange_hash);
    input.push(letter);
    input.extend_from_slice(session_id);
    let mut key = Zeroizing::new(exchange.hash(&input));

    while key.len() < length {
        let mut input = Zeroizing::new(Vec::with_capacity(secret.len() + exchange_hash.len() + key.len()));
        input.extend_from_slice(&secret);
        input.extend_from_slice(exchange_hash);
        input.extend_from_slice(&key);
        key.extend_from_slice(&exchange.hash(&input));
    }

    key.truncate(length);
    key
}

/// Key material for one direction.
pub struct DirectionKeys {
    /// Cipher name
    pub cipher: String,
    /// MAC name, if the cipher is not AEAD
    pub mac: Option<String>,
    /// Compression method
    pub compression: Compression,
    key: Zeroizing<Vec<u8>>,
    iv: Zeroizing<Vec<u8>>,
    mac_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .field("compression", &self.compression)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DirectionKeys {
    fn primitives(
        &self,
        provider: &dyn CryptoProvider,
        seal: bool,
    ) -> SkerryResult<(Box<dyn PacketCipher>, Option<Box<dyn PacketMac>>)> {
        let cipher = provider.cipher(&self.cipher, &self.key, &self.iv, seal)?;
        let mac = match &self.mac {
            Some(name) => Some(provider.mac(name, &self.mac_key)?),
            None => None,
        };
        Ok((cipher, mac))
    }

    /// Switches a sealer to these keys.
    pub fn install_sealer(
        &self,
        sealer: &mut Sealer,
        provider: &dyn CryptoProvider,
        authenticated: bool,
    ) -> SkerryResult<()> {
        let (cipher, mac) = self.primitives(provider, true)?;
        sealer.install(cipher, mac, Compressor::new(self.compression, authenticated));
        Ok(())
    }

    /// Switches an opener to these keys.
    pub fn install_opener(
        &self,
        opener: &mut Opener,
        provider: &dyn CryptoProvider,
        authenticated: bool,
    ) -> SkerryResult<()> {
        let (cipher, mac) = self.primitives(provider, false)?;
        opener.install(cipher, mac, Decompressor::new(self.compression, authenticated));
        Ok(())
    }
}

/// Keys derived from one exchange.
#[derive(Debug)]
pub struct SessionKeys {
    /// Client to server
    pub client_to_server: DirectionKeys,
    /// Server to client
    pub server_to_client: DirectionKeys,
}

impl SessionKeys {
    /// Derives both directions (letters 'A' through 'F').
    pub fn derive(
        negotiated: &Negotiated,
        provider: &dyn CryptoProvider,
        exchange: &dyn KeyExchange,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
    ) -> SkerryResult<Self> {
        let derive = |letter: u8, length: usize| {
            derive_key(exchange, shared_secret, exchange_hash, letter, session_id, length)
        };
        let mac_len = |mac: &Option<String>| -> SkerryResult<usize> {
            match mac {
                Some(name) => provider.mac_key_len(name),
                None => Ok(0),
            }
        };

        let c2s = provider.cipher_spec(&negotiated.cipher_client_to_server)?;
        let s2c = provider.cipher_spec(&negotiated.cipher_server_to_client)?;

        Ok(Self {
            client_to_server: DirectionKeys {
                cipher: negotiated.cipher_client_to_server.clone(),
                mac: negotiated.mac_client_to_server.clone(),
                compression: negotiated.compression_client_to_server,
                iv: derive(b'A', c2s.iv_len),
                key: derive(b'C', c2s.key_len),
                mac_key: derive(b'E', mac_len(&negotiated.mac_client_to_server)?),
            },
            server_to_client: DirectionKeys {
                cipher: negotiated.cipher_server_to_client.clone(),
                mac: negotiated.mac_server_to_client.clone(),
                compression: negotiated.compression_server_to_client,
                iv: derive(b'B', s2c.iv_len),
                key: derive(b'D', s2c.key_len),
                mac_key: derive(b'F', mac_len(&negotiated.mac_server_to_client)?),
            },
        })
    }
}

/// Negotiator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    /// Nothing exchanged yet
    Init,
    /// Both KEXINIT messages seen
    AlgorithmsExchanged,
    /// Ephemeral key sent, waiting for the server's reply
    KeyExchanging,
    /// Session keys in place
    KeysDerived,
    /// A later exchange is in progress; the current keys stay in use
    ReKeying,
}

/// Result of a verified key exchange reply.
#[derive(Debug)]
pub struct KexOutcome {
    /// Negotiated host key algorithm
    pub host_key_algorithm: String,
    /// Server host key blob, for the trust decision
    pub host_key: Vec<u8>,
    /// Freshly derived keys
    pub keys: SessionKeys,
}

/// Client-side key exchange state machine.
///
/// Holds no I/O: callers feed it received payloads and send what it
/// returns.
pub struct Negotiator {
    state: NegotiatorState,
    preferred: Preferred,
    client_id: String,
    server_id: String,
    local_kexinit: Option<Vec<u8>>,
    remote_kexinit: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,
    exchange: Option<Box<dyn KeyExchange>>,
    session_id: Option<Vec<u8>>,
    rounds: u64,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("state", &self.state)
            .field("negotiated", &self.negotiated)
            .field("rounds", &self.rounds)
            .finish()
    }
}

impl Negotiator {
    /// Creates a negotiator for a connection.
    ///
    /// `client_id` and `server_id` are the identification lines without
    /// CR LF.
    pub fn new(preferred: Preferred, client_id: &str, server_id: &str) -> Self {
        Self {
            state: NegotiatorState::Init,
            preferred,
            client_id: client_id.to_string(),
            server_id: server_id.to_string(),
            local_kexinit: None,
            remote_kexinit: None,
            negotiated: None,
            exchange: None,
            session_id: None,
            rounds: 0,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    /// Returns the session identifier (H of the first exchange).
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Returns the algorithms of the exchange in progress, or the last one.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Number of completed exchanges.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Returns true between our KEXINIT and [`finish`](Self::finish).
    pub fn in_progress(&self) -> bool {
        self.local_kexinit.is_some()
    }

    /// Starts an exchange and returns our KEXINIT payload.
    pub fn start(&mut self) -> SkerryResult<Vec<u8>> {
        if self.in_progress() {
            return Err(SkerryError::ProtocolViolation(
                "Key exchange already in progress".to_string(),
            ));
        }
        if self.state == NegotiatorState::KeysDerived {
            self.state = NegotiatorState::ReKeying;
        }

        let payload = KexInit::from_preferences(&self.preferred).to_bytes();
        self.local_kexinit = Some(payload.clone());
        debug!("Sending KEXINIT (round {})", self.rounds + 1);
        Ok(payload)
    }

    /// Handles the server's KEXINIT. [`start`](Self::start) must have been
    /// called first.
    pub fn receive_kexinit(
        &mut self,
        payload: &[u8],
        provider: &dyn CryptoProvider,
    ) -> SkerryResult<Negotiated> {
        let local = self.local_kexinit.as_deref().ok_or_else(|| {
            SkerryError::ProtocolViolation("KEXINIT received before ours was sent".to_string())
        })?;
        if self.remote_kexinit.is_some() {
            return Err(SkerryError::ProtocolViolation(
                "Duplicate KEXINIT during key exchange".to_string(),
            ));
        }

        let client = KexInit::from_bytes(local)?;
        let server = KexInit::from_bytes(payload)?;
        let negotiated = negotiate(&client, &server, provider)?;
        debug!(
            "Negotiated kex={} hostkey={} cipher={}/{} mac={:?}/{:?} compression={:?}/{:?}",
            negotiated.kex,
            negotiated.host_key,
            negotiated.cipher_client_to_server,
            negotiated.cipher_server_to_client,
            negotiated.mac_client_to_server,
            negotiated.mac_server_to_client,
            negotiated.compression_client_to_server,
            negotiated.compression_server_to_client,
        );

        self.remote_kexinit = Some(payload.to_vec());
        self.negotiated = Some(negotiated.clone());
        if self.state == NegotiatorState::Init {
            self.state = NegotiatorState::AlgorithmsExchanged;
        }
        Ok(negotiated)
    }

    /// Generates our ephemeral key and returns the KEX_ECDH_INIT payload.
    pub fn exchange_init(&mut self, provider: &dyn CryptoProvider) -> SkerryResult<Vec<u8>> {
        let negotiated = self.negotiated.as_ref().ok_or_else(|| {
            SkerryError::ProtocolViolation("Key exchange before algorithm negotiation".to_string())
        })?;
        if self.exchange.is_some() {
            return Err(SkerryError::ProtocolViolation(
                "Ephemeral key already sent".to_string(),
            ));
        }

        let exchange = provider.key_exchange(&negotiated.kex)?;
        let payload = EcdhInit {
            client_public: exchange.public_key().to_vec(),
        }
        .to_bytes();
        self.exchange = Some(exchange);
        if self.state == NegotiatorState::AlgorithmsExchanged {
            self.state = NegotiatorState::KeyExchanging;
        }
        Ok(payload)
    }

    /// Handles KEX_ECDH_REPLY: computes the shared secret, verifies the
    /// host signature over the exchange hash and derives keys.
    ///
    /// The host key itself is not trusted here; the caller decides that.
    ///
    /// # Errors
    ///
    /// [`SkerryError::UntrustedHost`] if the signature does not verify.
    pub fn receive_reply(
        &mut self,
        payload: &[u8],
        provider: &dyn CryptoProvider,
    ) -> SkerryResult<KexOutcome> {
        let reply = EcdhReply::from_bytes(payload)?;
        let (negotiated, local, remote) = match (
            self.negotiated.as_ref(),
            self.local_kexinit.as_deref(),
            self.remote_kexinit.as_deref(),
        ) {
            (Some(n), Some(l), Some(r)) => (n, l, r),
            _ => {
                return Err(SkerryError::ProtocolViolation(
                    "KEX_ECDH_REPLY outside key exchange".to_string(),
                ))
            }
        };
        let exchange = self.exchange.as_mut().ok_or_else(|| {
            SkerryError::ProtocolViolation("KEX_ECDH_REPLY before KEX_ECDH_INIT".to_string())
        })?;

        let shared_secret = exchange.agree(&reply.server_public)?;
        let exchange_hash = ExchangeHashInput {
            client_id: &self.client_id,
            server_id: &self.server_id,
            client_kexinit: local,
            server_kexinit: remote,
            host_key: &reply.host_key,
            client_public: exchange.public_key(),
            server_public: &reply.server_public,
            shared_secret: &shared_secret,
        }
        .hash(exchange.as_ref());

        provider.verify_host_signature(
            &negotiated.host_key,
            &reply.host_key,
            &exchange_hash,
            &reply.signature,
        )?;

        let session_id = self
            .session_id
            .get_or_insert_with(|| exchange_hash.clone())
            .clone();
        let keys = SessionKeys::derive(
            negotiated,
            provider,
            exchange.as_ref(),
            &shared_secret,
            &exchange_hash,
            &session_id,
        )?;

        if self.state == NegotiatorState::KeyExchanging {
            self.state = NegotiatorState::KeysDerived;
        }
        Ok(KexOutcome {
            host_key_algorithm: negotiated.host_key.clone(),
            host_key: reply.host_key,
            keys,
        })
    }

    /// Completes the exchange once NEWKEYS has gone both ways.
    pub fn finish(&mut self) {
        self.state = NegotiatorState::KeysDerived;
        self.rounds += 1;
        self.local_kexinit = None;
        self.remote_kexinit = None;
        self.exchange = None;
        debug!("Key exchange round {} complete", self.rounds);
    }
}
