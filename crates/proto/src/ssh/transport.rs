//! Transport configuration and re-key policy (RFC 4253 Section 9).
//!
//! # Rekeying
//!
//! A new key exchange is started when either threshold is crossed:
//! - Bytes transferred in both directions (1 GiB by default)
//! - Time since the last key exchange (1 hour by default)
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use skerry_proto::ssh::transport::TransportConfig;
//!
//! let config = TransportConfig::default()
//!     .with_rekey_bytes(64 * 1024 * 1024)
//!     .with_rekey_interval(Duration::from_secs(600));
//! assert_eq!(config.rekey_bytes_limit, 64 * 1024 * 1024);
//! ```

use crate::ssh::compression::Compression;
use crate::ssh::crypto::CryptoProvider;
use crate::ssh::version::Version;
use std::time::{Duration, Instant};

/// Default re-key byte threshold (1 GiB).
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

/// Default re-key time threshold.
pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(3600);

/// Algorithm preference lists, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferred {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers (both directions)
    pub cipher: Vec<String>,
    /// MACs (both directions)
    pub mac: Vec<String>,
    /// Compression methods (both directions)
    pub compression: Vec<String>,
}

impl Preferred {
    /// Everything a provider supports, without compression.
    pub fn from_provider(provider: &dyn CryptoProvider) -> Self {
        Self {
            kex: provider.kex_algorithms(),
            host_key: provider.host_key_algorithms(),
            cipher: provider.cipher_algorithms(),
            mac: provider.mac_algorithms(),
            compression: vec!["none".to_string()],
        }
    }

    /// Also offers zlib compression, after "none".
    pub fn with_compression(mut self) -> Self {
        self.compression = Compression::supported();
        self
    }
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification string.
    pub version: Version,

    /// Algorithm preferences. `None` uses everything the provider offers.
    pub preferred: Option<Preferred>,

    /// Bytes (both directions) before an automatic re-key.
    pub rekey_bytes_limit: u64,

    /// Time before an automatic re-key.
    pub rekey_time_limit: Duration,
}

impl TransportConfig {
    /// Sets the algorithm preferences.
    pub fn with_preferred(mut self, preferred: Preferred) -> Self {
        self.preferred = Some(preferred);
        self
    }

    /// Sets the byte threshold for re-keying.
    pub fn with_rekey_bytes(mut self, bytes: u64) -> Self {
        self.rekey_bytes_limit = bytes;
        self
    }

    /// Sets the time threshold for re-keying.
    pub fn with_rekey_interval(mut self, interval: Duration) -> Self {
        self.rekey_time_limit = interval;
        self
    }

    /// Resolves the preferences against a provider.
    pub fn preferences(&self, provider: &dyn CryptoProvider) -> Preferred {
        self.preferred
            .clone()
            .unwrap_or_else(|| Preferred::from_provider(provider))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_skerry(),
            preferred: None,
            rekey_bytes_limit: DEFAULT_REKEY_BYTES,
            rekey_time_limit: DEFAULT_REKEY_INTERVAL,
        }
    }
}

/// Tracks traffic since the last key exchange.
#[derive(Debug, Clone)]
pub struct RekeyPolicy {
    bytes_limit: u64,
    time_limit: Duration,
    bytes: u64,
    since: Instant,
}

impl RekeyPolicy {
    /// Creates a policy starting now.
    pub fn new(bytes_limit: u64, time_limit: Duration) -> Self {
        Self {
            bytes_limit,
            time_limit,
            bytes: 0,
            since: Instant::now(),
        }
    }

    /// Creates a policy from transport configuration.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.rekey_bytes_limit, config.rekey_time_limit)
    }

    /// Records transferred bytes.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    /// Bytes transferred since the last key exchange.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns true once a threshold has been crossed.
    pub fn needs_rekey(&self, now: Instant) -> bool {
        self.bytes >= self.bytes_limit || now.duration_since(self.since) >= self.time_limit
    }

    /// Restarts tracking after a key exchange.
    pub fn reset(&mut self, now: Instant) {
        self.bytes = 0;
        self.since = now;
    }
}
