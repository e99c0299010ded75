//! # Skerry Platform
//!
//! Shared types for the skerry SSH client.
//!
//! This crate provides:
//! - Unified error types (`SkerryError`, `SkerryResult`)
//! - Collaborator traits (`HostTrust`, `CredentialProvider`) implemented by
//!   the embedding application
//!
//! # Examples
//!
//! ```
//! use skerry_platform::{SkerryError, SkerryResult};
//!
//! fn parse_mode(mode: &str) -> SkerryResult<u32> {
//!     u32::from_str_radix(mode, 8).map_err(|_| SkerryError::InvalidArgument(mode.to_string()))
//! }
//!
//! # fn main() -> SkerryResult<()> {
//! assert_eq!(parse_mode("644")?, 0o644);
//! assert!(parse_mode("9x").is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{FileErrorKind, SkerryError, SkerryResult};
pub use traits::{
    AuthMethodKind, Credential, CredentialProvider, HostTrust, InteractiveChallenge, Prompt,
    TrustedKeys,
};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
