//! SFTP (SSH File Transfer Protocol) client, version 3.
//!
//! SFTP runs as the "sftp" subsystem of a session channel:
//!
//! ```text
//! Client                          Server
//!   |-- SSH_MSG_CHANNEL_OPEN ------>|
//!   |<- SSH_MSG_CHANNEL_OPEN_CONF --|
//!   |-- SSH_MSG_CHANNEL_REQUEST --->|  (subsystem "sftp")
//!   |<- SSH_MSG_CHANNEL_SUCCESS ----|
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|
//!   |-- SSH_FXP_OPEN (id 0) ------->|
//!   |-- SSH_FXP_STAT (id 1) ------->|  requests pipeline freely
//!   |<- SSH_FXP_ATTRS (id 1) -------|  responses in any order
//!   |<- SSH_FXP_HANDLE (id 0) ------|
//! ```
//!
//! - [`message`]: packet framing, requests, responses, status codes
//! - [`types`]: attributes, modes, open flags
//! - [`client`]: [`SftpClient`] and lazy directory listings
//! - [`entity`]: [`RemoteFile`]
//!
//! # References
//!
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)

pub mod client;
pub mod entity;
pub mod message;
pub mod types;

pub use client::{DirectoryListing, FileHandle, SftpClient, SftpConfig};
pub use entity::RemoteFile;
pub use message::{NameEntry, SftpMessage, SftpMessageType, Status, StatusCode};
pub use types::{FileAttributes, FileMode, FileTimes, FileType, OpenFlags, Owner};
