//! Client-side view of one remote file.

use super::client::{SftpClient, SftpInner};
use super::types::{FileAttributes, FileMode, FileType};
use skerry_platform::{SkerryError, SkerryResult};
use std::sync::Weak;
use std::time::Duration;
use tracing::debug;

/// A remote path together with its last known attributes.
///
/// Holds a weak reference to the [`SftpClient`] that produced it, so it
/// never keeps the session alive. Once the client is dropped every
/// mutating method fails with [`SkerryError::SessionClosed`].
#[derive(Debug, Clone)]
pub struct RemoteFile {
    path: String,
    attrs: FileAttributes,
    client: Weak<SftpInner>,
    timeout: Duration,
}

impl RemoteFile {
    pub(crate) fn new(path: String, attrs: FileAttributes, client: &SftpClient) -> Self {
        Self {
            path,
            attrs,
            client: client.downgrade(),
            timeout: client.timeout(),
        }
    }

    /// Full remote path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path component.
    pub fn name(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rsplit_once('/') {
            Some((_, name)) => name,
            None => trimmed,
        }
    }

    /// Attributes as last fetched or pushed.
    pub fn attributes(&self) -> &FileAttributes {
        &self.attrs
    }

    /// Size in bytes, if reported.
    pub fn size(&self) -> Option<u64> {
        self.attrs.size
    }

    /// Decoded mode, if permissions were reported.
    pub fn mode(&self) -> Option<FileMode> {
        self.attrs.mode()
    }

    /// File type from the decoded mode.
    pub fn file_type(&self) -> FileType {
        self.mode().map_or(FileType::Unknown, FileMode::file_type)
    }

    /// Returns true if the mode says this is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// Returns true if the mode says this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    fn client(&self) -> SkerryResult<SftpClient> {
        self.client
            .upgrade()
            .map(|inner| SftpClient::from_inner(inner, self.timeout))
            .ok_or_else(|| SkerryError::SessionClosed {
                reason: "SFTP client dropped".to_string(),
            })
    }

    /// Pushes `attrs` to the server and merges them into the local copy.
    ///
    /// When `attrs` carries permissions, only their nine rwx bits are
    /// used. The file type and special bits are taken from the mode as
    /// last decoded from the server.
    pub async fn update_status(&mut self, mut attrs: FileAttributes) -> SkerryResult<()> {
        if let Some(requested) = attrs.permissions {
            attrs.permissions = Some(self.reassemble(requested));
        }

        self.client()?
            .set_attributes(&self.path, attrs.clone())
            .await?;
        self.merge(attrs);
        Ok(())
    }

    /// Sets permissions from a three-digit octal string such as `"640"`.
    ///
    /// # Errors
    ///
    /// [`SkerryError::InvalidArgument`] for anything other than three
    /// digits `0`-`7`. Nothing is sent in that case.
    pub async fn set_permissions(&mut self, mode: &str) -> SkerryResult<()> {
        let permissions = FileMode::parse_permissions(mode)?;
        debug!("Setting {} permissions to {:03o}", self.path, permissions);
        self.update_status(FileAttributes::new().with_permissions(permissions))
            .await
    }

    /// Removes the file, or the directory if the mode says it is one.
    pub async fn delete(self) -> SkerryResult<()> {
        let client = self.client()?;
        if self.is_dir() {
            client.rmdir(&self.path).await
        } else {
            client.remove(&self.path).await
        }
    }

    /// Renames the file and updates the local path.
    pub async fn rename(&mut self, new_path: &str) -> SkerryResult<()> {
        self.client()?.rename(&self.path, new_path).await?;
        self.path = new_path.to_string();
        Ok(())
    }

    /// Re-reads the attributes from the server.
    pub async fn refresh(&mut self) -> SkerryResult<()> {
        self.attrs = self.client()?.stat(&self.path).await?;
        Ok(())
    }

    fn reassemble(&self, requested: u32) -> u32 {
        let decoded = self.attrs.permissions.unwrap_or(0);
        FileMode::from_bits(decoded)
            .with_permissions(requested)
            .bits()
    }

    fn merge(&mut self, update: FileAttributes) {
        if update.size.is_some() {
            self.attrs.size = update.size;
        }
        if update.owner.is_some() {
            self.attrs.owner = update.owner;
        }
        if update.permissions.is_some() {
            self.attrs.permissions = update.permissions;
        }
        if update.times.is_some() {
            self.attrs.times = update.times;
        }
        if update.extensions.is_some() {
            self.attrs.extensions = update.extensions;
        }
    }
}
