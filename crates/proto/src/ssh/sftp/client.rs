//! SFTP client implementation.
//!
//! One background task drains the subsystem channel and routes each
//! response to the caller waiting on its request id, so any number of
//! requests may be outstanding at once. The per-request deadline covers
//! both sending the request and waiting for its response. A request that
//! times out, or whose future is dropped, leaves the in-flight table; its
//! response, if it ever arrives, is discarded.

use super::entity::RemoteFile;
use super::message::{
    self, NameEntry, PacketBuffer, Request, Response, VersionInfo, MAX_PACKET_LEN, SFTP_VERSION,
};
use super::types::{FileAttributes, OpenFlags};
use crate::ssh::channel::{ChannelReader, ChannelWriter, SshChannel};
use skerry_platform::{FileErrorKind, SkerryError, SkerryResult};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size of a single READ or WRITE request.
pub const DEFAULT_CHUNK_SIZE: u32 = 32 * 1024;

/// SFTP client configuration.
#[derive(Debug, Clone)]
pub struct SftpConfig {
    /// Time to wait for each response
    pub request_timeout: Duration,
    /// Largest data block per READ or WRITE request
    pub chunk_size: u32,
    /// Send SYMLINK arguments target first, as OpenSSH's sftp-server expects
    pub reverse_symlink_arguments: bool,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            reverse_symlink_arguments: true,
        }
    }
}

impl SftpConfig {
    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the READ/WRITE block size.
    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Chooses the SYMLINK argument order.
    pub fn with_reverse_symlink_arguments(mut self, reversed: bool) -> Self {
        self.reverse_symlink_arguments = reversed;
        self
    }
}

/// An open file or directory handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(Vec<u8>);

impl FileHandle {
    /// Wraps a handle returned by the server.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The opaque handle bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

type ResponseSender = oneshot::Sender<SkerryResult<Response>>;

/// In-flight requests keyed by id.
#[derive(Debug, Default)]
struct RequestTable {
    next_id: u32,
    in_flight: HashMap<u32, ResponseSender>,
    closed: Option<String>,
}

impl RequestTable {
    /// Assigns the next free id to `sender`. Ids still in flight are
    /// skipped, so an id is only reused after its request completed.
    fn register(&mut self, sender: ResponseSender) -> SkerryResult<u32> {
        if let Some(reason) = &self.closed {
            return Err(SkerryError::SessionClosed {
                reason: reason.clone(),
            });
        }
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.in_flight.contains_key(&id) {
                self.in_flight.insert(id, sender);
                return Ok(id);
            }
        }
    }

    fn complete(&mut self, id: u32, response: Response) {
        match self.in_flight.remove(&id) {
            Some(sender) => {
                if sender.send(Ok(response)).is_err() {
                    trace!("SFTP request {} abandoned before its response", id);
                }
            }
            None => debug!("Discarding {} for unknown SFTP request {}", response.name(), id),
        }
    }

    /// Forgets a request whose waiter has gone away.
    fn abandon(&mut self, id: u32) {
        if self
            .in_flight
            .get(&id)
            .is_some_and(|sender| sender.is_closed())
        {
            self.in_flight.remove(&id);
        }
    }

    fn fail_all(&mut self, reason: &str) {
        self.closed = Some(reason.to_string());
        for (_, sender) in self.in_flight.drain() {
            let _ = sender.send(Err(SkerryError::SessionClosed {
                reason: reason.to_string(),
            }));
        }
    }

    fn len(&self) -> usize {
        self.in_flight.len()
    }
}

/// A registered request awaiting its response.
///
/// Dropping it before the response is taken removes the id from the
/// in-flight table, whether the wait timed out or the caller went away.
struct PendingRequest {
    id: u32,
    requests: Arc<Mutex<RequestTable>>,
    response: oneshot::Receiver<SkerryResult<Response>>,
    answered: bool,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        self.response.close();
        let id = self.id;
        match self.requests.try_lock() {
            Ok(mut table) => table.abandon(id),
            Err(_) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let requests = Arc::clone(&self.requests);
                    runtime.spawn(async move {
                        requests.lock().await.abandon(id);
                    });
                }
            }
        }
    }
}

/// State shared by every clone of a client and by [`RemoteFile`]s.
#[derive(Debug)]
pub(crate) struct SftpInner {
    writer: ChannelWriter,
    requests: Arc<Mutex<RequestTable>>,
    config: SftpConfig,
    version: u32,
    extensions: Vec<(String, String)>,
    reader_task: JoinHandle<()>,
}

impl Drop for SftpInner {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let writer = self.writer.clone();
            runtime.spawn(async move {
                let _ = writer.close().await;
            });
        }
    }
}

/// SFTP client.
///
/// Cheap to clone; clones share the subsystem channel. Every method takes
/// `&self`, so requests from several tasks run concurrently.
///
/// # Example
///
/// ```rust,no_run
/// use skerry_proto::ssh::client::SshClient;
/// use skerry_proto::ssh::sftp::OpenFlags;
/// use std::time::Duration;
///
/// # async fn example(client: &SshClient) -> skerry_platform::SkerryResult<()> {
/// let sftp = client.sftp().await?;
///
/// for entry in sftp.list_directory("/var/log").await? {
///     println!("{} {:?}", entry.filename, entry.attrs.size);
/// }
///
/// let handle = sftp.open("/etc/hostname", OpenFlags::READ).await?;
/// let data = sftp.read(&handle, 0, 4096).await?;
/// sftp.close(&handle).await?;
///
/// // A tighter deadline for one call.
/// sftp.with_timeout(Duration::from_secs(2)).remove("/tmp/scratch").await?;
/// # let _ = data;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SftpClient {
    inner: Arc<SftpInner>,
    timeout: Duration,
}

impl SftpClient {
    /// Runs the version handshake on a channel whose "sftp" subsystem has
    /// been started, then spawns the response reader.
    ///
    /// # Errors
    ///
    /// - [`SkerryError::UnsupportedVersion`] if the server speaks a
    ///   version below 3
    /// - [`SkerryError::ChannelClosed`] if the server closes the channel
    /// - [`SkerryError::Io`] with `TimedOut` if VERSION does not arrive
    pub async fn start(channel: SshChannel, config: SftpConfig) -> SkerryResult<Self> {
        let (writer, mut reader) = channel.into_split();
        let mut buffer = PacketBuffer::new();

        let handshake = tokio::time::timeout(
            config.request_timeout,
            Self::exchange_versions(&writer, &mut reader, &mut buffer),
        )
        .await
        .unwrap_or_else(|_| {
            Err(SkerryError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "SFTP version exchange timed out",
            )))
        });

        let info = match handshake.and_then(Self::negotiate_version) {
            Ok(info) => info,
            Err(err) => {
                let _ = writer.close().await;
                return Err(err);
            }
        };
        info!(
            "SFTP session ready (version {}, {} extensions)",
            info.version,
            info.extensions.len()
        );

        let requests = Arc::new(Mutex::new(RequestTable::default()));
        let reader_task = tokio::spawn(read_responses(reader, buffer, Arc::clone(&requests)));

        let timeout = config.request_timeout;
        Ok(Self {
            inner: Arc::new(SftpInner {
                writer,
                requests,
                config,
                version: info.version,
                extensions: info.extensions,
                reader_task,
            }),
            timeout,
        })
    }

    async fn exchange_versions(
        writer: &ChannelWriter,
        reader: &mut ChannelReader,
        buffer: &mut PacketBuffer,
    ) -> SkerryResult<VersionInfo> {
        debug!("Sending SFTP INIT (version {})", SFTP_VERSION);
        writer.send(&message::init(SFTP_VERSION).to_bytes()).await?;

        loop {
            if let Some(message) = buffer.next_message()? {
                return VersionInfo::decode(&message);
            }
            match reader.read().await? {
                Some(data) => buffer.extend(&data),
                None => {
                    return Err(SkerryError::ChannelClosed {
                        channel: reader.local_id(),
                    })
                }
            }
        }
    }

    fn negotiate_version(mut info: VersionInfo) -> SkerryResult<VersionInfo> {
        if info.version < SFTP_VERSION {
            return Err(SkerryError::UnsupportedVersion(format!(
                "SFTP server speaks version {}, need {}",
                info.version, SFTP_VERSION
            )));
        }
        if info.version > SFTP_VERSION {
            debug!(
                "SFTP server offered version {}, using {}",
                info.version, SFTP_VERSION
            );
            info.version = SFTP_VERSION;
        }
        Ok(info)
    }

    pub(crate) fn from_inner(inner: Arc<SftpInner>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<SftpInner> {
        Arc::downgrade(&self.inner)
    }

    /// Returns a client sharing this session whose requests use `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            timeout,
        }
    }

    /// The per-request timeout used by this client.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// Extension pairs announced by the server.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.inner.extensions
    }

    /// Returns true if the server announced extension `name`.
    pub fn has_extension(&self, name: &str) -> bool {
        self.inner.extensions.iter().any(|(n, _)| n == name)
    }

    /// Number of requests awaiting a response.
    pub async fn in_flight(&self) -> usize {
        self.inner.requests.lock().await.len()
    }

    /// Sends one request and waits for its response, both under one
    /// deadline.
    ///
    /// The frame is written by its own task, so a deadline that expires
    /// while the channel window is exhausted never leaves half a request
    /// on the stream.
    async fn request(&self, request: Request) -> SkerryResult<Response> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.requests.lock().await.register(tx)?;
        let mut pending = PendingRequest {
            id,
            requests: Arc::clone(&self.inner.requests),
            response: rx,
            answered: false,
        };
        let packet = request.to_message(id);
        trace!("SFTP request {} {:?}", id, packet.msg_type);

        let writer = self.inner.writer.clone();
        let frame = packet.to_bytes();
        let sending = tokio::spawn(async move { writer.send(&frame).await });

        let PendingRequest {
            response, answered, ..
        } = &mut pending;
        let exchange = async move {
            match sending.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(err) => {
                    return Err(SkerryError::SessionClosed {
                        reason: format!("SFTP writer failed: {}", err),
                    })
                }
            }
            let outcome = response.await;
            *answered = true;
            match outcome {
                Ok(result) => result,
                Err(_) => Err(SkerryError::SessionClosed {
                    reason: "SFTP session closed".to_string(),
                }),
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!("SFTP request {} timed out after {:?}", id, self.timeout);
                Err(SkerryError::CommandTimeout { request_id: id })
            }
        }
    }

    async fn request_status(&self, request: Request) -> SkerryResult<()> {
        match self.request(request).await? {
            Response::Status(status) => status.into_result(),
            other => Err(unexpected(other, "STATUS")),
        }
    }

    async fn request_handle(&self, request: Request) -> SkerryResult<FileHandle> {
        match self.request(request).await? {
            Response::Handle(handle) => Ok(FileHandle(handle)),
            Response::Status(status) => Err(status.into_error()),
            other => Err(unexpected(other, "HANDLE")),
        }
    }

    async fn request_attrs(&self, request: Request) -> SkerryResult<FileAttributes> {
        match self.request(request).await? {
            Response::Attrs(attrs) => Ok(attrs),
            Response::Status(status) => Err(status.into_error()),
            other => Err(unexpected(other, "ATTRS")),
        }
    }

    async fn request_name(&self, request: Request) -> SkerryResult<String> {
        match self.request(request).await? {
            Response::Name(mut entries) if entries.len() == 1 => Ok(entries.remove(0).filename),
            Response::Name(entries) => Err(SkerryError::ProtocolViolation(format!(
                "Expected one name, got {}",
                entries.len()
            ))),
            Response::Status(status) => Err(status.into_error()),
            other => Err(unexpected(other, "NAME")),
        }
    }

    /// Opens a file.
    pub async fn open(&self, path: &str, flags: OpenFlags) -> SkerryResult<FileHandle> {
        self.open_with_attrs(path, flags, FileAttributes::new()).await
    }

    /// Opens a file, supplying attributes for a newly created one.
    pub async fn open_with_attrs(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: FileAttributes,
    ) -> SkerryResult<FileHandle> {
        debug!("SFTP open {} ({:#x})", path, flags.bits());
        self.request_handle(Request::Open {
            path: path.to_string(),
            flags,
            attrs,
        })
        .await
    }

    /// Closes a file or directory handle.
    pub async fn close(&self, handle: &FileHandle) -> SkerryResult<()> {
        self.request_status(Request::Close {
            handle: handle.0.clone(),
        })
        .await
    }

    /// Reads up to `len` bytes at `offset`. The server may return fewer.
    ///
    /// `len` is capped at the configured chunk size.
    ///
    /// # Errors
    ///
    /// [`SkerryError::File`] with [`FileErrorKind::EndOfFile`] when
    /// `offset` is at or past the end of the file.
    pub async fn read(&self, handle: &FileHandle, offset: u64, len: u32) -> SkerryResult<Vec<u8>> {
        let len = len.min(self.inner.config.chunk_size).min(MAX_PACKET_LEN as u32 - 64);
        match self
            .request(Request::Read {
                handle: handle.0.clone(),
                offset,
                len,
            })
            .await?
        {
            Response::Data(data) => Ok(data),
            Response::Status(status) => Err(status.into_error()),
            other => Err(unexpected(other, "DATA")),
        }
    }

    /// Reads from `offset` to the end of the file.
    pub async fn read_to_end(&self, handle: &FileHandle, mut offset: u64) -> SkerryResult<Vec<u8>> {
        let mut contents = Vec::new();
        loop {
            match self.read(handle, offset, self.inner.config.chunk_size).await {
                Ok(data) if data.is_empty() => {
                    return Err(SkerryError::ProtocolViolation(format!(
                        "SFTP server returned no data at offset {} without end of file",
                        offset
                    )))
                }
                Ok(data) => {
                    offset += data.len() as u64;
                    contents.extend_from_slice(&data);
                }
                Err(SkerryError::File {
                    kind: FileErrorKind::EndOfFile,
                    ..
                }) => return Ok(contents),
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes `data` at `offset`, split into chunk-sized requests.
    pub async fn write(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> SkerryResult<()> {
        let chunk_size = self.inner.config.chunk_size.max(1) as usize;
        let mut position = offset;
        for chunk in data.chunks(chunk_size) {
            self.request_status(Request::Write {
                handle: handle.0.clone(),
                offset: position,
                data: chunk.to_vec(),
            })
            .await?;
            position += chunk.len() as u64;
        }
        Ok(())
    }

    /// Attributes of `path`, following symbolic links.
    pub async fn stat(&self, path: &str) -> SkerryResult<FileAttributes> {
        self.request_attrs(Request::Stat {
            path: path.to_string(),
        })
        .await
    }

    /// Attributes of `path` itself, not following symbolic links.
    pub async fn lstat(&self, path: &str) -> SkerryResult<FileAttributes> {
        self.request_attrs(Request::LStat {
            path: path.to_string(),
        })
        .await
    }

    /// Attributes of an open file.
    pub async fn fstat(&self, handle: &FileHandle) -> SkerryResult<FileAttributes> {
        self.request_attrs(Request::FStat {
            handle: handle.0.clone(),
        })
        .await
    }

    /// Applies the fields present in `attrs` to `path`.
    pub async fn set_attributes(&self, path: &str, attrs: FileAttributes) -> SkerryResult<()> {
        debug!("SFTP setstat {} ({:#x})", path, attrs.flags());
        self.request_status(Request::SetStat {
            path: path.to_string(),
            attrs,
        })
        .await
    }

    /// Applies the fields present in `attrs` to an open file.
    pub async fn fset_attributes(&self, handle: &FileHandle, attrs: FileAttributes) -> SkerryResult<()> {
        self.request_status(Request::FSetStat {
            handle: handle.0.clone(),
            attrs,
        })
        .await
    }

    /// Opens a directory for listing.
    pub async fn opendir(&self, path: &str) -> SkerryResult<FileHandle> {
        self.request_handle(Request::OpenDir {
            path: path.to_string(),
        })
        .await
    }

    /// Starts a lazy listing of an open directory handle.
    ///
    /// The listing borrows the handle; closing it stays with the caller.
    pub fn read_dir(&self, handle: FileHandle) -> DirectoryListing {
        DirectoryListing {
            client: self.clone(),
            handle,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Lists `path`, without the `.` and `..` entries.
    ///
    /// Opens the directory, drains the listing and closes the handle.
    pub async fn list_directory(&self, path: &str) -> SkerryResult<Vec<NameEntry>> {
        let handle = self.opendir(path).await?;
        let mut listing = self.read_dir(handle.clone());

        let mut entries = Vec::new();
        let drained = loop {
            match listing.next_entry().await {
                Ok(Some(entry)) => {
                    if entry.filename != "." && entry.filename != ".." {
                        entries.push(entry);
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        let closed = self.close(&handle).await;
        drained?;
        closed?;
        Ok(entries)
    }

    /// Removes a file.
    pub async fn remove(&self, path: &str) -> SkerryResult<()> {
        debug!("SFTP remove {}", path);
        self.request_status(Request::Remove {
            path: path.to_string(),
        })
        .await
    }

    /// Creates a directory with default attributes.
    pub async fn mkdir(&self, path: &str) -> SkerryResult<()> {
        self.mkdir_with_attrs(path, FileAttributes::new()).await
    }

    /// Creates a directory with the given attributes.
    pub async fn mkdir_with_attrs(&self, path: &str, attrs: FileAttributes) -> SkerryResult<()> {
        debug!("SFTP mkdir {}", path);
        self.request_status(Request::MkDir {
            path: path.to_string(),
            attrs,
        })
        .await
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, path: &str) -> SkerryResult<()> {
        debug!("SFTP rmdir {}", path);
        self.request_status(Request::RmDir {
            path: path.to_string(),
        })
        .await
    }

    /// Renames `old_path` to `new_path`.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> SkerryResult<()> {
        debug!("SFTP rename {} -> {}", old_path, new_path);
        self.request_status(Request::Rename {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        })
        .await
    }

    /// Canonical absolute form of `path`.
    pub async fn realpath(&self, path: &str) -> SkerryResult<String> {
        self.request_name(Request::RealPath {
            path: path.to_string(),
        })
        .await
    }

    /// Target of the symbolic link at `path`.
    pub async fn readlink(&self, path: &str) -> SkerryResult<String> {
        self.request_name(Request::ReadLink {
            path: path.to_string(),
        })
        .await
    }

    /// Creates a symbolic link at `link_path` pointing to `target_path`.
    pub async fn symlink(&self, link_path: &str, target_path: &str) -> SkerryResult<()> {
        self.request_status(Request::Symlink {
            link_path: link_path.to_string(),
            target_path: target_path.to_string(),
            reversed: self.inner.config.reverse_symlink_arguments,
        })
        .await
    }

    /// Stats `path` and wraps the result as a [`RemoteFile`].
    pub async fn metadata(&self, path: &str) -> SkerryResult<RemoteFile> {
        let attrs = self.stat(path).await?;
        Ok(RemoteFile::new(path.to_string(), attrs, self))
    }

    /// Closes the subsystem channel. Outstanding requests fail.
    pub async fn shutdown(&self) -> SkerryResult<()> {
        self.inner.writer.close().await
    }
}

fn unexpected(response: Response, wanted: &str) -> SkerryError {
    SkerryError::ProtocolViolation(format!(
        "Expected SFTP {} response, got {}",
        wanted,
        response.name()
    ))
}

/// Routes responses until the channel closes, then fails the leftovers.
async fn read_responses(
    mut reader: ChannelReader,
    mut buffer: PacketBuffer,
    requests: Arc<Mutex<RequestTable>>,
) {
    let reason = match pump_responses(&mut reader, &mut buffer, &requests).await {
        Ok(()) => "SFTP channel closed".to_string(),
        Err(SkerryError::SessionClosed { reason }) => reason,
        Err(err) => {
            warn!("SFTP reader stopped: {}", err);
            err.to_string()
        }
    };
    debug!("SFTP reader finished: {}", reason);
    requests.lock().await.fail_all(&reason);
}

async fn pump_responses(
    reader: &mut ChannelReader,
    buffer: &mut PacketBuffer,
    requests: &Mutex<RequestTable>,
) -> SkerryResult<()> {
    loop {
        while let Some(message) = buffer.next_message()? {
            let (id, response) = Response::decode(&message)?;
            trace!("SFTP response {} {}", id, response.name());
            requests.lock().await.complete(id, response);
        }
        match reader.read().await? {
            Some(data) => buffer.extend(&data),
            None => return Ok(()),
        }
    }
}

/// A lazy, single-pass directory listing.
///
/// Entries are fetched one READDIR batch at a time. The listing ends at
/// the server's end-of-file status or at the first error, after which
/// [`next_entry`](Self::next_entry) keeps returning `Ok(None)`. It cannot
/// be restarted; open the directory again for a fresh listing.
#[derive(Debug)]
pub struct DirectoryListing {
    client: SftpClient,
    handle: FileHandle,
    pending: VecDeque<NameEntry>,
    finished: bool,
}

impl DirectoryListing {
    /// The directory handle being listed.
    pub fn handle(&self) -> &FileHandle {
        &self.handle
    }

    /// Returns true once the listing is exhausted.
    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    /// Next entry, or `None` when the listing is exhausted.
    pub async fn next_entry(&mut self) -> SkerryResult<Option<NameEntry>> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Ok(Some(entry));
            }
            if self.finished {
                return Ok(None);
            }

            let response = self
                .client
                .request(Request::ReadDir {
                    handle: self.handle.0.clone(),
                })
                .await;
            match response {
                Ok(Response::Name(entries)) => self.pending.extend(entries),
                Ok(Response::Status(status)) => {
                    self.finished = true;
                    match status.into_error() {
                        SkerryError::File {
                            kind: FileErrorKind::EndOfFile,
                            ..
                        } => return Ok(None),
                        err => return Err(err),
                    }
                }
                Ok(other) => {
                    self.finished = true;
                    return Err(unexpected(other, "NAME"));
                }
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::sftp::message::Status;
    use crate::ssh::sftp::message::StatusCode;

    fn ok_status() -> Response {
        Response::Status(Status::new(StatusCode::Ok, ""))
    }

    #[test]
    fn test_config_defaults() {
        let config = SftpConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.chunk_size, 32 * 1024);
        assert!(config.reverse_symlink_arguments);

        let config = config
            .with_request_timeout(Duration::from_secs(5))
            .with_chunk_size(1024)
            .with_reverse_symlink_arguments(false);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.chunk_size, 1024);
        assert!(!config.reverse_symlink_arguments);
    }

    #[test]
    fn test_ids_are_sequential_and_skip_in_flight() {
        let mut table = RequestTable::default();
        let (a, _rx_a) = oneshot::channel();
        let (b, _rx_b) = oneshot::channel();
        assert_eq!(table.register(a).unwrap(), 0);
        assert_eq!(table.register(b).unwrap(), 1);

        // Wrap around onto ids 0 and 1, which are still outstanding.
        table.next_id = u32::MAX;
        let (c, _rx_c) = oneshot::channel();
        let (d, _rx_d) = oneshot::channel();
        assert_eq!(table.register(c).unwrap(), u32::MAX);
        assert_eq!(table.register(d).unwrap(), 2);
    }

    #[test]
    fn test_completed_ids_are_reusable() {
        let mut table = RequestTable::default();
        let (tx, mut rx) = oneshot::channel();
        let id = table.register(tx).unwrap();
        table.complete(id, ok_status());
        assert!(matches!(rx.try_recv(), Ok(Ok(Response::Status(_)))));

        table.next_id = id;
        let (tx, _rx) = oneshot::channel();
        assert_eq!(table.register(tx).unwrap(), id);
    }

    #[test]
    fn test_late_response_is_discarded() {
        let mut table = RequestTable::default();
        let (tx, rx) = oneshot::channel();
        let id = table.register(tx).unwrap();

        drop(rx);
        table.abandon(id);
        assert_eq!(table.len(), 0);

        // The orphaned response finds nobody and changes nothing.
        table.complete(id, ok_status());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_abandon_keeps_live_requests() {
        let mut table = RequestTable::default();
        let (tx, _rx) = oneshot::channel();
        let id = table.register(tx).unwrap();
        table.abandon(id);
        assert_eq!(table.len(), 1);
    }

    fn pending(requests: &Arc<Mutex<RequestTable>>) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let id = requests.try_lock().unwrap().register(tx).unwrap();
        PendingRequest {
            id,
            requests: Arc::clone(requests),
            response: rx,
            answered: false,
        }
    }

    #[tokio::test]
    async fn test_dropped_request_leaves_table() {
        let requests = Arc::new(Mutex::new(RequestTable::default()));
        let first = pending(&requests);
        let _second = pending(&requests);
        assert_eq!(requests.lock().await.len(), 2);

        drop(first);
        assert_eq!(requests.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_request_cleans_up_after_lock_is_free() {
        let requests = Arc::new(Mutex::new(RequestTable::default()));
        let request = pending(&requests);

        let table = requests.lock().await;
        drop(request);
        assert_eq!(table.len(), 1);
        drop(table);

        for _ in 0..10 {
            tokio::task::yield_now().await;
            if requests.lock().await.len() == 0 {
                break;
            }
        }
        assert_eq!(requests.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn test_answered_request_leaves_reused_id_alone() {
        let requests = Arc::new(Mutex::new(RequestTable::default()));
        let mut request = pending(&requests);
        let id = request.id;
        requests.lock().await.complete(id, ok_status());
        request.answered = true;

        // The id is free again and taken by a live request.
        requests.lock().await.next_id = id;
        let other = pending(&requests);
        assert_eq!(other.id, id);

        drop(request);
        assert_eq!(requests.lock().await.len(), 1);
        drop(other);
    }

    #[test]
    fn test_fail_all_closes_table() {
        let mut table = RequestTable::default();
        let (tx, mut rx) = oneshot::channel();
        table.register(tx).unwrap();

        table.fail_all("Connection closed by peer");
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(SkerryError::SessionClosed { reason })) if reason == "Connection closed by peer"
        ));

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            table.register(tx),
            Err(SkerryError::SessionClosed { .. })
        ));
    }

    #[test]
    fn test_version_negotiation() {
        let info = |version| VersionInfo {
            version,
            extensions: Vec::new(),
        };
        assert_eq!(SftpClient::negotiate_version(info(3)).unwrap().version, 3);
        assert_eq!(SftpClient::negotiate_version(info(6)).unwrap().version, 3);
        assert!(matches!(
            SftpClient::negotiate_version(info(2)),
            Err(SkerryError::UnsupportedVersion(_))
        ));
    }
}
