use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result, TransferError};
use crate::network::{Connection, FrameError};
use crate::protocol::{ErrorCode, Message, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle of one transfer.
///
/// Upload:   Init -> BeginSent -> Streaming -> EndSent -> Acked
/// Download: Requested -> BeginReceived -> Streaming -> EndReceived
///
/// Streaming is skipped for empty files. Any state may move to Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    BeginSent,
    Requested,
    BeginReceived,
    Streaming,
    EndSent,
    EndReceived,
    Acked,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Acked | TransferState::EndReceived | TransferState::Failed
        )
    }

    fn can_advance(self, direction: Direction, next: TransferState) -> bool {
        use TransferState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        match direction {
            Direction::Upload => matches!(
                (self, next),
                (Init, BeginSent)
                    | (BeginSent, Streaming)
                    | (BeginSent, EndSent)
                    | (Streaming, Streaming)
                    | (Streaming, EndSent)
                    | (EndSent, Acked)
            ),
            Direction::Download => matches!(
                (self, next),
                (Requested, BeginReceived)
                    | (BeginReceived, Streaming)
                    | (BeginReceived, EndReceived)
                    | (Streaming, Streaming)
                    | (Streaming, EndReceived)
            ),
        }
    }
}

/// One in-progress upload or download
#[derive(Debug, Clone)]
pub struct TransferSession {
    file_name: String,
    total_bytes: u64,
    bytes_transferred: u64,
    direction: Direction,
    state: TransferState,
}

impl TransferSession {
    pub fn upload(file_name: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            file_name: file_name.into(),
            total_bytes,
            bytes_transferred: 0,
            direction: Direction::Upload,
            state: TransferState::Init,
        }
    }

    /// Size is unknown until DOWNLOAD_BEGIN arrives
    pub fn download(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            total_bytes: 0,
            bytes_transferred: 0,
            direction: Direction::Download,
            state: TransferState::Requested,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Move to `next`, refusing transitions the state machine does not allow
    pub fn advance(&mut self, next: TransferState) -> bool {
        if self.state.can_advance(self.direction, next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn fail(&mut self) {
        self.advance(TransferState::Failed);
    }

    /// Download side: DOWNLOAD_BEGIN announced the size
    pub fn begin(&mut self, total_bytes: u64) -> bool {
        let ok = self.advance(TransferState::BeginReceived);
        if ok {
            self.total_bytes = total_bytes;
        }
        ok
    }

    /// Count a chunk. Moving past the announced total is a protocol violation.
    pub fn record(&mut self, n: usize) -> Result<(), ProtocolError> {
        let next = self.bytes_transferred + n as u64;
        if next > self.total_bytes {
            self.fail();
            return Err(ProtocolError::Overrun {
                name: self.file_name.clone(),
                total: self.total_bytes,
            });
        }
        self.bytes_transferred = next;
        self.advance(TransferState::Streaming);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.total_bytes
    }

    /// Completed fraction in [0, 1]; an empty transfer counts as complete
    pub fn fraction(&self) -> f64 {
        fraction(self.bytes_transferred, self.total_bytes)
    }

    fn progress_event(&self) -> TransferEvent {
        TransferEvent::Progress {
            name: self.file_name.clone(),
            direction: self.direction,
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
        }
    }

    /// Map a lost stream to a failed transfer, keeping protocol errors as they are
    fn interrupted(&mut self, err: FrameError) -> Error {
        self.fail();
        match err {
            FrameError::Protocol(e) => Error::Protocol(e),
            _ => TransferError::Interrupted {
                name: self.file_name.clone(),
                transferred: self.bytes_transferred,
                total: self.total_bytes,
            }
            .into(),
        }
    }
}

pub fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).min(1.0)
}

/// Per-file outcome reported in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Ok,
    Failed,
}

/// Progress notifications for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    BatchStarted {
        count: usize,
    },
    Started {
        name: String,
        direction: Direction,
        total_bytes: u64,
    },
    Progress {
        name: String,
        direction: Direction,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    Finished {
        name: String,
        direction: Direction,
        /// Bytes moved, or the failure rendered as text
        result: Result<u64, String>,
    },
    BatchFinished {
        statuses: Vec<FileStatus>,
    },
}

/// Receives transfer events on the transfer's own task; must return quickly
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: TransferEvent);
}

/// Observer that drops every event
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_event(&self, _event: TransferEvent) {}
}

impl<F> ProgressObserver for F
where
    F: Fn(TransferEvent) + Send + Sync,
{
    fn on_event(&self, event: TransferEvent) {
        self(event)
    }
}

/// Sending half of an event stream; never blocks the transfer
#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<TransferEvent>);

impl ProgressObserver for EventSender {
    fn on_event(&self, event: TransferEvent) {
        // A consumer that went away just stops watching
        let _ = self.0.send(event);
    }
}

/// Receiving half of an event stream
pub struct EventStream(mpsc::UnboundedReceiver<TransferEvent>);

impl EventStream {
    /// Next event, or None once every sender is gone
    pub async fn next(&mut self) -> Option<TransferEvent> {
        self.0.recv().await
    }

    /// Non-blocking poll for UI loops
    pub fn try_next(&mut self) -> Option<TransferEvent> {
        self.0.try_recv().ok()
    }
}

pub fn event_channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender(tx), EventStream(rx))
}

/// File chunker for streaming transfer
pub struct FileChunker {
    file: File,
    chunk_size: usize,
    total_size: u64,
    bytes_read: u64,
}

impl FileChunker {
    /// Open a local file; its current length becomes the announced size
    pub async fn open(path: &Path, chunk_size: usize) -> io::Result<Self> {
        let file = File::open(path).await?;
        let metadata = file.metadata().await?;
        if metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "is a directory",
            ));
        }
        Ok(Self::new(file, metadata.len(), chunk_size))
    }

    /// Stream exactly `total_size` bytes from an already opened file
    pub fn new(file: File, total_size: u64, chunk_size: usize) -> Self {
        Self {
            file,
            chunk_size: chunk_size.max(1),
            total_size,
            bytes_read: 0,
        }
    }

    /// Read the next chunk. Returns None at the announced size, or early if the
    /// file shrank underneath us.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let remaining = self.total_size - self.bytes_read;
        if remaining == 0 {
            return Ok(None);
        }

        let want = remaining.min(self.chunk_size as u64) as usize;
        let mut buffer = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }

        buffer.truncate(filled);
        self.bytes_read += filled as u64;
        Ok(Some(buffer))
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Writes into a hidden sibling file and renames it over the target on commit.
/// Dropping an uncommitted writer removes the partial file.
pub struct FileWriter {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    committed: bool,
}

impl FileWriter {
    pub async fn create(final_path: &Path) -> io::Result<Self> {
        let file_name = final_path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy()
            .into_owned();
        let dir = match final_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp_path = dir.join(format!(".{}.{:08x}.part", file_name, rand::random::<u32>()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        Ok(Self {
            file,
            temp_path,
            final_path: final_path.to_path_buf(),
            bytes_written: 0,
            committed: false,
        })
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Flush and fsync the temp file
    pub async fn sync(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }

    /// Rename into place without syncing; call [`FileWriter::sync`] first
    pub async fn persist(mut self) -> io::Result<u64> {
        fs::rename(&self.temp_path, &self.final_path).await?;
        self.committed = true;
        Ok(self.bytes_written)
    }

    /// Make the file visible under its final name
    pub async fn commit(mut self) -> io::Result<u64> {
        self.sync().await?;
        self.persist().await
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Name a local file is published under on the server
pub fn remote_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            Error::local(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a valid UTF-8 file name"),
            )
        })
}

/// Translate a server ERROR reply into the client taxonomy
fn remote_error(session: &TransferSession, code: ErrorCode, message: String) -> Error {
    match code {
        ErrorCode::NotFound => Error::NotFound(session.file_name.clone()),
        ErrorCode::SizeMismatch => TransferError::SizeMismatch {
            name: session.file_name.clone(),
            expected: session.total_bytes,
            actual: session.bytes_transferred,
        }
        .into(),
        code => Error::Remote {
            name: session.file_name.clone(),
            code,
            message,
        },
    }
}

fn finish(observer: &dyn ProgressObserver, name: &str, direction: Direction, result: &Result<u64>) {
    observer.on_event(TransferEvent::Finished {
        name: name.to_string(),
        direction,
        result: result.as_ref().copied().map_err(|e| e.to_string()),
    });
}

/// Upload one local file: UPLOAD_BEGIN, chunks, UPLOAD_END, then wait for the ack.
pub async fn upload_file<S>(
    conn: &mut Connection<S>,
    path: &Path,
    chunk_size: usize,
    observer: &dyn ProgressObserver,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = match remote_name(path) {
        Ok(name) => name,
        Err(e) => {
            let name = path.display().to_string();
            let result = Err(e);
            finish(observer, &name, Direction::Upload, &result);
            return result;
        }
    };
    let result = upload_inner(conn, path, &name, chunk_size, observer).await;
    finish(observer, &name, Direction::Upload, &result);
    result
}

async fn upload_inner<S>(
    conn: &mut Connection<S>,
    path: &Path,
    name: &str,
    chunk_size: usize,
    observer: &dyn ProgressObserver,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut chunker = FileChunker::open(path, chunk_size)
        .await
        .map_err(|e| Error::local(path, e))?;
    let mut session = TransferSession::upload(name, chunker.total_size());

    conn.send(&Message::UploadBegin {
        name: name.to_string(),
        total_bytes: session.total_bytes(),
    })
    .await
    .map_err(|e| session.interrupted(e))?;
    session.advance(TransferState::BeginSent);
    debug!("UPLOAD_BEGIN {} ({} bytes)", name, session.total_bytes());

    observer.on_event(TransferEvent::Started {
        name: name.to_string(),
        direction: Direction::Upload,
        total_bytes: session.total_bytes(),
    });

    // A local read failure still ends the stream with UPLOAD_END so the server
    // discards the partial file and the session stays aligned
    let mut local_err = None;
    loop {
        match chunker.next_chunk().await {
            Ok(Some(chunk)) => {
                let len = chunk.len();
                conn.send(&Message::UploadChunk(chunk))
                    .await
                    .map_err(|e| session.interrupted(e))?;
                session.record(len)?;
                observer.on_event(session.progress_event());
            }
            Ok(None) => break,
            Err(e) => {
                local_err = Some(e);
                break;
            }
        }
    }

    conn.send(&Message::UploadEnd)
        .await
        .map_err(|e| session.interrupted(e))?;
    session.advance(TransferState::EndSent);

    let reply = conn.receive().await.map_err(|e| session.interrupted(e))?;
    if let Some(e) = local_err {
        session.fail();
        return Err(Error::local(path, e));
    }

    match reply {
        Message::UploadEnd if session.is_complete() => {
            session.advance(TransferState::Acked);
            info!("Uploaded {} ({} bytes)", name, session.total_bytes());
            Ok(session.total_bytes())
        }
        Message::UploadEnd => {
            session.fail();
            Err(TransferError::SizeMismatch {
                name: name.to_string(),
                expected: session.total_bytes(),
                actual: session.bytes_transferred(),
            }
            .into())
        }
        Message::Error { code, message } => {
            session.fail();
            Err(remote_error(&session, code, message))
        }
        other => {
            session.fail();
            Err(ProtocolError::Unexpected {
                expected: "UPLOAD_END or ERROR",
                got: other.kind(),
            }
            .into())
        }
    }
}

/// Download `name` into `dest`. The destination only appears once every byte arrived.
pub async fn download_file<S>(
    conn: &mut Connection<S>,
    name: &str,
    dest: &Path,
    observer: &dyn ProgressObserver,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = download_inner(conn, name, dest, observer).await;
    finish(observer, name, Direction::Download, &result);
    result
}

async fn download_inner<S>(
    conn: &mut Connection<S>,
    name: &str,
    dest: &Path,
    observer: &dyn ProgressObserver,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = TransferSession::download(name);
    conn.send(&Message::DownloadRequest {
        name: name.to_string(),
    })
    .await?;

    match conn.receive().await? {
        Message::DownloadBegin {
            name: begin_name,
            total_bytes,
        } if begin_name == name => {
            session.begin(total_bytes);
        }
        Message::Error { code, message } => {
            session.fail();
            return Err(remote_error(&session, code, message));
        }
        other => {
            session.fail();
            return Err(ProtocolError::Unexpected {
                expected: "DOWNLOAD_BEGIN or ERROR",
                got: other.kind(),
            }
            .into());
        }
    }
    debug!("DOWNLOAD_BEGIN {} ({} bytes)", name, session.total_bytes());

    observer.on_event(TransferEvent::Started {
        name: name.to_string(),
        direction: Direction::Download,
        total_bytes: session.total_bytes(),
    });

    // On a local write failure keep draining to DOWNLOAD_END so the session stays aligned
    let mut local_err = None;
    let mut writer = match FileWriter::create(dest).await {
        Ok(w) => Some(w),
        Err(e) => {
            local_err = Some(e);
            None
        }
    };

    loop {
        match conn.receive().await.map_err(|e| session.interrupted(e))? {
            Message::DownloadChunk(data) => {
                session.record(data.len())?;
                let failed = match writer.as_mut() {
                    Some(w) => w.write_chunk(&data).await.err(),
                    None => None,
                };
                if let Some(e) = failed {
                    local_err = Some(e);
                    writer = None;
                }
                observer.on_event(session.progress_event());
            }
            Message::DownloadEnd => {
                session.advance(TransferState::EndReceived);
                break;
            }
            Message::Error { code, message } => {
                session.fail();
                return Err(remote_error(&session, code, message));
            }
            other => {
                session.fail();
                return Err(ProtocolError::Unexpected {
                    expected: "DOWNLOAD_CHUNK or DOWNLOAD_END",
                    got: other.kind(),
                }
                .into());
            }
        }
    }

    if let Some(e) = local_err {
        return Err(Error::local(dest, e));
    }
    if !session.is_complete() {
        return Err(TransferError::SizeMismatch {
            name: name.to_string(),
            expected: session.total_bytes(),
            actual: session.bytes_transferred(),
        }
        .into());
    }
    if let Some(w) = writer {
        w.commit().await.map_err(|e| Error::local(dest, e))?;
    }

    info!(
        "Downloaded {} ({} bytes) to {}",
        name,
        session.total_bytes(),
        dest.display()
    );
    Ok(session.total_bytes())
}
