//! Client side of one connection: connect, serialized requests, orderly close.

use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::network::{self, Connection};
use crate::protocol::{FileDescriptor, Message, ProtocolError};
use crate::transfer::{self, Direction, FileStatus, ProgressObserver, TransferEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Transferring,
    Closing,
    Closed,
}

/// Result of one file in a batch upload
#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub result: Result<u64>,
}

impl FileOutcome {
    pub fn status(&self) -> FileStatus {
        match self.result {
            Ok(_) => FileStatus::Ok,
            Err(_) => FileStatus::Failed,
        }
    }
}

/// One client connection. Requests are serialized: concurrent callers wait their
/// turn on the connection lock, so at most one transfer is active at a time.
pub struct Session {
    addr: String,
    chunk_size: usize,
    conn: Mutex<Option<Connection<TcpStream>>>,
    state: watch::Sender<ConnectionState>,
    // Fired by close(); aborts the request in flight
    closing: CancellationToken,
}

impl Session {
    /// Open a TCP connection. No greeting is exchanged; the session is ready as
    /// soon as the socket is.
    pub async fn connect(addr: &str, chunk_size: usize) -> Result<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let conn = network::connect(addr).await.map_err(|source| Error::Connect {
            addr: addr.to_string(),
            source,
        })?;
        state.send_replace(ConnectionState::Handshaking);
        debug!("Connected to {:?}", conn.peer_addr());
        state.send_replace(ConnectionState::Ready);

        Ok(Self {
            addr: addr.to_string(),
            chunk_size,
            conn: Mutex::new(Some(conn)),
            state,
            closing: CancellationToken::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        !matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    /// Resolves once the session has been closed or lost
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub async fn list_files(&self) -> Result<Vec<FileDescriptor>> {
        let mut lease = self.lease().await?;
        let result = match lease.begin(ConnectionState::Ready) {
            Ok(conn) => self.abortable(list(conn)).await,
            Err(e) => Err(e),
        };
        lease.settle(&result);
        result
    }

    pub async fn upload(&self, path: &Path, observer: &dyn ProgressObserver) -> Result<u64> {
        let mut lease = self.lease().await?;
        self.upload_leased(&mut lease, path, observer).await
    }

    /// Upload files one after another on this connection. A failed file does not
    /// stop the rest; once the connection is gone the remaining files fail fast.
    pub async fn upload_batch(
        &self,
        paths: &[PathBuf],
        observer: &dyn ProgressObserver,
    ) -> Vec<FileOutcome> {
        observer.on_event(TransferEvent::BatchStarted { count: paths.len() });

        let mut outcomes = Vec::with_capacity(paths.len());
        let mut lease = self.lease().await.ok();
        for path in paths {
            let result = match lease.as_mut() {
                Some(lease) if lease.is_usable() => {
                    self.upload_leased(lease, path, observer).await
                }
                _ => {
                    let err = closed_error();
                    observer.on_event(TransferEvent::Finished {
                        name: path.display().to_string(),
                        direction: Direction::Upload,
                        result: Err(err.to_string()),
                    });
                    Err(err)
                }
            };
            if let Err(e) = &result {
                warn!("Upload of {} failed: {}", path.display(), e);
            }
            outcomes.push(FileOutcome {
                path: path.clone(),
                result,
            });
        }
        drop(lease);

        observer.on_event(TransferEvent::BatchFinished {
            statuses: outcomes.iter().map(FileOutcome::status).collect(),
        });
        outcomes
    }

    pub async fn download(
        &self,
        name: &str,
        dest: &Path,
        observer: &dyn ProgressObserver,
    ) -> Result<u64> {
        let mut lease = self.lease().await?;
        let result = match lease.begin(ConnectionState::Transferring) {
            Ok(conn) => {
                self.abortable(transfer::download_file(conn, name, dest, observer))
                    .await
            }
            Err(e) => Err(e),
        };
        lease.settle(&result);
        result
    }

    /// Shut down our side and drop the connection. A request in flight is aborted
    /// and fails with a connection error; the peer sees the connection go away.
    pub async fn close(&self) {
        if self.is_open() {
            self.state.send_replace(ConnectionState::Closing);
        }
        self.closing.cancel();

        // Free at once if idle, or as soon as the aborted request lets go
        let mut slot = self.conn.lock().await;
        if let Some(mut conn) = slot.take() {
            if let Err(e) = conn.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.addr, e);
            }
            info!("Closed session with {}", self.addr);
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    async fn lease(&self) -> Result<Lease<'_>> {
        let mut slot = self.conn.lock().await;
        let conn = slot.take().ok_or_else(closed_error)?;
        Ok(Lease {
            session: self,
            slot,
            conn: Some(conn),
            in_flight: false,
        })
    }

    async fn upload_leased(
        &self,
        lease: &mut Lease<'_>,
        path: &Path,
        observer: &dyn ProgressObserver,
    ) -> Result<u64> {
        let result = match lease.begin(ConnectionState::Transferring) {
            Ok(conn) => {
                self.abortable(transfer::upload_file(conn, path, self.chunk_size, observer))
                    .await
            }
            Err(e) => Err(e),
        };
        lease.settle(&result);
        result
    }

    /// Run one exchange, giving up if the session is closed meanwhile
    async fn abortable<T>(&self, exchange: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => {
                Err(Error::ConnectionLost("session closed during request".to_string()))
            }
            result = exchange => result,
        }
    }
}

/// Exclusive use of the connection for the duration of one or more requests.
///
/// The connection is out of the shared slot while leased. If a request is dropped
/// before it settles, the stream may be mid-exchange, so the connection is
/// discarded instead of being returned.
struct Lease<'a> {
    session: &'a Session,
    slot: MutexGuard<'a, Option<Connection<TcpStream>>>,
    conn: Option<Connection<TcpStream>>,
    in_flight: bool,
}

impl Lease<'_> {
    fn is_usable(&self) -> bool {
        self.conn.is_some()
    }

    fn begin(&mut self, state: ConnectionState) -> Result<&mut Connection<TcpStream>> {
        self.in_flight = true;
        self.session.state.send_replace(state);
        self.conn.as_mut().ok_or_else(closed_error)
    }

    /// Back to Ready, or drop the connection if the error left it unusable
    fn settle<T>(&mut self, result: &Result<T>) {
        self.in_flight = false;
        match result {
            Err(e) if !e.keeps_session() => {
                if self.conn.take().is_some() {
                    warn!("Dropping session with {}: {}", self.session.addr, e);
                }
                self.session.state.send_replace(ConnectionState::Closed);
            }
            _ => {
                self.session.state.send_replace(ConnectionState::Ready);
            }
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        match self.conn.take() {
            Some(conn) if !self.in_flight => *self.slot = Some(conn),
            Some(_) => {
                warn!(
                    "Request to {} abandoned mid-exchange; dropping connection",
                    self.session.addr
                );
                self.session.state.send_replace(ConnectionState::Closed);
            }
            None => {}
        }
    }
}

async fn list(conn: &mut Connection<TcpStream>) -> Result<Vec<FileDescriptor>> {
    conn.send(&Message::ListRequest).await?;
    match conn.receive().await? {
        Message::ListResponse(files) => Ok(files),
        Message::Error { code, message } => Err(Error::Remote {
            name: String::new(),
            code,
            message,
        }),
        other => Err(ProtocolError::Unexpected {
            expected: "LIST_RESPONSE",
            got: other.kind(),
        }
        .into()),
    }
}

fn closed_error() -> Error {
    Error::ConnectionLost("session is closed".to_string())
}
