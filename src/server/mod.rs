use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::network::{self, Connection, FrameError};
use crate::protocol::{ErrorCode, Message, ProtocolError};
use crate::registry::{Registry, StagedUpload, StorageError};
use crate::transfer::{FileChunker, TransferSession, TransferState};

/// Bound server, ready to accept sessions
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    chunk_size: usize,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Registry::open(&config.root, config.max_file_size)
            .await
            .with_context(|| format!("Failed to open storage directory {}", config.root.display()))?;
        let listener = network::listen(config.listen)
            .await
            .with_context(|| format!("Failed to bind {}", config.listen))?;
        Ok(Self {
            listener,
            registry: Arc::new(registry),
            chunk_size: config.chunk_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Accept sessions until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let conn = match Connection::from_tcp(stream) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("[{}] Failed to configure socket: {}", addr, e);
                    continue;
                }
            };
            let registry = self.registry.clone();
            let chunk_size = self.chunk_size;
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                info!("[{}] New connection", addr);
                tokio::select! {
                    _ = shutdown.cancelled() => debug!("[{}] Dropped on shutdown", addr),
                    result = handle_connection(conn, &registry, chunk_size) => match result {
                        Ok(()) => info!("[{}] Disconnected", addr),
                        Err(e) => error!("[{}] Connection error: {}", addr, e),
                    },
                }
            });
        }

        info!("Server stopped accepting connections");
        Ok(())
    }
}

/// Serve requests on one connection until the client disconnects.
///
/// Storage and lookup failures are answered with ERROR and the session continues;
/// broken streams and protocol violations end it.
pub async fn handle_connection<S>(
    mut conn: Connection<S>,
    registry: &Registry,
    chunk_size: usize,
) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = match conn.receive().await {
            Ok(m) => m,
            Err(FrameError::Closed) => return Ok(()),
            Err(FrameError::Protocol(e)) => return reject(&mut conn, e).await,
            Err(e) => return Err(e),
        };

        match message {
            Message::ListRequest => {
                let files = registry.list().await;
                debug!("LIST -> {} files", files.len());
                conn.send(&Message::ListResponse(files)).await?;
            }
            Message::UploadBegin { name, total_bytes } => {
                receive_upload(&mut conn, registry, name, total_bytes).await?;
            }
            Message::DownloadRequest { name } => {
                serve_download(&mut conn, registry, &name, chunk_size).await?;
            }
            other => {
                let e = ProtocolError::Unexpected {
                    expected: "LIST_REQUEST, UPLOAD_BEGIN or DOWNLOAD_REQUEST",
                    got: other.kind(),
                };
                return reject(&mut conn, e).await;
            }
        }
    }
}

/// Tell the client why the session is being dropped
async fn reject<S>(conn: &mut Connection<S>, e: ProtocolError) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("Protocol violation: {}", e);
    let _ = conn
        .send(&Message::error(ErrorCode::ProtocolViolation, e.to_string()))
        .await;
    Err(e.into())
}

/// Consume chunks through UPLOAD_END, then acknowledge or report the failure.
///
/// A rejected upload is still drained to its END so the stream stays aligned.
async fn receive_upload<S>(
    conn: &mut Connection<S>,
    registry: &Registry,
    name: String,
    total_bytes: u64,
) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = TransferSession::upload(name.as_str(), total_bytes);
    session.advance(TransferState::BeginSent);

    // Err once the upload is refused; the remaining chunks are then only counted
    let mut stage: Result<StagedUpload, StorageError> =
        registry.begin_store(&name, total_bytes).await;
    debug!("UPLOAD_BEGIN {} ({} bytes)", name, total_bytes);

    loop {
        let message = match conn.receive().await {
            Ok(m) => m,
            Err(FrameError::Protocol(e)) => return reject(conn, e).await,
            Err(e) => return Err(e),
        };
        match message {
            Message::UploadChunk(data) => {
                if let Err(e) = session.record(data.len()) {
                    // Dropping the staged upload discards it
                    return reject(conn, e).await;
                }
                let write_err = match stage.as_mut() {
                    Ok(s) => s.write(&data).await.err(),
                    Err(_) => None,
                };
                if let Some(e) = write_err {
                    warn!("Upload of {} failed: {}", name, e);
                    stage = Err(e);
                }
            }
            Message::UploadEnd => {
                session.advance(TransferState::EndSent);
                break;
            }
            other => {
                let e = ProtocolError::Unexpected {
                    expected: "UPLOAD_CHUNK or UPLOAD_END",
                    got: other.kind(),
                };
                return reject(conn, e).await;
            }
        }
    }

    let outcome = match stage {
        Ok(s) => registry.commit(s).await.map(|_| ()),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            session.advance(TransferState::Acked);
            conn.send(&Message::UploadEnd).await
        }
        Err(e) => {
            session.fail();
            warn!("Rejected upload {}: {}", name, e);
            conn.send(&Message::error(e.code(), e.to_string())).await
        }
    }
}

/// DOWNLOAD_BEGIN, the file's chunks, then DOWNLOAD_END; or ERROR(NOT_FOUND)
async fn serve_download<S>(
    conn: &mut Connection<S>,
    registry: &Registry,
    name: &str,
    chunk_size: usize,
) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stored = match registry.retrieve(name).await {
        Ok(stored) => stored,
        Err(e) => {
            debug!("DOWNLOAD {} refused: {}", name, e);
            return conn.send(&Message::error(e.code(), e.to_string())).await;
        }
    };

    let mut session = TransferSession::download(name);
    session.begin(stored.size);
    conn.send(&Message::DownloadBegin {
        name: name.to_string(),
        total_bytes: stored.size,
    })
    .await?;

    let mut chunker = FileChunker::new(stored.file, stored.size, chunk_size);
    while let Some(chunk) = chunker.next_chunk().await? {
        let len = chunk.len();
        conn.send(&Message::DownloadChunk(chunk)).await?;
        session.record(len)?;
    }

    if !session.is_complete() {
        // The file shrank under us; closing makes the client see a truncated transfer
        error!(
            "{} ended after {} of {} bytes",
            name,
            session.bytes_transferred(),
            session.total_bytes()
        );
        return Err(FrameError::Truncated {
            received: session.bytes_transferred() as usize,
            expected: session.total_bytes() as usize,
        });
    }

    conn.send(&Message::DownloadEnd).await?;
    session.advance(TransferState::EndReceived);
    debug!("Sent {} ({} bytes)", name, session.total_bytes());
    Ok(())
}
