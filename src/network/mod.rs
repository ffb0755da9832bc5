use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::protocol::{Message, MessageKind, ProtocolError, HEADER_LEN};

/// Failure to move a frame across the connection
#[derive(Debug, Error)]
pub enum FrameError {
    /// Peer closed the stream cleanly between two frames
    #[error("connection closed by peer")]
    Closed,

    /// Peer closed the stream in the middle of a frame
    #[error("connection closed mid-frame ({received} of {expected} bytes)")]
    Truncated { received: usize, expected: usize },

    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl FrameError {
    /// True when the byte stream itself is gone, as opposed to a bad frame
    pub fn is_disconnect(&self) -> bool {
        !matches!(self, FrameError::Protocol(_))
    }
}

/// Write one complete frame and flush it
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = message.encode_payload()?;
    let mut header = [0u8; HEADER_LEN];
    header[0] = message.kind().tag();
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame.
///
/// A zero-length read before the first header byte is a clean close; one anywhere
/// later means the peer went away mid-frame.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let filled = fill(reader, &mut header).await?;
    if filled == 0 {
        return Err(FrameError::Closed);
    }
    if filled < HEADER_LEN {
        return Err(FrameError::Truncated {
            received: filled,
            expected: HEADER_LEN,
        });
    }

    let kind = MessageKind::from_tag(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    // Chunks are capped far below other payloads; refuse before allocating
    let max = kind.max_payload_len();
    if len > max {
        return Err(ProtocolError::PayloadTooLarge {
            len: len as u64,
            max: max as u64,
        }
        .into());
    }

    let mut payload = vec![0u8; len as usize];
    let filled = fill(reader, &mut payload).await?;
    if filled < payload.len() {
        return Err(FrameError::Truncated {
            received: HEADER_LEN + filled,
            expected: HEADER_LEN + payload.len(),
        });
    }

    Ok(Message::decode(kind, payload)?)
}

/// Read until `buf` is full or the stream ends; returns the number of bytes read
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Framed connection wrapper
pub struct Connection<S = TcpStream> {
    stream: S,
    peer_addr: Option<SocketAddr>,
}

impl Connection<TcpStream> {
    /// Wrap an established TCP stream
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        Ok(Self { stream, peer_addr })
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap any byte stream (in-memory pipes in tests)
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            peer_addr: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), FrameError> {
        write_message(&mut self.stream, message).await
    }

    pub async fn receive(&mut self) -> Result<Message, FrameError> {
        read_message(&mut self.stream).await
    }

    /// Close our write half so the peer reads a clean end of stream
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Bind a listener for incoming sessions
pub async fn listen<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a server
pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Connection> {
    let stream = TcpStream::connect(addr).await?;
    Connection::from_tcp(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, FileDescriptor, MAX_CHUNK_SIZE, MAX_PAYLOAD_LEN};

    #[tokio::test]
    async fn test_connection() {
        let listener = listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::from_tcp(stream).unwrap();
            let msg = conn.receive().await.unwrap();
            assert_eq!(msg, Message::ListRequest);
            conn.send(&Message::ListResponse(vec![FileDescriptor::new("a", 1)]))
                .await
                .unwrap();
        });

        let mut conn = connect(addr).await.unwrap();
        conn.send(&Message::ListRequest).await.unwrap();
        let response = conn.receive().await.unwrap();
        assert_eq!(
            response,
            Message::ListResponse(vec![FileDescriptor::new("a", 1)])
        );

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reassembles_split_frames() {
        // Tiny duplex buffer forces every frame through many partial reads and writes
        let (a, b) = tokio::io::duplex(3);
        let mut tx = Connection::new(a);
        let mut rx = Connection::new(b);

        let chunk = (0..1000u32).map(|i| i as u8).collect::<Vec<_>>();
        let writer = tokio::spawn(async move {
            tx.send(&Message::DownloadChunk(chunk.clone())).await.unwrap();
            tx.send(&Message::DownloadEnd).await.unwrap();
            chunk
        });

        let first = rx.receive().await.unwrap();
        let second = rx.receive().await.unwrap();
        let chunk = writer.await.unwrap();
        assert_eq!(first, Message::DownloadChunk(chunk));
        assert_eq!(second, Message::DownloadEnd);
    }

    #[tokio::test]
    async fn test_clean_close_between_frames() {
        let (a, b) = tokio::io::duplex(64);
        let mut tx = Connection::new(a);
        let mut rx = Connection::new(b);
        tx.send(&Message::error(ErrorCode::NotFound, "x")).await.unwrap();
        drop(tx);

        assert!(matches!(rx.receive().await.unwrap(), Message::Error { .. }));
        assert!(matches!(rx.receive().await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn test_close_mid_payload_is_truncation() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut rx = Connection::new(b);
        // Header announces 10 payload bytes, only 4 arrive
        a.write_all(&[MessageKind::UploadChunk.tag(), 0, 0, 0, 10, 1, 2, 3, 4])
            .await
            .unwrap();
        drop(a);

        let err = rx.receive().await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Truncated {
                received: 9,
                expected: 15
            }
        ));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut rx = Connection::new(b);
        let len = (MAX_PAYLOAD_LEN + 1).to_be_bytes();
        a.write_all(&[MessageKind::ListResponse.tag(), len[0], len[1], len[2], len[3]])
            .await
            .unwrap();

        let err = rx.receive().await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Protocol(ProtocolError::PayloadTooLarge { .. })
        ));
        assert!(!err.is_disconnect());
    }

    #[tokio::test]
    async fn test_chunk_over_limit_rejected_before_payload() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut rx = Connection::new(b);
        let len = (MAX_CHUNK_SIZE as u32 + 1).to_be_bytes();
        // Header only: the payload is never read
        a.write_all(&[MessageKind::UploadChunk.tag(), len[0], len[1], len[2], len[3]])
            .await
            .unwrap();

        let err = rx.receive().await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Protocol(ProtocolError::PayloadTooLarge { max, .. })
                if max == MAX_CHUNK_SIZE as u64
        ));
    }
}
