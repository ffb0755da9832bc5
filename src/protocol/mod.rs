use std::fmt;
use thiserror::Error;

/// Fixed frame header: kind tag (1 byte) + payload length (4 bytes, big-endian)
pub const HEADER_LEN: usize = 5;

/// Largest chunk of file data carried by a single *_CHUNK message
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on any payload, checked before the payload buffer is allocated.
/// Listings are the only payloads that can legitimately exceed a chunk.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Frame kind tags as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ListRequest = 1,
    ListResponse = 2,
    UploadBegin = 3,
    UploadChunk = 4,
    UploadEnd = 5,
    DownloadRequest = 6,
    DownloadBegin = 7,
    DownloadChunk = 8,
    DownloadEnd = 9,
    Error = 10,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        Ok(match tag {
            1 => MessageKind::ListRequest,
            2 => MessageKind::ListResponse,
            3 => MessageKind::UploadBegin,
            4 => MessageKind::UploadChunk,
            5 => MessageKind::UploadEnd,
            6 => MessageKind::DownloadRequest,
            7 => MessageKind::DownloadBegin,
            8 => MessageKind::DownloadChunk,
            9 => MessageKind::DownloadEnd,
            10 => MessageKind::Error,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Largest payload a frame of this kind may declare
    pub fn max_payload_len(self) -> u32 {
        match self {
            MessageKind::UploadChunk | MessageKind::DownloadChunk => MAX_CHUNK_SIZE as u32,
            _ => MAX_PAYLOAD_LEN,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::ListRequest => "LIST_REQUEST",
            MessageKind::ListResponse => "LIST_RESPONSE",
            MessageKind::UploadBegin => "UPLOAD_BEGIN",
            MessageKind::UploadChunk => "UPLOAD_CHUNK",
            MessageKind::UploadEnd => "UPLOAD_END",
            MessageKind::DownloadRequest => "DOWNLOAD_REQUEST",
            MessageKind::DownloadBegin => "DOWNLOAD_BEGIN",
            MessageKind::DownloadChunk => "DOWNLOAD_CHUNK",
            MessageKind::DownloadEnd => "DOWNLOAD_END",
            MessageKind::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Error codes carried by ERROR messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    NotFound = 1,
    Storage = 2,
    InvalidName = 3,
    ProtocolViolation = 4,
    SizeMismatch = 5,
    TooLarge = 6,
}

impl ErrorCode {
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        Ok(match tag {
            1 => ErrorCode::NotFound,
            2 => ErrorCode::Storage,
            3 => ErrorCode::InvalidName,
            4 => ErrorCode::ProtocolViolation,
            5 => ErrorCode::SizeMismatch,
            6 => ErrorCode::TooLarge,
            other => return Err(ProtocolError::UnknownErrorCode(other)),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Storage => "STORAGE",
            ErrorCode::InvalidName => "INVALID_NAME",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::SizeMismatch => "SIZE_MISMATCH",
            ErrorCode::TooLarge => "TOO_LARGE",
        };
        f.write_str(name)
    }
}

/// Violations of the frame format or of the message sequence
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("unknown error code {0}")]
    UnknownErrorCode(u8),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: u64, max: u64 },

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: MessageKind, reason: &'static str },

    #[error("expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: MessageKind },

    #[error("{name}: received more than the announced {total} bytes")]
    Overrun { name: String, total: u64 },
}

/// Hint for the presentation layer, derived from a file's extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Document,
    Text,
    Code,
    Image,
    Video,
    Audio,
    Archive,
    Spreadsheet,
    Other,
}

impl FileKind {
    pub fn from_name(name: &str) -> Self {
        let ext = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
            _ => return FileKind::Other,
        };
        match ext.as_str() {
            "pdf" | "doc" | "docx" | "odt" => FileKind::Document,
            "txt" | "md" | "log" => FileKind::Text,
            "py" | "c" | "cpp" | "h" | "rs" | "js" | "ts" | "go" => FileKind::Code,
            "jpg" | "jpeg" | "png" | "gif" | "webp" => FileKind::Image,
            "mp4" | "mkv" | "mov" | "avi" => FileKind::Video,
            "mp3" | "wav" | "flac" | "ogg" => FileKind::Audio,
            "zip" | "rar" | "7z" | "tar" | "gz" => FileKind::Archive,
            "xls" | "xlsx" | "csv" | "ods" => FileKind::Spreadsheet,
            _ => FileKind::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FileKind::Document => "doc",
            FileKind::Text => "text",
            FileKind::Code => "code",
            FileKind::Image => "image",
            FileKind::Video => "video",
            FileKind::Audio => "audio",
            FileKind::Archive => "archive",
            FileKind::Spreadsheet => "sheet",
            FileKind::Other => "file",
        }
    }
}

/// One entry of a LIST_RESPONSE
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_name(&self.name)
    }
}

/// Messages exchanged over a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ListRequest,
    ListResponse(Vec<FileDescriptor>),

    UploadBegin { name: String, total_bytes: u64 },
    UploadChunk(Vec<u8>),
    /// Sent by the client after the last chunk; echoed by the server as the acknowledgment
    UploadEnd,

    DownloadRequest { name: String },
    DownloadBegin { name: String, total_bytes: u64 },
    DownloadChunk(Vec<u8>),
    DownloadEnd,

    Error { code: ErrorCode, message: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ListRequest => MessageKind::ListRequest,
            Message::ListResponse(_) => MessageKind::ListResponse,
            Message::UploadBegin { .. } => MessageKind::UploadBegin,
            Message::UploadChunk(_) => MessageKind::UploadChunk,
            Message::UploadEnd => MessageKind::UploadEnd,
            Message::DownloadRequest { .. } => MessageKind::DownloadRequest,
            Message::DownloadBegin { .. } => MessageKind::DownloadBegin,
            Message::DownloadChunk(_) => MessageKind::DownloadChunk,
            Message::DownloadEnd => MessageKind::DownloadEnd,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize the payload (everything after the frame header)
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let kind = self.kind();
        let mut out = Vec::new();
        match self {
            Message::ListRequest | Message::UploadEnd | Message::DownloadEnd => {}
            Message::ListResponse(files) => {
                for file in files {
                    put_name(&mut out, kind, &file.name)?;
                    out.extend_from_slice(&file.size.to_be_bytes());
                }
            }
            Message::UploadBegin { name, total_bytes }
            | Message::DownloadBegin { name, total_bytes } => {
                put_name(&mut out, kind, name)?;
                out.extend_from_slice(&total_bytes.to_be_bytes());
            }
            Message::DownloadRequest { name } => put_name(&mut out, kind, name)?,
            Message::UploadChunk(data) | Message::DownloadChunk(data) => {
                if data.len() > MAX_CHUNK_SIZE {
                    return Err(ProtocolError::PayloadTooLarge {
                        len: data.len() as u64,
                        max: MAX_CHUNK_SIZE as u64,
                    });
                }
                out.extend_from_slice(data);
            }
            Message::Error { code, message } => {
                out.push(*code as u8);
                // Error text is informational; clip it rather than fail the reply
                let mut end = message.len().min(u16::MAX as usize);
                while !message.is_char_boundary(end) {
                    end -= 1;
                }
                put_str(&mut out, &message[..end]);
            }
        }
        if out.len() as u64 > MAX_PAYLOAD_LEN as u64 {
            return Err(ProtocolError::PayloadTooLarge {
                len: out.len() as u64,
                max: MAX_PAYLOAD_LEN as u64,
            });
        }
        Ok(out)
    }

    /// Deserialize a payload whose kind tag has already been read
    pub fn decode(kind: MessageKind, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if payload.len() as u64 > kind.max_payload_len() as u64 {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len() as u64,
                max: kind.max_payload_len() as u64,
            });
        }
        let message = match kind {
            MessageKind::UploadChunk => return Ok(Message::UploadChunk(payload)),
            MessageKind::DownloadChunk => return Ok(Message::DownloadChunk(payload)),
            _ => {
                let mut r = PayloadReader::new(kind, &payload);
                let message = match kind {
                    MessageKind::ListRequest => Message::ListRequest,
                    MessageKind::UploadEnd => Message::UploadEnd,
                    MessageKind::DownloadEnd => Message::DownloadEnd,
                    MessageKind::ListResponse => {
                        let mut files = Vec::new();
                        while !r.is_empty() {
                            let name = r.name()?;
                            let size = r.u64()?;
                            files.push(FileDescriptor { name, size });
                        }
                        Message::ListResponse(files)
                    }
                    MessageKind::UploadBegin => Message::UploadBegin {
                        name: r.name()?,
                        total_bytes: r.u64()?,
                    },
                    MessageKind::DownloadBegin => Message::DownloadBegin {
                        name: r.name()?,
                        total_bytes: r.u64()?,
                    },
                    MessageKind::DownloadRequest => Message::DownloadRequest { name: r.name()? },
                    MessageKind::Error => {
                        let code = ErrorCode::from_tag(r.u8()?)?;
                        let message = r.string()?;
                        Message::Error { code, message }
                    }
                    MessageKind::UploadChunk | MessageKind::DownloadChunk => unreachable!(),
                };
                r.finish()?;
                message
            }
        };
        Ok(message)
    }
}

fn put_name(out: &mut Vec<u8>, kind: MessageKind, name: &str) -> Result<(), ProtocolError> {
    if name.len() > u16::MAX as usize {
        return Err(ProtocolError::Malformed {
            kind,
            reason: "name longer than 65535 bytes",
        });
    }
    put_str(out, name);
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Cursor over a payload that reports truncation as a malformed payload
struct PayloadReader<'a> {
    kind: MessageKind,
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(kind: MessageKind, buf: &'a [u8]) -> Self {
        Self { kind, buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(self.malformed("payload truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len_bytes = self.take(2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.malformed("string is not UTF-8"))
    }

    fn name(&mut self) -> Result<String, ProtocolError> {
        let name = self.string()?;
        if name.is_empty() {
            return Err(self.malformed("empty file name"));
        }
        Ok(name)
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(self.malformed("trailing bytes after payload"))
        }
    }

    fn malformed(&self, reason: &'static str) -> ProtocolError {
        ProtocolError::Malformed {
            kind: self.kind,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_response_layout() {
        let msg = Message::ListResponse(vec![FileDescriptor::new("a.txt", 3)]);
        let payload = msg.encode_payload().unwrap();
        assert_eq!(
            payload,
            vec![0, 5, b'a', b'.', b't', b'x', b't', 0, 0, 0, 0, 0, 0, 0, 3]
        );
        assert_eq!(
            Message::decode(MessageKind::ListResponse, payload).unwrap(),
            msg
        );
    }

    #[test]
    fn test_empty_listing_is_empty_payload() {
        let payload = Message::ListResponse(vec![]).encode_payload().unwrap();
        assert!(payload.is_empty());
        assert_eq!(
            Message::decode(MessageKind::ListResponse, payload).unwrap(),
            Message::ListResponse(vec![])
        );
    }

    #[test]
    fn test_error_payload_layout() {
        let payload = Message::error(ErrorCode::NotFound, "no")
            .encode_payload()
            .unwrap();
        assert_eq!(payload, vec![1, 0, 2, b'n', b'o']);
    }

    #[test]
    fn test_truncated_begin_is_malformed() {
        let mut payload = Message::UploadBegin {
            name: "x.bin".into(),
            total_bytes: 10,
        }
        .encode_payload()
        .unwrap();
        payload.pop();
        let err = Message::decode(MessageKind::UploadBegin, payload).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let err = Message::decode(MessageKind::UploadEnd, vec![0]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Malformed {
                kind: MessageKind::UploadEnd,
                ..
            }
        ));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let err = Message::UploadChunk(vec![0; MAX_CHUNK_SIZE + 1])
            .encode_payload()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_oversized_chunk_payload_refused_on_decode() {
        let err = Message::decode(MessageKind::DownloadChunk, vec![0; MAX_CHUNK_SIZE + 1])
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PayloadTooLarge { len, max }
                if len == MAX_CHUNK_SIZE as u64 + 1 && max == MAX_CHUNK_SIZE as u64
        ));
        assert!(Message::decode(MessageKind::DownloadChunk, vec![0; MAX_CHUNK_SIZE]).is_ok());
    }

    #[test]
    fn test_unknown_tags() {
        assert!(matches!(
            MessageKind::from_tag(0),
            Err(ProtocolError::UnknownKind(0))
        ));
        assert!(matches!(
            Message::decode(MessageKind::Error, vec![99, 0, 0]),
            Err(ProtocolError::UnknownErrorCode(99))
        ));
    }

    #[test]
    fn test_file_kind_hint() {
        assert_eq!(FileKind::from_name("report.PDF"), FileKind::Document);
        assert_eq!(FileKind::from_name("main.rs"), FileKind::Code);
        assert_eq!(FileKind::from_name("README"), FileKind::Other);
        assert_eq!(FileKind::from_name(".bashrc"), FileKind::Other);
    }
}
