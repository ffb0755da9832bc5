use std::io;
use thiserror::Error;

use crate::network::FrameError;
use crate::protocol::{ErrorCode, ProtocolError};

/// Why a single transfer did not complete
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{name}: expected {expected} bytes, transferred {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("{name}: connection lost after {transferred} of {total} bytes")]
    Interrupted {
        name: String,
        transferred: u64,
        total: u64,
    },
}

/// Errors surfaced to callers of the client API
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("file not found on server: {0}")]
    NotFound(String),

    /// Storage or validation failure reported by the server
    #[error("server rejected {name}: {code}: {message}")]
    Remote {
        name: String,
        code: ErrorCode,
        message: String,
    },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("local file error on {path}: {source}")]
    Local {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// The session behind this error can no longer carry requests
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::ConnectionLost(_)
                | Error::Transfer(TransferError::Interrupted { .. })
        )
    }

    /// The byte stream is still aligned on frame boundaries after this error
    pub fn keeps_session(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::Remote { .. }
                | Error::Transfer(TransferError::SizeMismatch { .. })
                | Error::Local { .. }
        )
    }

    pub(crate) fn local(path: impl AsRef<std::path::Path>, source: io::Error) -> Self {
        Error::Local {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Protocol(e) => Error::Protocol(e),
            other => Error::ConnectionLost(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_errors_map_to_connection_loss() {
        let err: Error = FrameError::Closed.into();
        assert!(err.is_connection_lost());
        assert!(!err.keeps_session());

        let err: Error = FrameError::Protocol(ProtocolError::UnknownKind(42)).into();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!err.is_connection_lost());
    }

    #[test]
    fn test_cancelled_is_not_a_connection_error() {
        assert!(!Error::Cancelled.is_connection_lost());
    }
}
