//! Server-side file registry.
//!
//! The index maps published names to sizes. Uploads stream into hidden temp files
//! and only enter the index when committed, so `list` and `retrieve` never see a
//! half-written file. The index lock is held for lookups, opens and the publishing
//! rename only; streaming happens outside it.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::{ErrorCode, FileDescriptor, MAX_CHUNK_SIZE};
use crate::transfer::FileWriter;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name {0:?}")]
    InvalidName(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("{name}: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { name: String, size: u64, limit: u64 },

    #[error("{name}: received {actual} of {expected} bytes")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("storage error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Code used when the failure is reported over the wire
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::InvalidName(_) => ErrorCode::InvalidName,
            StorageError::NotFound(_) => ErrorCode::NotFound,
            StorageError::TooLarge { .. } => ErrorCode::TooLarge,
            StorageError::SizeMismatch { .. } => ErrorCode::SizeMismatch,
            StorageError::Io { .. } => ErrorCode::Storage,
        }
    }

    fn io(name: &str, source: io::Error) -> Self {
        StorageError::Io {
            name: name.to_string(),
            source,
        }
    }
}

/// Names must be a single path component that cannot collide with temp files
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

/// A published file opened for reading. The handle pins the version that was
/// current at open time, so a later overwrite does not affect this reader.
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub file: File,
}

/// An upload being written; invisible until passed to [`Registry::commit`]
pub struct StagedUpload {
    name: String,
    expected: u64,
    writer: FileWriter,
}

impl StagedUpload {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.writer
            .write_chunk(data)
            .await
            .map_err(|e| StorageError::io(&self.name, e))
    }
}

pub struct Registry {
    root: PathBuf,
    max_file_size: Option<u64>,
    index: Mutex<BTreeMap<String, u64>>,
}

impl Registry {
    /// Open (creating if needed) the directory and index the files already in it.
    /// Leftover temp files from interrupted uploads are removed.
    pub async fn open(root: impl Into<PathBuf>, max_file_size: Option<u64>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut index = BTreeMap::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            if name.starts_with('.') && name.ends_with(".part") {
                debug!("Removing stale upload {}", name);
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!("Failed to remove stale upload {}: {}", name, e);
                }
                continue;
            }
            if validate_name(&name).is_ok() {
                index.insert(name, metadata.len());
            }
        }

        info!("Serving {} files from {}", index.len(), root.display());
        Ok(Self {
            root,
            max_file_size,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the published files, ordered by name
    pub async fn list(&self) -> Vec<FileDescriptor> {
        let index = self.index.lock().await;
        index
            .iter()
            .map(|(name, size)| FileDescriptor::new(name.clone(), *size))
            .collect()
    }

    /// Start receiving `name`, announced as `total_bytes` long
    pub async fn begin_store(
        &self,
        name: &str,
        total_bytes: u64,
    ) -> Result<StagedUpload, StorageError> {
        validate_name(name)?;
        if let Some(limit) = self.max_file_size {
            if total_bytes > limit {
                return Err(StorageError::TooLarge {
                    name: name.to_string(),
                    size: total_bytes,
                    limit,
                });
            }
        }
        let writer = FileWriter::create(&self.root.join(name))
            .await
            .map_err(|e| StorageError::io(name, e))?;
        Ok(StagedUpload {
            name: name.to_string(),
            expected: total_bytes,
            writer,
        })
    }

    /// Publish a completed upload, replacing any previous version.
    /// A byte count that differs from the announced size discards the upload.
    pub async fn commit(&self, staged: StagedUpload) -> Result<FileDescriptor, StorageError> {
        let StagedUpload {
            name,
            expected,
            mut writer,
        } = staged;
        let actual = writer.bytes_written();
        if actual != expected {
            return Err(StorageError::SizeMismatch {
                name,
                expected,
                actual,
            });
        }

        writer.sync().await.map_err(|e| StorageError::io(&name, e))?;

        // Only the rename and the index update run under the lock
        let mut index = self.index.lock().await;
        let size = writer.persist().await.map_err(|e| StorageError::io(&name, e))?;
        let replaced = index.insert(name.clone(), size).is_some();
        drop(index);

        if replaced {
            info!("Replaced {} ({} bytes)", name, size);
        } else {
            info!("Stored {} ({} bytes)", name, size);
        }
        Ok(FileDescriptor::new(name, size))
    }

    /// Store a whole byte stream under `name`
    pub async fn store<R>(&self, name: &str, mut reader: R) -> Result<FileDescriptor, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let limit = self.max_file_size.unwrap_or(u64::MAX);
        let mut staged = self.begin_store(name, 0).await?;
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StorageError::io(name, e))?;
            if n == 0 {
                break;
            }
            if staged.bytes_written() + n as u64 > limit {
                return Err(StorageError::TooLarge {
                    name: name.to_string(),
                    size: staged.bytes_written() + n as u64,
                    limit,
                });
            }
            staged.write(&buf[..n]).await?;
        }
        staged.expected = staged.bytes_written();
        self.commit(staged).await
    }

    /// Open a published file for streaming
    pub async fn retrieve(&self, name: &str) -> Result<StoredFile, StorageError> {
        let index = self.index.lock().await;
        if !index.contains_key(name) {
            return Err(StorageError::NotFound(name.to_string()));
        }
        let file = File::open(self.root.join(name))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StorageError::NotFound(name.to_string()),
                _ => StorageError::io(name, e),
            })?;
        drop(index);

        let size = file
            .metadata()
            .await
            .map_err(|e| StorageError::io(name, e))?
            .len();
        Ok(StoredFile {
            name: name.to_string(),
            size,
            file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn read_all(mut stored: StoredFile) -> Vec<u8> {
        let mut out = Vec::new();
        stored.file.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_staged_upload_invisible_until_commit() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path(), None).await.unwrap();

        let mut staged = registry.begin_store("a.txt", 5).await.unwrap();
        staged.write(b"hel").await.unwrap();
        assert!(registry.list().await.is_empty());
        assert!(matches!(
            registry.retrieve("a.txt").await,
            Err(StorageError::NotFound(_))
        ));

        staged.write(b"lo").await.unwrap();
        let published = registry.commit(staged).await.unwrap();
        assert_eq!(published, FileDescriptor::new("a.txt", 5));
        assert_eq!(registry.list().await, vec![FileDescriptor::new("a.txt", 5)]);
        assert_eq!(read_all(registry.retrieve("a.txt").await.unwrap()).await, b"hello");
    }

    #[tokio::test]
    async fn test_size_mismatch_discards_upload() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path(), None).await.unwrap();

        let mut staged = registry.begin_store("short.bin", 10).await.unwrap();
        staged.write(b"1234").await.unwrap();
        let err = registry.commit(staged).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::SizeMismatch {
                expected: 10,
                actual: 4,
                ..
            }
        ));
        assert_eq!(err.code(), ErrorCode::SizeMismatch);
        assert!(registry.list().await.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_names_and_large_files() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path(), Some(100)).await.unwrap();

        for name in ["", "../x", "a/b", ".hidden", "a\\b"] {
            let err = registry.begin_store(name, 1).await.err().unwrap();
            assert_eq!(err.code(), ErrorCode::InvalidName, "{name:?}");
        }
        let err = registry.begin_store("big.iso", 101).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::TooLarge);
    }

    #[tokio::test]
    async fn test_store_stream_and_list_order() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path(), None).await.unwrap();
        registry.store("b.txt", &b"bb"[..]).await.unwrap();
        registry.store("a.txt", &b"a"[..]).await.unwrap();
        registry.store("empty", &b""[..]).await.unwrap();

        assert_eq!(
            registry.list().await,
            vec![
                FileDescriptor::new("a.txt", 1),
                FileDescriptor::new("b.txt", 2),
                FileDescriptor::new("empty", 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_open_indexes_existing_and_drops_stale_temps() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kept.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join(".kept.txt.0000beef.part"), b"ab").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let registry = Registry::open(dir.path(), None).await.unwrap();
        assert_eq!(registry.list().await, vec![FileDescriptor::new("kept.txt", 3)]);
        assert!(!dir.path().join(".kept.txt.0000beef.part").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_overwrite_does_not_disturb_open_reader() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path(), None).await.unwrap();
        registry.store("doc.txt", &b"version one"[..]).await.unwrap();

        let reader = registry.retrieve("doc.txt").await.unwrap();
        registry.store("doc.txt", &b"v2"[..]).await.unwrap();

        assert_eq!(reader.size, 11);
        assert_eq!(read_all(reader).await, b"version one");
        assert_eq!(read_all(registry.retrieve("doc.txt").await.unwrap()).await, b"v2");
        assert_eq!(registry.list().await, vec![FileDescriptor::new("doc.txt", 2)]);
    }
}
