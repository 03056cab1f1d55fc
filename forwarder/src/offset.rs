//! Durable resume position
//!
//! The offset is the first sequence id not yet confirmed delivered. It is
//! stored as a decimal string in a single file.
//!
//! By default the file is overwritten in place, so a crash in the middle of a
//! write can leave it truncated. The next load then reports it as corrupt
//! instead of silently restarting from zero. `FileOffsetStore::atomic` writes a
//! sibling temp file and renames it over the target instead; this is opt-in.

use crate::error::StorageError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persistence for `next_sequence_id`
///
/// Only one forwarder owns a store at a time, so implementations need no
/// internal locking against concurrent writers.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Read the persisted offset; `None` when no previous run stored one
    async fn load(&self) -> Result<Option<u64>, StorageError>;

    /// Persist a new offset
    async fn save(&self, next_sequence_id: u64) -> Result<(), StorageError>;
}

/// Offset stored in a plain text file
#[derive(Debug, Clone)]
pub struct FileOffsetStore {
    path: PathBuf,
    atomic: bool,
}

impl FileOffsetStore {
    /// Store that overwrites the file directly
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            atomic: false,
        }
    }

    /// Store that writes a temp file and renames it into place
    pub fn atomic(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            atomic: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self) -> Result<Option<u64>, StorageError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No offset file, starting from the beginning");
                return Ok(None);
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let value = contents.trim();
        value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| StorageError::Corrupt {
                path: self.path.clone(),
                value: value.to_string(),
            })
    }

    async fn save(&self, next_sequence_id: u64) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let contents = next_sequence_id.to_string();
        if self.atomic {
            let temp = self.temp_path();
            tokio::fs::write(&temp, &contents)
                .await
                .map_err(|e| self.io_error(e))?;
            tokio::fs::rename(&temp, &self.path)
                .await
                .map_err(|e| self.io_error(e))?;
        } else {
            tokio::fs::write(&self.path, &contents)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        debug!(path = %self.path.display(), offset = next_sequence_id, "Offset saved");
        Ok(())
    }
}
