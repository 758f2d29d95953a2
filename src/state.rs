//! Persistent mirror state.
//!
//! The state lives in a single JSON file next to an advisory lock file:
//!
//! ```text
//! <state>           # serialized SyncState
//! <state>.tmp       # written then renamed over <state> on every save
//! <state>.lock      # held exclusively for the duration of one invocation
//! ```

use crate::error::{Result, SyncError};
use crate::types::SyncState;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Loads and saves [`SyncState`] to a file on disk.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    _lock_file: Option<File>,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl StateStore {
    /// Creates a store for `path` without taking the lock.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _lock_file: None,
        }
    }

    /// Creates a store and takes an exclusive lock on `<path>.lock`.
    ///
    /// # Errors
    ///
    /// Returns `StateLocked` if another process already holds the lock.
    pub fn open_locked(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let lock_path = with_suffix(&path, ".lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::StateLocked(path));
        }

        Ok(Self {
            path,
            _lock_file: Some(lock_file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted state.
    ///
    /// A missing file yields an empty state. A file that exists but does not
    /// parse yields `CorruptState`.
    pub fn load(&self) -> Result<SyncState> {
        let content = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SyncState::default()),
            Err(e) => return Err(SyncError::IoError(e)),
        };

        serde_json::from_slice(&content).map_err(|e| SyncError::CorruptState {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Replaces the persisted state with `state`.
    ///
    /// Writes to `<path>.tmp`, syncs it, then renames it over the state file,
    /// so a crash mid-save leaves either the old or the new state.
    pub async fn save(&self, state: &SyncState) -> Result<()> {
        let persistence = |source: io::Error| SyncError::Persistence {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| persistence(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let tmp_path = with_suffix(&self.path, ".tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(persistence)?;
        file.write_all(&json).await.map_err(persistence)?;
        file.sync_all().await.map_err(persistence)?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(persistence)?;

        debug!(
            "Saved state with {} records to {:?}",
            state.records.len(),
            self.path
        );
        Ok(())
    }
}
