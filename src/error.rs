//! Error types for mirroring operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while mirroring a bucket.
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error during local file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// Error reported by the remote object store (transport, auth, not found).
    #[error("Object store error: {0}")]
    StoreError(String),

    /// The persisted state file exists but cannot be parsed.
    #[error("Corrupt state file {path:?}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    /// The state file could not be written.
    #[error("Failed to persist state to {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another invocation holds the lock on this state file.
    #[error("State file {0:?} is locked by another process")]
    StateLocked(PathBuf),

    /// The object key cannot be mapped to a path under the local directory.
    #[error("Invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Downloaded bytes do not hash to the object's ETag.
    #[error("MD5 mismatch for {key}: expected {expected}, got {actual}")]
    Md5Mismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// A single transfer attempt exceeded the configured timeout.
    #[error("Transfer of {0} timed out")]
    Timeout(String),

    /// The configuration cannot be run (zero workers or zero attempts).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// General download failure.
    #[error("Download failed: {0}")]
    DownloadFailed(String),
}

impl From<opendal::Error> for SyncError {
    fn from(e: opendal::Error) -> Self {
        SyncError::StoreError(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
