//! Data structures for mirroring operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// An object as reported by the remote store's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full key, including any prefix.
    pub key: String,
    /// Opaque change fingerprint with transport quoting removed.
    pub etag: String,
    /// Last modification time reported by the store.
    pub last_modified: DateTime<Utc>,
    /// Size in bytes, when known.
    pub size: Option<u64>,
}

/// Outcome of the most recent download attempt for one key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SyncRecord {
    /// ETag of the last successful download. Empty if none ever succeeded.
    pub etag: String,
    /// Last-modified time of the object version this record refers to.
    pub last_sync: Option<DateTime<Utc>>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl SyncRecord {
    /// Record a verified download of `object`.
    pub fn succeeded(object: &RemoteObject) -> Self {
        Self {
            etag: object.etag.clone(),
            last_sync: Some(object.last_modified),
            success: true,
            error_message: None,
        }
    }

    /// Record a final failure to download `object`, carrying over the etag
    /// of the previous success.
    ///
    /// Keeping the old etag (rather than the remote one) means a later run
    /// still sees a mismatch and retries the object.
    pub fn failed(object: &RemoteObject, previous: Option<&SyncRecord>, error: String) -> Self {
        let etag = previous.map(|r| r.etag.clone()).unwrap_or_default();
        Self {
            etag,
            last_sync: Some(object.last_modified),
            success: false,
            error_message: Some(error),
        }
    }
}

/// The persisted mirror state: one record per key ever attempted.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SyncState {
    /// Completion time of the last full pass.
    pub last_sync: Option<DateTime<Utc>>,
    pub records: HashMap<String, SyncRecord>,
}

impl SyncState {
    pub fn record(&self, key: &str) -> Option<&SyncRecord> {
        self.records.get(key)
    }
}

/// Whether the bucket-level modification time may short-circuit a run.
///
/// Many stores do not maintain a trustworthy bucket-level timestamp. When
/// the store reports none the check never fires; when it reports a stale one
/// an enabled check skips changes, so it can be turned off explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketCheck {
    /// Skip the run when `last_sync >= bucket_last_modified`.
    Enabled,
    /// Always list and diff.
    Disabled,
}

/// Configuration for mirroring a bucket.
///
/// # Example
///
/// ```
/// use bucketmirror::SyncConfig;
///
/// let config = SyncConfig {
///     local_dir: "./mirror".into(),
///     prefix: Some("photos/".to_string()),
///     workers: 16,
///     ..SyncConfig::default()
/// };
/// assert_eq!(config.retry_limit, 3);
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local destination directory.
    pub local_dir: PathBuf,
    /// State file path. Defaults to `<local_dir>/.bucketmirror-state.json`.
    pub state_file: Option<PathBuf>,
    /// Only mirror keys under this prefix.
    pub prefix: Option<String>,
    /// Number of concurrent downloads (default: 10). Must be at least 1.
    pub workers: usize,
    /// Attempts per object before it is recorded as failed (default: 3).
    /// Must be at least 1; [`Syncer::run`](crate::Syncer::run) rejects 0.
    pub retry_limit: u32,
    /// Backoff time unit: attempt `n` failing waits `2^n` units (default: 1s).
    pub backoff_unit: Duration,
    /// Per-attempt transfer timeout. A timeout counts as a failed attempt.
    pub transfer_timeout: Option<Duration>,
    /// Reuse a listing fetched within this window instead of listing again.
    pub listing_ttl: Option<Duration>,
    pub bucket_check: BucketCheck,
    /// Compare downloaded bytes against 32-hex ETags as content MD5s
    /// (default: false). Only enable for stores whose ETags are plain MD5s;
    /// S3 objects encrypted with SSE-KMS or SSE-C have hex ETags that are not.
    pub verify_md5: bool,
}

/// File name of the state file when none is configured.
pub const DEFAULT_STATE_FILE: &str = ".bucketmirror-state.json";

impl SyncConfig {
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.local_dir.join(DEFAULT_STATE_FILE))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("./mirror"),
            state_file: None,
            prefix: None,
            workers: 10,
            retry_limit: 3,
            backoff_unit: Duration::from_secs(1),
            transfer_timeout: None,
            listing_ttl: None,
            bucket_check: BucketCheck::Enabled,
            verify_md5: false,
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Bucket unchanged since the last pass; nothing was listed or fetched.
    Unchanged,
    /// The work list was processed. Some objects may have failed.
    Completed,
}

/// An object whose download failed after all retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedObject {
    pub key: String,
    pub error: String,
}

/// Summary of one invocation.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    /// Objects seen in the listing.
    pub listed: usize,
    /// Objects scheduled for download.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedObject>,
    /// State saves that failed. Downloads are kept, but may be repeated next run.
    pub save_errors: Vec<String>,
}

impl SyncReport {
    pub(crate) fn unchanged() -> Self {
        Self {
            outcome: SyncOutcome::Unchanged,
            listed: 0,
            attempted: 0,
            succeeded: 0,
            failed: Vec::new(),
            save_errors: Vec::new(),
        }
    }

    /// True when every scheduled object was downloaded and every save landed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.save_errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(etag: &str) -> RemoteObject {
        RemoteObject {
            key: "a".to_string(),
            etag: etag.to_string(),
            last_modified: Utc::now(),
            size: None,
        }
    }

    #[test]
    fn test_failed_record_keeps_previous_success_etag() {
        let ok = SyncRecord::succeeded(&object("e1"));
        let remote = object("e2");
        let failed = SyncRecord::failed(&remote, Some(&ok), "boom".to_string());
        assert_eq!(failed.etag, "e1");
        assert_eq!(failed.last_sync, Some(remote.last_modified));
        assert!(!failed.success);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        // A second failure still carries the last good etag.
        let failed_again = SyncRecord::failed(&remote, Some(&failed), "boom".to_string());
        assert_eq!(failed_again.etag, "e1");
    }

    #[test]
    fn test_failed_record_without_history_has_empty_etag() {
        let failed = SyncRecord::failed(&object("e1"), None, "boom".to_string());
        assert!(failed.etag.is_empty());
    }

    #[test]
    fn test_state_loads_with_missing_fields() {
        let state: SyncState =
            serde_json::from_str(r#"{"records": {"a": {"etag": "e1"}}}"#).unwrap();
        assert!(state.last_sync.is_none());
        let record = state.record("a").unwrap();
        assert_eq!(record.etag, "e1");
        assert!(!record.success);
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_default_state_path() {
        let config = SyncConfig {
            local_dir: PathBuf::from("/tmp/m"),
            ..SyncConfig::default()
        };
        assert_eq!(
            config.state_path(),
            PathBuf::from("/tmp/m/.bucketmirror-state.json")
        );
    }
}
