//! Object download with retry and exponential backoff.

use crate::error::{Result, SyncError};
use crate::events::{EventSink, SyncEvent};
use crate::store::ObjectStore;
use crate::types::RemoteObject;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use md5::{Digest, Md5};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_retry2::strategy::ExponentialBackoff;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

/// Canonical form of a listing prefix: no leading `/`, and a trailing `/`
/// unless empty.
///
/// `"photos"`, `"/photos"` and `"photos/"` all become `"photos/"`, so the
/// prefix only ever matches whole path segments.
pub fn normalize_prefix(prefix: Option<&str>) -> String {
    let trimmed = prefix.unwrap_or_default().trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}

/// Maps an object key to its path under `local_dir`.
///
/// The prefix is normalized with [`normalize_prefix`] and stripped; a key
/// outside it is rejected. The remainder must be a plain relative path: no
/// `..`, no root, and not a directory marker.
pub fn local_path(local_dir: &Path, key: &str, prefix: &str) -> Result<PathBuf> {
    let invalid = |reason: &str| SyncError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let prefix = normalize_prefix(Some(prefix));
    let relative = key
        .trim_start_matches('/')
        .strip_prefix(prefix.as_str())
        .ok_or_else(|| invalid("outside the mirrored prefix"))?
        .trim_start_matches('/');
    if relative.is_empty() {
        return Err(invalid("empty path below prefix"));
    }
    if relative.ends_with('/') {
        return Err(invalid("directory marker"));
    }

    let mut path = local_dir.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            _ => return Err(invalid("path escapes the local directory")),
        }
    }
    Ok(path)
}

/// True for ETags that are the hex MD5 of the content (single-part uploads).
fn is_plain_md5(etag: &str) -> bool {
    etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Downloads one object to `destination`.
///
/// Bytes are streamed into `<destination>.part`, which is renamed over
/// `destination` only once the transfer is complete and verified, so a failed
/// attempt never clobbers a previously mirrored copy. The part file is
/// removed on every error path.
///
/// # Returns
///
/// The number of bytes written.
pub async fn fetch_object(
    store: &dyn ObjectStore,
    object: &RemoteObject,
    destination: &Path,
    verify_md5: bool,
) -> Result<u64> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let byte_stream = store.fetch(&object.key).await?;

    let part = partial_path(destination);
    let file = tokio::fs::File::create(&part).await?;

    let result = match write_part(byte_stream, file, object, verify_md5).await {
        Ok(written) => tokio::fs::rename(&part, destination)
            .await
            .map(|()| written)
            .map_err(SyncError::from),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    result
}

/// Streams `byte_stream` into `file` and checks size and MD5.
async fn write_part(
    mut byte_stream: BoxStream<'static, Result<Bytes>>,
    file: tokio::fs::File,
    object: &RemoteObject,
    verify_md5: bool,
) -> Result<u64> {
    let mut file = BufWriter::new(file);

    // Stream download and compute MD5 simultaneously
    let mut hasher = (verify_md5 && is_plain_md5(&object.etag)).then(Md5::new);
    let mut written = 0u64;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk?;
        if let Some(h) = hasher.as_mut() {
            h.update(&chunk);
        }
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    if let Some(expected) = object.size {
        if written != expected {
            return Err(SyncError::IoError(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Size mismatch for {}: expected {} bytes, got {} bytes",
                    object.key, expected, written
                ),
            )));
        }
    }

    if let Some(hasher) = hasher {
        let computed = format!("{:x}", hasher.finalize());
        if !computed.eq_ignore_ascii_case(&object.etag) {
            return Err(SyncError::Md5Mismatch {
                key: object.key.clone(),
                expected: object.etag.clone(),
                actual: computed,
            });
        }
        debug!("MD5 verified for {}", object.key);
    }

    Ok(written)
}

/// Attempt budget and pacing for one object.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Must be at least 1.
    pub retry_limit: u32,
    /// Failed attempt `n` (from 1) is followed by a `2^n * backoff_unit` pause.
    pub backoff_unit: Duration,
    pub transfer_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            backoff_unit: Duration::from_secs(1),
            transfer_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Pauses between consecutive attempts: `2, 4, 8, ...` units, one fewer
    /// than the number of attempts. A `retry_limit` of 0 has no pauses;
    /// [`Syncer::run`](crate::Syncer::run) rejects it before any download.
    pub fn delays(&self) -> Vec<Duration> {
        let unit_ms = u64::try_from(self.backoff_unit.as_millis()).unwrap_or(u64::MAX);
        ExponentialBackoff::from_millis(2)
            .factor(unit_ms)
            .take(self.retry_limit.saturating_sub(1) as usize)
            .collect()
    }
}

/// Final result of downloading one object, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub success: bool,
    /// Message of the last failed attempt.
    pub error: Option<String>,
    pub attempts: u32,
    pub bytes: u64,
}

/// Downloads `object` to `destination`, retrying failed attempts.
///
/// Never returns an error: transfer failures are captured in the outcome so
/// the caller can record them. The backoff pause suspends only this task.
pub async fn download_with_retry(
    store: &dyn ObjectStore,
    object: &RemoteObject,
    destination: &Path,
    policy: &RetryPolicy,
    verify_md5: bool,
    events: &EventSink,
) -> DownloadOutcome {
    let delays = policy.delays();
    let attempts = AtomicU32::new(0);

    let result = Retry::spawn(delays.clone(), || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delays = &delays;

        async move {
            events.emit(SyncEvent::DownloadStarted {
                key: object.key.clone(),
                attempt,
            });

            let transfer = fetch_object(store, object, destination, verify_md5);
            let result = match policy.transfer_timeout {
                Some(limit) => match tokio::time::timeout(limit, transfer).await {
                    Ok(result) => result,
                    Err(_) => {
                        // The cancelled transfer may have left a part file behind.
                        let _ = tokio::fs::remove_file(partial_path(destination)).await;
                        Err(SyncError::Timeout(object.key.clone()))
                    }
                },
                None => transfer.await,
            };

            match result {
                Ok(bytes) => Ok(bytes),
                Err(e) => {
                    warn!("Failed to download {} due to error: {}", object.key, e);
                    if let Some(delay) = delays.get(attempt as usize - 1) {
                        events.emit(SyncEvent::RetryScheduled {
                            key: object.key.clone(),
                            attempt,
                            delay: *delay,
                            error: e.to_string(),
                        });
                    }
                    RetryError::to_transient(e)
                }
            }
        }
    })
    .await;

    let attempts = attempts.load(Ordering::SeqCst);
    match result {
        Ok(bytes) => DownloadOutcome {
            success: true,
            error: None,
            attempts,
            bytes,
        },
        Err(e) => DownloadOutcome {
            success: false,
            error: Some(e.to_string()),
            attempts,
            bytes: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn remote(key: &str, etag: &str, size: usize) -> RemoteObject {
        RemoteObject {
            key: key.to_string(),
            etag: etag.to_string(),
            last_modified: Utc::now(),
            size: Some(size as u64),
        }
    }

    fn fast_policy(retry_limit: u32) -> RetryPolicy {
        RetryPolicy {
            retry_limit,
            backoff_unit: Duration::from_millis(1),
            transfer_timeout: None,
        }
    }

    #[test]
    fn test_local_path_strips_prefix() {
        let dir = Path::new("/mirror");
        assert_eq!(
            local_path(dir, "photos/2024/a.jpg", "photos/").unwrap(),
            PathBuf::from("/mirror/2024/a.jpg")
        );
        assert_eq!(
            local_path(dir, "photos/a.jpg", "photos").unwrap(),
            PathBuf::from("/mirror/a.jpg")
        );
        assert_eq!(
            local_path(dir, "a.jpg", "").unwrap(),
            PathBuf::from("/mirror/a.jpg")
        );
        assert_eq!(
            local_path(dir, "photos/a.jpg", "/photos/").unwrap(),
            PathBuf::from("/mirror/a.jpg")
        );
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("photos")), "photos/");
        assert_eq!(normalize_prefix(Some("/photos")), "photos/");
        assert_eq!(normalize_prefix(Some("photos/")), "photos/");
        assert_eq!(normalize_prefix(Some("a/b")), "a/b/");
    }

    #[test]
    fn test_local_path_matches_whole_segments() {
        let dir = Path::new("/mirror");
        assert!(matches!(
            local_path(dir, "photos2/a", "photos"),
            Err(SyncError::InvalidKey { .. })
        ));
        assert_eq!(
            local_path(dir, "photos/a", "photos").unwrap(),
            PathBuf::from("/mirror/a")
        );
    }

    #[test]
    fn test_local_path_rejects_escapes_and_markers() {
        let dir = Path::new("/mirror");
        assert!(local_path(dir, "../etc/passwd", "").is_err());
        assert!(local_path(dir, "a/../../b", "").is_err());
        assert!(local_path(dir, "photos/", "").is_err());
        assert!(local_path(dir, "photos/", "photos/").is_err());
    }

    #[test]
    fn test_delays_double_each_attempt() {
        let policy = RetryPolicy {
            retry_limit: 4,
            backoff_unit: Duration::from_secs(1),
            transfer_timeout: None,
        };
        assert_eq!(
            policy.delays(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        assert!(RetryPolicy { retry_limit: 1, ..policy.clone() }.delays().is_empty());
        assert!(RetryPolicy { retry_limit: 0, ..policy }.delays().is_empty());
    }

    #[test]
    fn test_plain_md5_detection() {
        assert!(is_plain_md5("5d41402abc4b2a76b9719d911017c592"));
        assert!(!is_plain_md5("5d41402abc4b2a76b9719d911017c592-2"));
        assert!(!is_plain_md5("e1"));
    }

    #[tokio::test]
    async fn test_fetch_writes_file_and_overwrites() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("nested").join("a.txt");
        let store = MemoryStore::new();

        store.put("a.txt", "first", "e1");
        fetch_object(&store, &remote("a.txt", "e1", 5), &dest, true)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "first");

        store.put("a.txt", "second!", "e2");
        let written = fetch_object(&store, &remote("a.txt", "e2", 7), &dest, true)
            .await
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "second!");
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_fetch_verifies_md5_etag() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("hello.txt");
        let store = MemoryStore::new();
        // md5("hello")
        store.put("hello.txt", "hello", "\"5d41402abc4b2a76b9719d911017c592\"");

        let good = remote("hello.txt", "5d41402abc4b2a76b9719d911017c592", 5);
        assert_eq!(fetch_object(&store, &good, &dest, true).await.unwrap(), 5);

        let bad = remote("hello.txt", "00000000000000000000000000000000", 5);
        let result = fetch_object(&store, &bad, &dest, true).await;
        assert!(matches!(result, Err(SyncError::Md5Mismatch { .. })));
        // The earlier good copy survives a failed attempt.
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello");

        assert!(fetch_object(&store, &bad, &dest, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let temp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.put("a", "data", "e1");
        store.fail_next("a", 2);

        let outcome = download_with_retry(
            &store,
            &remote("a", "e1", 4),
            &temp.path().join("a"),
            &fast_policy(3),
            true,
            &EventSink::discard(),
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.bytes, 4);
        assert_eq!(store.fetch_count("a"), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_limit() {
        let temp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.put("a", "data", "e1");
        store.fail_always("a");
        let (events, mut rx) = EventSink::channel();

        let outcome = download_with_retry(
            &store,
            &remote("a", "e1", 4),
            &temp.path().join("a"),
            &fast_policy(3),
            true,
            &events,
        )
        .await;
        drop(events);

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.error.unwrap().contains("injected failure"));
        assert_eq!(store.fetch_count("a"), 3);

        let mut retry_delays = Vec::new();
        while let Some(event) = rx.recv().await {
            if let SyncEvent::RetryScheduled { delay, .. } = event {
                retry_delays.push(delay);
            }
        }
        assert_eq!(
            retry_delays,
            vec![Duration::from_millis(2), Duration::from_millis(4)]
        );
    }

    #[tokio::test]
    async fn test_hex_etag_is_not_checked_unless_enabled() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("enc.bin");
        let store = MemoryStore::new();
        // SSE-KMS style ETag: 32 hex digits that are not the content MD5.
        store.put("enc.bin", "x", "\"0123456789abcdef0123456789abcdef\"");
        let object = remote("enc.bin", "0123456789abcdef0123456789abcdef", 1);

        assert_eq!(fetch_object(&store, &object, &dest, false).await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "x");
    }

    #[tokio::test]
    async fn test_timed_out_attempt_removes_part_file() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("slow.bin");
        let store = MemoryStore::new();
        store.put("slow.bin", "data", "e1");
        store.stall_always("slow.bin");

        let policy = RetryPolicy {
            retry_limit: 2,
            backoff_unit: Duration::from_millis(1),
            transfer_timeout: Some(Duration::from_millis(20)),
        };
        let outcome = download_with_retry(
            &store,
            &remote("slow.bin", "e1", 4),
            &dest,
            &policy,
            false,
            &EventSink::discard(),
        )
        .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_size_mismatch_removes_part_file() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("short.bin");
        let store = MemoryStore::new();
        store.put("short.bin", "abc", "e1");

        let result = fetch_object(&store, &remote("short.bin", "e1", 10), &dest, false).await;
        assert!(matches!(result, Err(SyncError::IoError(_))));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_missing_object_is_reported_not_raised() {
        let temp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();

        let outcome = download_with_retry(
            &store,
            &remote("gone", "e1", 1),
            &temp.path().join("gone"),
            &fast_policy(2),
            true,
            &EventSink::discard(),
        )
        .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(!temp.path().join("gone").exists());
    }
}
