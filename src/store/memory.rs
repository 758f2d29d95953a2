//! In-process object store.
//!
//! Holds objects in a map and counts fetches per key. Failures can be
//! injected per key to exercise retry and partial-failure paths.

use crate::error::{Result, SyncError};
use crate::store::{strip_etag_quotes, ObjectStore};
use crate::types::RemoteObject;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    /// Remaining injected failures per key; `None` fails forever.
    failures: HashMap<String, Option<u32>>,
    /// Keys whose transfers deliver the first chunk and then hang.
    stalls: HashSet<String>,
    fetches: HashMap<String, u32>,
    bucket_last_modified: Option<DateTime<Utc>>,
    list_error: Option<String>,
}

/// [`ObjectStore`] backed by memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts or replaces an object. The ETag may be given in quoted form.
    pub fn put(&self, key: &str, data: impl Into<Bytes>, etag: &str) {
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                etag: strip_etag_quotes(etag).to_string(),
                last_modified: Utc::now(),
            },
        );
    }

    /// Makes the next `times` fetches of `key` fail.
    pub fn fail_next(&self, key: &str, times: u32) {
        self.lock().failures.insert(key.to_string(), Some(times));
    }

    /// Makes every fetch of `key` fail.
    pub fn fail_always(&self, key: &str) {
        self.lock().failures.insert(key.to_string(), None);
    }

    /// Makes every fetch of `key` deliver its first chunk and then never
    /// finish.
    pub fn stall_always(&self, key: &str) {
        self.lock().stalls.insert(key.to_string());
    }

    /// Makes listing fail with `message`.
    pub fn fail_listing(&self, message: &str) {
        self.lock().list_error = Some(message.to_string());
    }

    /// Sets the bucket-level modification time. Unset means "now".
    pub fn set_bucket_last_modified(&self, at: DateTime<Utc>) {
        self.lock().bucket_last_modified = Some(at);
    }

    /// Number of fetch attempts made for `key`.
    pub fn fetch_count(&self, key: &str) -> u32 {
        self.lock().fetches.get(key).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u32 {
        self.lock().fetches.values().sum()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn list<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<RemoteObject>> {
        let inner = self.lock();
        if let Some(message) = &inner.list_error {
            return stream::once(futures_util::future::ready(Err(SyncError::StoreError(
                message.clone(),
            ))))
            .boxed();
        }

        let objects: Vec<Result<RemoteObject>> = inner
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, obj)| {
                Ok(RemoteObject {
                    key: key.clone(),
                    etag: obj.etag.clone(),
                    last_modified: obj.last_modified,
                    size: Some(obj.data.len() as u64),
                })
            })
            .collect();
        stream::iter(objects).boxed()
    }

    async fn bucket_last_modified(&self) -> DateTime<Utc> {
        self.lock().bucket_last_modified.unwrap_or_else(Utc::now)
    }

    async fn fetch(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let mut inner = self.lock();
        *inner.fetches.entry(key.to_string()).or_insert(0) += 1;

        if let Some(remaining) = inner.failures.get_mut(key) {
            match remaining {
                None => {
                    return Err(SyncError::StoreError(format!("injected failure for {}", key)))
                }
                Some(0) => {}
                Some(n) => {
                    *n -= 1;
                    return Err(SyncError::StoreError(format!("injected failure for {}", key)));
                }
            }
        }

        let object = inner
            .objects
            .get(key)
            .ok_or_else(|| SyncError::StoreError(format!("NotFound: {}", key)))?;

        // Split into two chunks so consumers see a multi-piece stream.
        let data = object.data.clone();
        let mid = data.len() / 2;
        if inner.stalls.contains(key) {
            let first = stream::iter(vec![Ok(data.slice(..mid))]);
            return Ok(first.chain(stream::pending()).boxed());
        }
        let chunks = vec![Ok(data.slice(..mid)), Ok(data.slice(mid..))];
        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let store = MemoryStore::new();
        store.put("photos/a.jpg", "a", "\"e1\"");
        store.put("docs/b.txt", "b", "e2");

        let listed: Vec<RemoteObject> = store.list("photos/").try_collect().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "photos/a.jpg");
        assert_eq!(listed[0].etag, "e1");
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let store = MemoryStore::new();
        store.put("a", "hello", "e1");
        store.fail_next("a", 1);

        assert!(store.fetch("a").await.is_err());
        let chunks: Vec<Bytes> = store.fetch("a").await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello");
        assert_eq!(store.fetch_count("a"), 2);
    }

    #[tokio::test]
    async fn test_stalled_fetch_never_completes() {
        let store = MemoryStore::new();
        store.put("a", "hello", "e1");
        store.stall_always("a");

        let mut chunks = store.fetch("a").await.unwrap();
        assert_eq!(chunks.next().await.unwrap().unwrap(), Bytes::from_static(b"he"));
        let rest =
            tokio::time::timeout(std::time::Duration::from_millis(10), chunks.next()).await;
        assert!(rest.is_err());
    }
}
