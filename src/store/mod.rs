//! Remote object store access.
//!
//! The mirror engine only needs three things from a store: a lazy listing of
//! objects with change tokens, a bucket-level modification signal, and the
//! bytes of one object. [`ObjectStore`] captures exactly that; each
//! implementation is bound to a single bucket when it is constructed.

use crate::error::Result;
use crate::types::RemoteObject;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::{OpendalStore, S3Options};

/// A bucket in a remote object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists every object under `prefix`, paginating as needed.
    ///
    /// The stream is lazy and unordered. Each call starts a fresh listing.
    fn list<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<RemoteObject>>;

    /// Best-effort bucket modification time.
    ///
    /// Stores without a reliable signal return the current time, so a caller
    /// comparing against its last pass never skips work because of it.
    async fn bucket_last_modified(&self) -> DateTime<Utc>;

    /// Streams the bytes of `key`.
    async fn fetch(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>>;
}

/// Removes transport quoting from an ETag: surrounding `"` and a weak `W/` marker.
pub fn strip_etag_quotes(etag: &str) -> &str {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    etag.trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_etag_quotes() {
        assert_eq!(strip_etag_quotes("\"e1\""), "e1");
        assert_eq!(strip_etag_quotes("W/\"e1\""), "e1");
        assert_eq!(strip_etag_quotes("e1"), "e1");
        assert_eq!(
            strip_etag_quotes("\"9bb58f26192e4ba00f01e2e7b136bbd8-3\""),
            "9bb58f26192e4ba00f01e2e7b136bbd8-3"
        );
    }
}
