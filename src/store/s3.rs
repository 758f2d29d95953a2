//! S3 and S3-compatible buckets through OpenDAL.

use crate::error::{Result, SyncError};
use crate::store::{strip_etag_quotes, ObjectStore};
use crate::types::RemoteObject;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use opendal::{services::S3, Entry, Operator};
use tracing::{debug, warn};

/// Connection settings for an S3 bucket.
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub bucket: String,
    /// Region, e.g. `us-east-1`. Required by AWS, usually `auto` for R2.
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible providers (R2, MinIO, ...).
    pub endpoint: Option<String>,
}

/// [`ObjectStore`] over an OpenDAL operator.
///
/// Credentials are resolved by OpenDAL's default chain: environment
/// variables, the shared credentials file, then instance/pod identity.
pub struct OpendalStore {
    operator: Operator,
    bucket: String,
}

impl OpendalStore {
    /// Connects to an S3 (or S3-compatible) bucket.
    pub fn s3(options: &S3Options) -> Result<Self> {
        let mut builder = S3::default().bucket(&options.bucket);
        if let Some(region) = &options.region {
            builder = builder.region(region);
        }
        if let Some(endpoint) = &options.endpoint {
            builder = builder.endpoint(endpoint);
        }

        let operator = Operator::new(builder)?.finish();
        Ok(Self::from_operator(operator, &options.bucket))
    }

    /// Wraps an already configured operator.
    pub fn from_operator(operator: Operator, bucket: &str) -> Self {
        Self {
            operator,
            bucket: bucket.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Converts a listing entry, skipping directories.
    ///
    /// Listings that omit the ETag fall back to a `stat` of the key. If the
    /// store has no ETag at all, the last-modified time becomes the fingerprint.
    async fn to_remote_object(&self, entry: Entry) -> Result<Option<RemoteObject>> {
        let (path, meta) = entry.into_parts();
        if meta.mode().is_dir() || path.ends_with('/') {
            return Ok(None);
        }

        let meta = if meta.etag().is_none() {
            debug!("Listing returned no ETag for {}, falling back to stat", path);
            self.operator.stat(&path).await?
        } else {
            meta
        };

        let last_modified = meta.last_modified();
        let etag = match (meta.etag(), last_modified) {
            (Some(etag), _) => strip_etag_quotes(etag).to_string(),
            (None, Some(lm)) => format!("mtime:{}", lm.to_rfc3339()),
            (None, None) => {
                return Err(SyncError::StoreError(format!(
                    "Store reported neither ETag nor last-modified for {}",
                    path
                )))
            }
        };

        Ok(Some(RemoteObject {
            key: path,
            etag,
            last_modified: last_modified.unwrap_or_else(Utc::now),
            size: Some(meta.content_length()),
        }))
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    fn list<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<RemoteObject>> {
        let prefix = prefix.trim_start_matches('/');
        let lister = async move {
            self.operator
                .lister_with(prefix)
                .recursive(true)
                .await
                .map_err(SyncError::from)
        };

        stream::once(lister)
            .map_ok(|lister| lister.map_err(SyncError::from))
            .try_flatten()
            .try_filter_map(move |entry| self.to_remote_object(entry))
            .boxed()
    }

    async fn bucket_last_modified(&self) -> DateTime<Utc> {
        match self.operator.stat("/").await {
            Ok(meta) => meta.last_modified().unwrap_or_else(Utc::now),
            Err(e) => {
                warn!(
                    "Could not read modification time of bucket {}: {}",
                    self.bucket, e
                );
                Utc::now()
            }
        }
    }

    async fn fetch(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let reader = self.operator.reader(key).await?;
        let bytes = reader.into_bytes_stream(..).await?;
        Ok(bytes.map_err(SyncError::IoError).boxed())
    }
}
