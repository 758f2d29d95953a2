//! BucketMirror - Incremental, resumable mirroring of S3-compatible buckets
//!
//! This library mirrors the objects of a remote bucket (or a prefix within it)
//! into a local directory. It remembers the ETag of every object it has
//! downloaded, so repeated runs only transfer what changed.
//!
//! # Features
//!
//! - **Incremental Sync**: Per-object ETag tracking across runs
//! - **Crash Safety**: State is saved atomically after every completed object
//! - **Automatic Retry**: Exponential backoff for transient transfer failures
//! - **Parallel Downloads**: Bounded worker pool
//! - **Progress Events**: Structured event stream for logging and progress bars
//!
//! # Example
//!
//! ```no_run
//! use bucketmirror::{MemoryStore, SyncConfig, Syncer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! store.put("photos/a.jpg", "bytes", "\"e1\"");
//!
//! let config = SyncConfig {
//!     local_dir: "./mirror".into(),
//!     ..SyncConfig::default()
//! };
//! let report = Syncer::new(store, config).run().await?;
//! assert_eq!(report.succeeded, 1);
//! # Ok(())
//! # }
//! ```

mod cache;
mod detect;
mod download;
mod error;
mod events;
mod orchestrator;
mod state;
mod store;
mod types;

pub use cache::ListingCache;
pub use detect::needs_download;
pub use download::{
    download_with_retry, fetch_object, local_path, normalize_prefix, DownloadOutcome, RetryPolicy,
};
pub use error::{Result, SyncError};
pub use events::{log_event, EventSink, SyncEvent};
pub use orchestrator::Syncer;
pub use state::StateStore;
pub use store::{strip_etag_quotes, MemoryStore, ObjectStore, OpendalStore, S3Options};
pub use types::{
    BucketCheck, FailedObject, RemoteObject, SyncConfig, SyncOutcome, SyncRecord, SyncReport,
    SyncState, DEFAULT_STATE_FILE,
};
