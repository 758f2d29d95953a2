//! Main orchestration logic for mirroring a bucket.

use crate::cache::ListingCache;
use crate::detect::needs_download;
use crate::download::{
    download_with_retry, local_path, normalize_prefix, DownloadOutcome, RetryPolicy,
};
use crate::error::{Result, SyncError};
use crate::events::{EventSink, SyncEvent};
use crate::state::StateStore;
use crate::store::ObjectStore;
use crate::types::{
    BucketCheck, FailedObject, RemoteObject, SyncConfig, SyncOutcome, SyncRecord, SyncReport,
    SyncState,
};
use chrono::Utc;
use futures_util::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info};

/// State shared between the control task and the download workers.
///
/// Every record update is followed by a full save while the lock is held, so
/// updates and saves are applied one at a time.
struct SharedState {
    state: Mutex<SyncState>,
    store: StateStore,
}

impl SharedState {
    /// Replaces the record for `key` with `make(previous)` and persists the
    /// whole state.
    ///
    /// Returns the save error, if any. The in-memory update stands either way.
    async fn update<F>(&self, key: &str, make: F, events: &EventSink) -> Option<String>
    where
        F: FnOnce(Option<&SyncRecord>) -> SyncRecord,
    {
        let mut state = self.state.lock().await;
        let record = make(state.record(key));
        state.records.insert(key.to_string(), record);
        save_locked(&self.store, &state, events).await
    }
}

async fn save_locked(store: &StateStore, state: &SyncState, events: &EventSink) -> Option<String> {
    match store.save(state).await {
        Ok(()) => {
            events.emit(SyncEvent::StateSaved {
                records: state.records.len(),
            });
            None
        }
        Err(e) => {
            let error = e.to_string();
            events.emit(SyncEvent::StateSaveFailed {
                error: error.clone(),
            });
            Some(error)
        }
    }
}

/// One unit of work: an object and where it lands locally.
struct WorkItem {
    object: RemoteObject,
    destination: PathBuf,
}

/// What a worker reports back to the control task.
struct WorkerResult {
    outcome: DownloadOutcome,
    save_error: Option<String>,
}

/// Mirrors one bucket (or prefix) into a local directory.
///
/// # Example
///
/// ```no_run
/// use bucketmirror::{OpendalStore, S3Options, SyncConfig, Syncer};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = OpendalStore::s3(&S3Options {
///     bucket: "my-bucket".to_string(),
///     region: Some("us-east-1".to_string()),
///     endpoint: None,
/// })?;
/// let mut syncer = Syncer::new(Arc::new(store), SyncConfig::default());
/// let report = syncer.run().await?;
/// println!("{} downloaded, {} failed", report.succeeded, report.failed.len());
/// # Ok(())
/// # }
/// ```
pub struct Syncer {
    store: Arc<dyn ObjectStore>,
    config: SyncConfig,
    events: EventSink,
    cache: Option<ListingCache>,
}

impl Syncer {
    pub fn new(store: Arc<dyn ObjectStore>, config: SyncConfig) -> Self {
        let cache = config.listing_ttl.map(ListingCache::new);
        Self {
            store,
            config,
            events: EventSink::discard(),
            cache,
        }
    }

    /// Sends progress events to `events`.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Forgets any cached listing, forcing the next run to list again.
    pub fn invalidate_listing_cache(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_limit: self.config.retry_limit,
            backoff_unit: self.config.backoff_unit,
            transfer_timeout: self.config.transfer_timeout,
        }
    }

    /// Rejects settings the pool and retry loop cannot run with.
    fn validate_config(&self) -> Result<()> {
        if self.config.workers == 0 {
            return Err(SyncError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.config.retry_limit == 0 {
            return Err(SyncError::InvalidConfig(
                "retry_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads state, treating a corrupt file as empty.
    fn load_state(&self, store: &StateStore) -> Result<SyncState> {
        match store.load() {
            Ok(state) => Ok(state),
            Err(SyncError::CorruptState { reason, .. }) => {
                self.events.emit(SyncEvent::StateCorrupt { reason });
                Ok(SyncState::default())
            }
            Err(e) => Err(e),
        }
    }

    /// True if the bucket-level timestamp shows nothing changed since the
    /// last pass and that pass left no failed objects behind.
    async fn bucket_unchanged(&self, state: &SyncState) -> bool {
        if self.config.bucket_check == BucketCheck::Disabled {
            return false;
        }
        let Some(last_sync) = state.last_sync else {
            return false;
        };
        if state.records.values().any(|r| !r.success) {
            return false;
        }
        last_sync >= self.store.bucket_last_modified().await
    }

    /// Lists the configured prefix, serving a fresh cached listing if one exists.
    async fn list_objects(&mut self, prefix: &str) -> Result<Vec<RemoteObject>> {
        if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(prefix)) {
            info!("Using cached listing for prefix {:?}", prefix);
            return Ok(cached.to_vec());
        }

        let objects: Vec<RemoteObject> = self.store.list(prefix).try_collect().await?;

        if let Some(cache) = self.cache.as_mut() {
            cache.insert(prefix, objects.clone());
        }
        Ok(objects)
    }

    /// Runs one sync pass.
    ///
    /// 1. Creates the local directory, locks and loads the state
    /// 2. Skips everything if the bucket is unchanged (see [`BucketCheck`])
    /// 3. Lists the bucket and keeps the objects whose etag changed
    /// 4. Downloads them on a bounded pool, saving state after each one
    /// 5. Stamps `last_sync` and saves once more
    ///
    /// # Errors
    ///
    /// Fails with `InvalidConfig` before touching disk if `workers` or
    /// `retry_limit` is 0. Otherwise fails only if the local directory cannot
    /// be created, the state file is locked or unreadable, or the listing
    /// fails. Individual download failures are reported in
    /// [`SyncReport::failed`].
    pub async fn run(&mut self) -> Result<SyncReport> {
        self.validate_config()?;
        tokio::fs::create_dir_all(&self.config.local_dir).await?;

        let state_store = StateStore::open_locked(self.config.state_path())?;
        let state = self.load_state(&state_store)?;

        if self.bucket_unchanged(&state).await {
            self.events.emit(SyncEvent::BucketUnchanged);
            return Ok(SyncReport::unchanged());
        }

        let prefix = normalize_prefix(self.config.prefix.as_deref());
        let listed = self.list_objects(&prefix).await?;

        let shared = Arc::new(SharedState {
            state: Mutex::new(state),
            store: state_store,
        });

        let mut work = Vec::new();
        let mut failed = Vec::new();
        let mut save_errors = Vec::new();
        {
            let state = shared.state.lock().await;
            for object in listed.iter().filter(|o| needs_download(o, &state)) {
                match local_path(&self.config.local_dir, &object.key, &prefix) {
                    Ok(destination) => work.push(WorkItem {
                        object: object.clone(),
                        destination,
                    }),
                    Err(e) => failed.push((object.clone(), e.to_string())),
                }
            }
        }

        let total_bytes: u64 = work.iter().filter_map(|w| w.object.size).sum();
        self.events.emit(SyncEvent::ListingComplete {
            listed: listed.len(),
            scheduled: work.len() + failed.len(),
            total_bytes,
        });

        // Keys that cannot be mapped locally are recorded without a transfer.
        let mut report_failed = Vec::new();
        for (object, error) in failed {
            self.events.emit(SyncEvent::DownloadFailed {
                key: object.key.clone(),
                attempts: 0,
                error: error.clone(),
            });
            let make = |previous: Option<&SyncRecord>| {
                SyncRecord::failed(&object, previous, error.clone())
            };
            if let Some(e) = shared.update(&object.key, make, &self.events).await {
                save_errors.push(e);
            }
            report_failed.push(FailedObject {
                key: object.key,
                error,
            });
        }

        let attempted = work.len() + report_failed.len();
        let mut succeeded = 0;

        // Create semaphore to limit concurrent downloads
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let policy = Arc::new(self.retry_policy());
        let mut download_tasks = Vec::with_capacity(work.len());

        for item in work {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| SyncError::DownloadFailed(format!("Worker pool closed: {}", e)))?;

            let store = Arc::clone(&self.store);
            let shared = Arc::clone(&shared);
            let policy = Arc::clone(&policy);
            let events = self.events.clone();
            let verify_md5 = self.config.verify_md5;
            let object = item.object.clone();

            let task = tokio::spawn(async move {
                let _permit = permit;
                let outcome = download_with_retry(
                    store.as_ref(),
                    &item.object,
                    &item.destination,
                    &policy,
                    verify_md5,
                    &events,
                )
                .await;

                if outcome.success {
                    events.emit(SyncEvent::DownloadSucceeded {
                        key: item.object.key.clone(),
                        bytes: outcome.bytes,
                    });
                } else {
                    events.emit(SyncEvent::DownloadFailed {
                        key: item.object.key.clone(),
                        attempts: outcome.attempts,
                        error: outcome.error.clone().unwrap_or_default(),
                    });
                }

                let make = |previous: Option<&SyncRecord>| {
                    if outcome.success {
                        SyncRecord::succeeded(&item.object)
                    } else {
                        SyncRecord::failed(
                            &item.object,
                            previous,
                            outcome.error.clone().unwrap_or_default(),
                        )
                    }
                };
                let save_error = shared.update(&item.object.key, make, &events).await;
                WorkerResult {
                    outcome,
                    save_error,
                }
            });

            download_tasks.push((object, task));
        }

        // Wait for all downloads to complete
        for (object, task) in download_tasks {
            match task.await {
                Ok(result) => {
                    if result.outcome.success {
                        succeeded += 1;
                    } else {
                        report_failed.push(FailedObject {
                            key: object.key.clone(),
                            error: result.outcome.error.unwrap_or_default(),
                        });
                    }
                    if let Some(e) = result.save_error {
                        save_errors.push(e);
                    }
                }
                Err(e) => {
                    error!("Task join error for {}: {}", object.key, e);
                    let error = format!("Task failed: {}", e);
                    let make = |previous: Option<&SyncRecord>| {
                        SyncRecord::failed(&object, previous, error.clone())
                    };
                    if let Some(e) = shared.update(&object.key, make, &self.events).await {
                        save_errors.push(e);
                    }
                    report_failed.push(FailedObject {
                        key: object.key,
                        error,
                    });
                }
            }
        }

        {
            let mut state = shared.state.lock().await;
            state.last_sync = Some(Utc::now());
            if let Some(e) = save_locked(&shared.store, &state, &self.events).await {
                save_errors.push(e);
            }
        }

        Ok(SyncReport {
            outcome: SyncOutcome::Completed,
            listed: listed.len(),
            attempted,
            succeeded,
            failed: report_failed,
            save_errors,
        })
    }
}
