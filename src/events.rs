//! Progress events emitted by the mirror engine.
//!
//! The engine never formats or prints progress itself. It pushes
//! [`SyncEvent`]s into an [`EventSink`]; whoever holds the receiving end
//! decides how to present them (see [`log_event`] for the tracing rendering
//! used by the CLI).

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Something observable that happened during a sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The persisted state could not be parsed and was replaced by an empty one.
    StateCorrupt { reason: String },
    /// The bucket has not changed since the last pass.
    BucketUnchanged,
    /// Listing finished. `scheduled` of `listed` objects need downloading.
    ListingComplete {
        listed: usize,
        scheduled: usize,
        total_bytes: u64,
    },
    DownloadStarted { key: String, attempt: u32 },
    /// An attempt failed and another one follows after `delay`.
    RetryScheduled {
        key: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    DownloadSucceeded { key: String, bytes: u64 },
    /// All attempts for `key` failed.
    DownloadFailed {
        key: String,
        attempts: u32,
        error: String,
    },
    StateSaved { records: usize },
    StateSaveFailed { error: String },
}

/// Sending half of the event stream. Cloned into every worker.
///
/// A sink without a receiver, or whose receiver has been dropped, silently
/// discards events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl EventSink {
    /// Creates a sink and the receiver that consumes its events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Renders an event through `tracing`.
pub fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::StateCorrupt { reason } => {
            warn!("State file is corrupt, starting from empty state: {}", reason)
        }
        SyncEvent::BucketUnchanged => info!("Bucket unchanged since last sync, nothing to do"),
        SyncEvent::ListingComplete {
            listed,
            scheduled,
            total_bytes,
        } => info!(
            "Listed {} objects, {} need downloading ({} bytes)",
            listed, scheduled, total_bytes
        ),
        SyncEvent::DownloadStarted { key, attempt } => {
            debug!("Downloading {} (attempt {})", key, attempt)
        }
        SyncEvent::RetryScheduled {
            key,
            attempt,
            delay,
            error,
        } => warn!(
            "Attempt {} for {} failed, retrying in {}: {}",
            attempt,
            key,
            humantime::format_duration(*delay),
            error
        ),
        SyncEvent::DownloadSucceeded { key, bytes } => {
            debug!("Downloaded {} ({} bytes)", key, bytes)
        }
        SyncEvent::DownloadFailed {
            key,
            attempts,
            error,
        } => warn!(
            "Giving up on {} after {} attempts: {}",
            key, attempts, error
        ),
        SyncEvent::StateSaved { records } => debug!("State saved ({} records)", records),
        SyncEvent::StateSaveFailed { error } => warn!(
            "Failed to save state, completed downloads may be repeated next run: {}",
            error
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(SyncEvent::BucketUnchanged);
        sink.emit(SyncEvent::StateSaved { records: 2 });
        drop(sink);

        assert_eq!(rx.recv().await, Some(SyncEvent::BucketUnchanged));
        assert_eq!(rx.recv().await, Some(SyncEvent::StateSaved { records: 2 }));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_discard_and_closed_receiver_do_not_panic() {
        EventSink::discard().emit(SyncEvent::BucketUnchanged);

        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(SyncEvent::BucketUnchanged);
    }
}
