use anyhow::Context;
use bucketmirror::{
    log_event, BucketCheck, EventSink, OpendalStore, S3Options, SyncConfig, SyncEvent,
    SyncOutcome, Syncer,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bucketmirror")]
#[command(about = "Incrementally mirror an S3-compatible bucket to a local directory", long_about = None)]
#[command(version)]
struct Args {
    /// Bucket to mirror
    #[arg(short, long, env = "BUCKETMIRROR_BUCKET")]
    bucket: String,

    /// Local destination directory
    #[arg(short, long, default_value = "./mirror")]
    local_dir: PathBuf,

    /// State file (default: <local-dir>/.bucketmirror-state.json)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Only mirror keys under this prefix
    #[arg(short, long)]
    prefix: Option<String>,

    /// Number of concurrent downloads
    #[arg(short, long, default_value_t = 10)]
    workers: usize,

    /// Attempts per object before giving up
    #[arg(long, default_value_t = 3)]
    retry_limit: u32,

    /// Backoff unit; failed attempt n waits 2^n units
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    backoff_unit: Duration,

    /// Timeout for a single transfer attempt (e.g. "5m")
    #[arg(long, value_parser = humantime::parse_duration)]
    transfer_timeout: Option<Duration>,

    /// Reuse a listing fetched within this window (long-running embeddings only)
    #[arg(long, value_parser = humantime::parse_duration)]
    listing_ttl: Option<Duration>,

    /// Always list and diff, even if the bucket reports no change since the last run
    #[arg(long)]
    no_bucket_check: bool,

    /// Compare downloaded bytes against 32-hex ETags as content MD5s.
    /// Leave off for buckets using SSE-KMS or SSE-C, whose ETags are not MD5s.
    #[arg(long)]
    verify_md5: bool,

    /// Bucket region
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Custom endpoint for S3-compatible providers (R2, MinIO, ...)
    #[arg(long, env = "BUCKETMIRROR_ENDPOINT")]
    endpoint: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            local_dir: self.local_dir.clone(),
            state_file: self.state_file.clone(),
            prefix: self.prefix.clone(),
            workers: self.workers,
            retry_limit: self.retry_limit,
            backoff_unit: self.backoff_unit,
            transfer_timeout: self.transfer_timeout,
            listing_ttl: self.listing_ttl,
            bucket_check: if self.no_bucket_check {
                BucketCheck::Disabled
            } else {
                BucketCheck::Enabled
            },
            verify_md5: self.verify_md5,
        }
    }
}

/// Logs events and, on a terminal, drives a progress bar.
async fn consume_events(mut rx: UnboundedReceiver<SyncEvent>) {
    let pb = if atty::is(atty::Stream::Stderr) {
        let progress_bar = indicatif::ProgressBar::hidden();
        progress_bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("█▓▒░ "),
        );
        Some(progress_bar)
    } else {
        None
    };

    while let Some(event) = rx.recv().await {
        match &pb {
            Some(pb) => {
                match &event {
                    SyncEvent::ListingComplete { scheduled, .. } if *scheduled > 0 => {
                        pb.set_length(*scheduled as u64);
                        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                    }
                    SyncEvent::DownloadStarted { key, .. } => {
                        pb.set_message(format!("| Downloading: {}", key))
                    }
                    SyncEvent::DownloadSucceeded { .. } | SyncEvent::DownloadFailed { .. } => {
                        pb.inc(1)
                    }
                    _ => {}
                }
                pb.suspend(|| log_event(&event));
            }
            None => log_event(&event),
        }
    }

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("bucketmirror={}", log_level))
        .init();

    info!("BucketMirror - S3 bucket mirror");
    info!("Bucket: {}", args.bucket);
    if let Some(prefix) = &args.prefix {
        info!("Prefix: {}", prefix);
    }
    info!("Local directory: {:?}", args.local_dir);

    if args.workers == 0 {
        anyhow::bail!("--workers must be at least 1");
    }
    if args.retry_limit == 0 {
        anyhow::bail!("--retry-limit must be at least 1");
    }

    let store = OpendalStore::s3(&S3Options {
        bucket: args.bucket.clone(),
        region: args.region.clone(),
        endpoint: args.endpoint.clone(),
    })
    .context("Failed to configure object store")?;

    let (events, rx) = EventSink::channel();
    let consumer = tokio::spawn(consume_events(rx));

    let mut syncer = Syncer::new(Arc::new(store), args.sync_config()).with_events(events);
    let result = syncer.run().await;

    // Dropping the syncer closes the event channel so the consumer drains and exits.
    drop(syncer);
    let _ = consumer.await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("Sync failed: {}", e);
            std::process::exit(1);
        }
    };

    if report.outcome == SyncOutcome::Unchanged {
        info!("Bucket unchanged, nothing to do");
        return Ok(());
    }

    info!(
        "Listed {} objects: {} attempted, {} succeeded, {} failed",
        report.listed,
        report.attempted,
        report.succeeded,
        report.failed.len()
    );
    for failed in &report.failed {
        warn!("Failed: {}: {}", failed.key, failed.error);
    }
    for e in &report.save_errors {
        warn!("State save error: {}", e);
    }

    if !report.is_clean() {
        std::process::exit(2);
    }
    info!("Sync completed successfully");
    Ok(())
}
