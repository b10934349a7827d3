//! Background sweep for expired cache entries, retained jobs and stale
//! progress snapshots.
//!
//! Runs once at startup, then periodically (daily by default).

use std::time::Duration;
use tokio::time;

use crate::services::cache::CacheStore;
use crate::services::job_queue::JobQueue;
use crate::services::progress::ProgressTracker;

/// Terminal progress snapshots older than this are dropped
const PROGRESS_MAX_AGE_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Default)]
pub struct SweepResult {
    pub cache_entries_removed: usize,
    pub jobs_removed: usize,
    pub progress_removed: usize,
}

impl SweepResult {
    pub fn total(&self) -> usize {
        self.cache_entries_removed + self.jobs_removed + self.progress_removed
    }
}

/// Run a single sweep cycle
pub async fn run_sweep(
    cache: &CacheStore,
    queue: &JobQueue,
    progress: &ProgressTracker,
) -> SweepResult {
    let result = SweepResult {
        cache_entries_removed: cache.cleanup_expired().await,
        jobs_removed: queue.sweep_retention().await,
        progress_removed: progress.sweep(PROGRESS_MAX_AGE_MS).await,
    };

    if result.total() > 0 {
        tracing::info!(
            cache = result.cache_entries_removed,
            jobs = result.jobs_removed,
            progress = result.progress_removed,
            "sweep removed stale entries"
        );
    }
    result
}

/// Start the periodic sweep task; spawn with `tokio::spawn`
pub async fn start_sweep_task(
    cache: CacheStore,
    queue: JobQueue,
    progress: ProgressTracker,
    interval_secs: u64,
) {
    tracing::info!(interval_secs, "sweep task started");

    run_sweep(&cache, &queue, &progress).await;

    let mut interval = time::interval(Duration::from_secs(interval_secs.max(60)));
    interval.tick().await; // first tick fires immediately
    loop {
        interval.tick().await;
        run_sweep(&cache, &queue, &progress).await;
    }
}
