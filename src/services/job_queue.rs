use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::ParseError;
use crate::models::{Job, JobState, ParseOptions};

/// At-most-one parse per hash: an atomic set-if-absent table with TTL.
/// The TTL bounds damage from crashed workers; a live worker finishes and
/// releases long before it expires.
pub struct LockManager {
    locks: Mutex<HashMap<String, LockEntry>>,
}

struct LockEntry {
    owner: String,
    expires_at: Instant,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Set-if-absent. Returns true when this owner took the lock.
    pub fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();

        match locks.get(key) {
            Some(entry) if entry.expires_at > now => false,
            _ => {
                locks.insert(
                    key.to_string(),
                    LockEntry {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    /// Current owner, if the lock is held and unexpired
    pub fn holder(&self, key: &str) -> Option<String> {
        let locks = self.locks.lock().unwrap();
        locks
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.owner.clone())
    }

    pub fn release(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap();
        locks.remove(key);
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Global admission window: at most `max` job starts per `window`.
/// Protects origin servers from a thundering herd of fetches.
struct AdmissionWindow {
    max: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl AdmissionWindow {
    fn new(max: usize, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    async fn admit(&self) {
        loop {
            let wait = {
                let mut starts = self.starts.lock().unwrap();
                let now = Instant::now();
                while let Some(front) = starts.front() {
                    if now.duration_since(*front) >= self.window {
                        starts.pop_front();
                    } else {
                        break;
                    }
                }
                if starts.len() < self.max {
                    starts.push_back(now);
                    None
                } else {
                    starts
                        .front()
                        .map(|front| self.window.saturating_sub(now.duration_since(*front)))
                }
            };

            match wait {
                None => return,
                Some(delay) => sleep(delay.max(Duration::from_millis(10))).await,
            }
        }
    }
}

/// Job execution callback; the pipeline plugs in here
pub type JobRunner =
    Arc<dyn Fn(Job) -> BoxFuture<'static, Result<(), ParseError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub lock_ttl: Duration,
    pub rate_limit_max: usize,
    pub rate_limit_window: Duration,
    pub completed_retention_ms: i64,
    pub completed_retention_cap: usize,
    pub failed_retention_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 2,
            max_attempts: 3,
            retry_base_ms: 5_000,
            lock_ttl: Duration::from_secs(1800),
            rate_limit_max: 10,
            rate_limit_window: Duration::from_millis(60_000),
            completed_retention_ms: 24 * 60 * 60 * 1000,
            completed_retention_cap: 1000,
            failed_retention_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Outcome of a submission: either a fresh job or the one already owning
/// the hash
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job_id: String,
    pub queue_position: usize,
    pub coalesced: bool,
}

struct QueueInner {
    config: QueueConfig,
    jobs: RwLock<HashMap<String, Job>>,
    active_by_hash: RwLock<HashMap<String, String>>,
    pending: Mutex<VecDeque<String>>,
    notify: Notify,
    locks: LockManager,
    admission: AdmissionWindow,
    cancel: CancellationToken,
}

/// Durable-enough job queue keyed by playlist hash, with a bounded worker
/// pool, global admission and exponential retry for transient failures.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        let admission = AdmissionWindow::new(config.rate_limit_max, config.rate_limit_window);
        Self {
            inner: Arc::new(QueueInner {
                config,
                jobs: RwLock::new(HashMap::new()),
                active_by_hash: RwLock::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                locks: LockManager::new(),
                admission,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Submit a parse job. Concurrent submissions for the same hash
    /// coalesce onto the job already owning it; the check and insert happen
    /// under both registry locks so two near-simultaneous submitters cannot
    /// both enqueue.
    pub async fn submit(&self, hash: &str, url: &str, options: ParseOptions) -> SubmitOutcome {
        let mut jobs = self.inner.jobs.write().await;
        let mut by_hash = self.inner.active_by_hash.write().await;

        if let Some(existing_id) = by_hash.get(hash) {
            if let Some(job) = jobs.get(existing_id) {
                if !job.state.is_terminal() {
                    let job_id = existing_id.clone();
                    drop(by_hash);
                    drop(jobs);
                    return SubmitOutcome {
                        queue_position: self.position_of(&job_id),
                        job_id,
                        coalesced: true,
                    };
                }
            }
        }

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            hash: hash.to_string(),
            url: url.to_string(),
            options,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: self.inner.config.max_attempts,
            error: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            finished_at: None,
        };
        let job_id = job.id.clone();
        jobs.insert(job_id.clone(), job);
        by_hash.insert(hash.to_string(), job_id.clone());
        drop(by_hash);
        drop(jobs);

        let queue_position = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.push_back(job_id.clone());
            pending.len() - 1
        };
        // notify_one leaves a permit when no worker is parked yet, so the
        // wakeup cannot be lost
        self.inner.notify.notify_one();

        SubmitOutcome {
            job_id,
            queue_position,
            coalesced: false,
        }
    }

    fn position_of(&self, job_id: &str) -> usize {
        let pending = self.inner.pending.lock().unwrap();
        pending
            .iter()
            .position(|id| id == job_id)
            .unwrap_or(0)
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.read().await.get(job_id).cloned()
    }

    /// Job currently owning a hash, if any
    pub async fn job_for_hash(&self, hash: &str) -> Option<Job> {
        let job_id = {
            let by_hash = self.inner.active_by_hash.read().await;
            by_hash.get(hash).cloned()
        }?;
        self.get_job(&job_id).await
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    pub async fn jobs_len(&self) -> usize {
        self.inner.jobs.read().await.len()
    }

    /// Spawn the worker pool
    pub fn start(&self, runner: JobRunner) {
        for worker_id in 0..self.inner.config.worker_concurrency.max(1) {
            let queue = self.clone();
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                queue.worker_loop(worker_id, runner).await;
            });
        }
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.notify.notify_waiters();
    }

    async fn worker_loop(&self, worker_id: usize, runner: JobRunner) {
        loop {
            let job_id = match self.next_pending().await {
                Some(id) => id,
                None => return,
            };

            let job = match self.get_job(&job_id).await {
                Some(job) => job,
                None => continue,
            };

            self.inner.admission.admit().await;

            let lock_key = format!("processing:{}", job.hash);
            if !self
                .inner
                .locks
                .try_acquire(&lock_key, &job.id, self.inner.config.lock_ttl)
            {
                // Another worker owns this hash; submitters were already
                // pointed at its job
                tracing::warn!(worker = worker_id, hash = %job.hash, "lock held, dropping job");
                self.finish_job(&job.id, &job.hash, JobState::Failed, Some(
                    "Outro processamento em andamento para esta playlist".to_string(),
                ))
                .await;
                continue;
            }

            self.run_with_retry(worker_id, &job, &runner).await;
            self.inner.locks.release(&lock_key);
        }
    }

    async fn run_with_retry(&self, worker_id: usize, job: &Job, runner: &JobRunner) {
        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(entry) = jobs.get_mut(&job.id) {
                entry.state = JobState::Active;
            }
        }

        let max_attempts = self.inner.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            {
                let mut jobs = self.inner.jobs.write().await;
                if let Some(entry) = jobs.get_mut(&job.id) {
                    entry.attempts_made = attempt;
                }
            }

            tracing::info!(worker = worker_id, hash = %job.hash, attempt, "job started");
            let result = runner(job.clone()).await;

            match result {
                Ok(()) => {
                    tracing::info!(worker = worker_id, hash = %job.hash, "job completed");
                    self.finish_job(&job.id, &job.hash, JobState::Completed, None)
                        .await;
                    return;
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    // 5s, 10s, 20s by default
                    let backoff =
                        Duration::from_millis(self.inner.config.retry_base_ms << (attempt - 1));
                    tracing::warn!(
                        worker = worker_id,
                        hash = %job.hash,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!(worker = worker_id, hash = %job.hash, error = %e, "job failed");
                    self.finish_job(&job.id, &job.hash, JobState::Failed, Some(e.to_string()))
                        .await;
                    return;
                }
            }
        }
    }

    async fn finish_job(&self, job_id: &str, hash: &str, state: JobState, error: Option<String>) {
        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(entry) = jobs.get_mut(job_id) {
                entry.state = state;
                entry.error = error;
                entry.finished_at = Some(chrono::Utc::now().timestamp_millis());
            }
        }
        let mut by_hash = self.inner.active_by_hash.write().await;
        if by_hash.get(hash).map(|id| id == job_id).unwrap_or(false) {
            by_hash.remove(hash);
        }
    }

    async fn next_pending(&self) -> Option<String> {
        loop {
            if self.inner.cancel.is_cancelled() {
                return None;
            }
            {
                let mut pending = self.inner.pending.lock().unwrap();
                if let Some(id) = pending.pop_front() {
                    return Some(id);
                }
            }
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = self.inner.cancel.cancelled() => return None,
            }
        }
    }

    /// Retention sweep: completed jobs kept 24h capped at 1000, failed jobs
    /// kept 7 days
    pub async fn sweep_retention(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let cfg = &self.inner.config;
        let mut jobs = self.inner.jobs.write().await;
        let before = jobs.len();

        jobs.retain(|_, job| match job.state {
            JobState::Completed => job
                .finished_at
                .map(|t| now - t < cfg.completed_retention_ms)
                .unwrap_or(true),
            JobState::Failed => job
                .finished_at
                .map(|t| now - t < cfg.failed_retention_ms)
                .unwrap_or(true),
            _ => true,
        });

        // Cap completed jobs, oldest out first
        let mut completed: Vec<(String, i64)> = jobs
            .iter()
            .filter(|(_, j)| j.state == JobState::Completed)
            .map(|(id, j)| (id.clone(), j.finished_at.unwrap_or(j.created_at)))
            .collect();
        if completed.len() > cfg.completed_retention_cap {
            completed.sort_by_key(|(_, t)| *t);
            let excess = completed.len() - cfg.completed_retention_cap;
            for (id, _) in completed.into_iter().take(excess) {
                jobs.remove(&id);
            }
        }

        before - jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> QueueConfig {
        QueueConfig {
            worker_concurrency: 2,
            retry_base_ms: 10,
            rate_limit_max: 100,
            rate_limit_window: Duration::from_millis(50),
            ..QueueConfig::default()
        }
    }

    async fn wait_for_state(queue: &JobQueue, job_id: &str, state: JobState) -> Job {
        for _ in 0..200 {
            if let Some(job) = queue.get_job(job_id).await {
                if job.state == state {
                    return job;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {:?}", job_id, state);
    }

    #[test]
    fn test_lock_set_if_absent() {
        let locks = LockManager::new();
        let ttl = Duration::from_secs(60);

        assert!(locks.try_acquire("processing:h1", "job-a", ttl));
        assert!(!locks.try_acquire("processing:h1", "job-b", ttl));
        assert_eq!(locks.holder("processing:h1"), Some("job-a".to_string()));

        locks.release("processing:h1");
        assert!(locks.try_acquire("processing:h1", "job-b", ttl));
    }

    #[test]
    fn test_lock_ttl_expiry() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("processing:h1", "dead-job", Duration::ZERO));
        // Expired lock is free for the taking
        assert!(locks.try_acquire("processing:h1", "job-b", Duration::from_secs(60)));
        assert_eq!(locks.holder("processing:h1"), Some("job-b".to_string()));
    }

    #[tokio::test]
    async fn test_submit_dedupe_returns_same_job() {
        let queue = JobQueue::new(test_config());
        let first = queue
            .submit("hash1", "http://x/list.m3u", ParseOptions::default())
            .await;
        let second = queue
            .submit("hash1", "http://x/list.m3u", ParseOptions::default())
            .await;

        assert!(!first.coalesced);
        assert!(second.coalesced);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(queue.pending_len(), 1);

        // A different URL string is a different hash, thus a new job
        let other = queue
            .submit("hash2", "http://x/list.m3u?b=2&a=1", ParseOptions::default())
            .await;
        assert!(!other.coalesced);
        assert_ne!(other.job_id, first.job_id);
    }

    #[tokio::test]
    async fn test_worker_completes_job() {
        let queue = JobQueue::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let runner: JobRunner = Arc::new(move |_job| {
            let calls = Arc::clone(&calls_clone);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        queue.start(runner);

        let outcome = queue
            .submit("hash1", "http://x/a.m3u", ParseOptions::default())
            .await;
        let job = wait_for_state(&queue, &outcome.job_id, JobState::Completed).await;

        assert_eq!(job.attempts_made, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Terminal job releases the hash for resubmission
        assert!(queue.job_for_hash("hash1").await.is_none());
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_transient_failure_retries() {
        let queue = JobQueue::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let runner: JobRunner = Arc::new(move |_job| {
            let calls = Arc::clone(&calls_clone);
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ParseError::Timeout)
                } else {
                    Ok(())
                }
            })
        });
        queue.start(runner);

        let outcome = queue
            .submit("hash1", "http://x/a.m3u", ParseOptions::default())
            .await;
        let job = wait_for_state(&queue, &outcome.job_id, JobState::Completed).await;

        assert_eq!(job.attempts_made, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_retry() {
        let queue = JobQueue::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let runner: JobRunner = Arc::new(move |_job| {
            let calls = Arc::clone(&calls_clone);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ParseError::HttpStatus {
                    status: 404,
                    message: "Playlist não encontrada (404). Verifique a URL.".to_string(),
                })
            })
        });
        queue.start(runner);

        let outcome = queue
            .submit("hash1", "http://x/missing.m3u", ParseOptions::default())
            .await;
        let job = wait_for_state(&queue, &outcome.job_id, JobState::Failed).await;

        assert_eq!(job.attempts_made, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(job.error.unwrap().contains("404"));
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let mut config = test_config();
        config.completed_retention_ms = 0;
        let queue = JobQueue::new(config);

        let runner: JobRunner = Arc::new(|_job| Box::pin(async { Ok(()) }));
        queue.start(runner);

        let outcome = queue
            .submit("hash1", "http://x/a.m3u", ParseOptions::default())
            .await;
        wait_for_state(&queue, &outcome.job_id, JobState::Completed).await;

        // Zero retention drops the completed job immediately
        sleep(Duration::from_millis(5)).await;
        let removed = queue.sweep_retention().await;
        assert_eq!(removed, 1);
        assert!(queue.get_job(&outcome.job_id).await.is_none());
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_admission_window_throttles() {
        let window = AdmissionWindow::new(2, Duration::from_millis(60));
        let start = Instant::now();
        window.admit().await;
        window.admit().await;
        assert!(start.elapsed() < Duration::from_millis(40));
        // Third start must wait for the window to slide
        window.admit().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
