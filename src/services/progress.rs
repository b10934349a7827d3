use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Parse phases, in pipeline order. `Failed` is reachable from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsePhase {
    Downloading,
    Parsing,
    Indexing,
    BuildingGroups,
    BuildingSeries,
    Complete,
    Failed,
}

impl ParsePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ParsePhase::Complete | ParsePhase::Failed)
    }
}

/// Per-hash progress snapshot, poll-friendly
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseProgress {
    pub current_phase: ParsePhase,
    pub items_parsed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_total: Option<u64>,
    pub groups_count: u64,
    pub series_count: u64,
    pub can_navigate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: i64,
    pub updated_at: i64,
}

impl ParseProgress {
    fn new() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            current_phase: ParsePhase::Downloading,
            items_parsed: 0,
            items_total: None,
            groups_count: 0,
            series_count: 0,
            can_navigate: false,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Coarse status string for the REST surface
    pub fn status(&self) -> &'static str {
        match self.current_phase {
            ParsePhase::Complete => "complete",
            ParsePhase::Failed => "failed",
            _ => "parsing",
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.started_at
    }
}

/// In-memory progress reporter. Snapshots are monotone per hash in
/// (phase, items_parsed); external callers only read.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, ParseProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Begin tracking a fresh parse, replacing any previous snapshot
    pub async fn start(&self, hash: &str) {
        let mut map = self.inner.write().await;
        map.insert(hash.to_string(), ParseProgress::new());
    }

    async fn update<F>(&self, hash: &str, apply: F)
    where
        F: FnOnce(&mut ParseProgress),
    {
        let mut map = self.inner.write().await;
        if let Some(progress) = map.get_mut(hash) {
            apply(progress);
            progress.updated_at = chrono::Utc::now().timestamp_millis();
        }
    }

    /// Advance the phase; backwards transitions are ignored
    pub async fn set_phase(&self, hash: &str, phase: ParsePhase) {
        self.update(hash, |p| {
            if phase > p.current_phase || phase == ParsePhase::Failed {
                p.current_phase = phase;
            }
        })
        .await;
    }

    pub async fn set_items_total(&self, hash: &str, total: Option<u64>) {
        self.update(hash, |p| p.items_total = total).await;
    }

    /// Refresh counters at a batch boundary
    pub async fn set_counts(&self, hash: &str, items: u64, groups: u64, series: u64) {
        self.update(hash, |p| {
            p.items_parsed = p.items_parsed.max(items);
            p.groups_count = groups;
            p.series_count = series;
        })
        .await;
    }

    /// Flip once >= 500 items are persisted and groups flushed at least once
    pub async fn set_can_navigate(&self, hash: &str) {
        self.update(hash, |p| p.can_navigate = true).await;
    }

    pub async fn complete(&self, hash: &str, items: u64, groups: u64, series: u64) {
        self.update(hash, |p| {
            p.current_phase = ParsePhase::Complete;
            p.items_parsed = p.items_parsed.max(items);
            p.items_total = Some(items);
            p.groups_count = groups;
            p.series_count = series;
            p.can_navigate = true;
        })
        .await;
    }

    pub async fn fail(&self, hash: &str, error: &str) {
        self.update(hash, |p| {
            p.current_phase = ParsePhase::Failed;
            p.error = Some(error.to_string());
        })
        .await;
    }

    pub async fn get(&self, hash: &str) -> Option<ParseProgress> {
        self.inner.read().await.get(hash).cloned()
    }

    /// Drop terminal snapshots older than `max_age_ms`
    pub async fn sweep(&self, max_age_ms: i64) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age_ms;
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, p| !(p.current_phase.is_terminal() && p.updated_at < cutoff));
        before - map.len()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_phase_is_monotone() {
        let tracker = ProgressTracker::new();
        tracker.start("h").await;
        tracker.set_phase("h", ParsePhase::Indexing).await;
        // Backwards transition ignored
        tracker.set_phase("h", ParsePhase::Downloading).await;
        assert_eq!(
            tracker.get("h").await.unwrap().current_phase,
            ParsePhase::Indexing
        );
        // Failure always wins
        tracker.set_phase("h", ParsePhase::Failed).await;
        assert_eq!(
            tracker.get("h").await.unwrap().current_phase,
            ParsePhase::Failed
        );
    }

    #[tokio::test]
    async fn test_counts_never_regress() {
        let tracker = ProgressTracker::new();
        tracker.start("h").await;
        tracker.set_counts("h", 1000, 5, 2).await;
        tracker.set_counts("h", 400, 6, 2).await;
        let p = tracker.get("h").await.unwrap();
        assert_eq!(p.items_parsed, 1000);
        assert_eq!(p.groups_count, 6);
    }

    #[tokio::test]
    async fn test_complete_and_status() {
        let tracker = ProgressTracker::new();
        tracker.start("h").await;
        assert_eq!(tracker.get("h").await.unwrap().status(), "parsing");
        tracker.complete("h", 100, 3, 1).await;
        let p = tracker.get("h").await.unwrap();
        assert_eq!(p.status(), "complete");
        assert!(p.can_navigate);
        assert_eq!(p.items_total, Some(100));
    }

    #[tokio::test]
    async fn test_sweep_drops_only_old_terminal() {
        let tracker = ProgressTracker::new();
        tracker.start("done").await;
        tracker.complete("done", 1, 0, 0).await;
        tracker.start("active").await;

        assert_eq!(tracker.sweep(-1).await, 1);
        assert!(tracker.get("done").await.is_none());
        assert!(tracker.get("active").await.is_some());
    }
}
