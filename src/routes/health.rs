use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref CACHE_ENTRIES: IntGauge = {
        let gauge = IntGauge::new("canalbox_cache_entries", "Cached playlists").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
    static ref CACHE_BYTES: IntGauge = {
        let gauge = IntGauge::new("canalbox_cache_bytes", "Cache directory size").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
    static ref PENDING_JOBS: IntGauge = {
        let gauge = IntGauge::new("canalbox_pending_jobs", "Jobs waiting for a worker").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
    static ref TRACKED_JOBS: IntGauge = {
        let gauge = IntGauge::new("canalbox_tracked_jobs", "Jobs in the registry").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
}

/// GET / - identity
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "CanalBox Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "runtime": "rust",
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MemoryStats {
    used_mb: u64,
    available_mb: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheStats {
    entries: usize,
    size_mb: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueStats {
    pending: usize,
    tracked: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    uptime: u64,
    memory: MemoryStats,
    cache: CacheStats,
    queue: QueueStats,
}

/// GET /health - liveness plus cache and queue stats
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();

    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let memory = MemoryStats {
        used_mb: sys.used_memory() / (1024 * 1024),
        available_mb: sys.available_memory() / (1024 * 1024),
    };

    let cache = CacheStats {
        entries: state.cache.entry_count().await,
        size_mb: state.cache.disk_usage_bytes().await as f64 / 1024.0 / 1024.0,
    };

    let queue = QueueStats {
        pending: state.queue.pending_len(),
        tracked: state.queue.jobs_len().await,
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime,
        memory,
        cache,
        queue,
    })
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    CACHE_ENTRIES.set(state.cache.entry_count().await as i64);
    CACHE_BYTES.set(state.cache.disk_usage_bytes().await as i64);
    PENDING_JOBS.set(state.queue.pending_len() as i64);
    TRACKED_JOBS.set(state.queue.jobs_len().await as i64);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (
        StatusCode::OK,
        String::from_utf8(buffer).unwrap_or_default(),
    )
}

/// GET /ready
pub async fn ready() -> impl IntoResponse {
    Json(serde_json::json!({ "ready": true }))
}

/// GET /live
pub async fn live() -> impl IntoResponse {
    Json(serde_json::json!({ "alive": true }))
}
