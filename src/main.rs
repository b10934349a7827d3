mod config;
mod error;
mod models;
mod routes;
mod services;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::services::{
    cache::CacheStore,
    cleanup::start_sweep_task,
    ingest::{make_runner, IngestPipeline},
    job_queue::{JobQueue, QueueConfig},
    progress::ProgressTracker,
};

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub cache: CacheStore,
    pub queue: JobQueue,
    pub progress: ProgressTracker,
    pub start_time: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canalbox_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Load configuration
    let config = Config::from_env();
    let port = config.port;

    tracing::info!("Starting CanalBox Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.node_env);

    // Content-addressed cache (runs the startup recovery scan)
    let cache = CacheStore::new(&config.cache_dir, config.cache_ttl_days).await?;
    tracing::info!("Cache initialized: {}", config.cache_dir);

    // Progress reporter
    let progress = ProgressTracker::new();

    // Job queue with bounded workers
    let queue = JobQueue::new(QueueConfig {
        worker_concurrency: config.worker_concurrency,
        max_attempts: config.max_retries.max(1),
        lock_ttl: Duration::from_secs(config.lock_ttl_seconds),
        rate_limit_max: config.rate_limit_max,
        rate_limit_window: Duration::from_millis(config.rate_limit_window_ms),
        ..QueueConfig::default()
    });

    // Ingest pipeline feeding the workers
    let pipeline = Arc::new(IngestPipeline::new(
        &config,
        cache.clone(),
        progress.clone(),
    ));
    queue.start(make_runner(pipeline));
    tracing::info!(
        "Worker pool started (concurrency {})",
        config.worker_concurrency
    );

    // Background sweep (cache TTL, job retention, stale progress)
    tokio::spawn(start_sweep_task(
        cache.clone(),
        queue.clone(),
        progress.clone(),
        config.sweep_interval_secs,
    ));

    // Build application state
    let state = Arc::new(AppState {
        config,
        cache,
        queue,
        progress,
        start_time: Instant::now(),
    });

    // Build router
    let app = Router::new()
        // Health endpoints
        .route("/", get(routes::health::root))
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .route("/ready", get(routes::health::ready))
        .route("/live", get(routes::health::live))
        // Playlist submission and status
        .route("/api/playlist/parse", post(routes::playlist::parse_playlist))
        .route(
            "/api/playlist/:hash/status",
            get(routes::playlist::get_parse_status),
        )
        .route(
            "/api/playlist/:hash/validate",
            get(routes::playlist::validate_cache),
        )
        .route(
            "/api/playlist/:hash/stats",
            get(routes::playlist::get_stats),
        )
        .route(
            "/api/playlist/:hash/groups",
            get(routes::playlist::get_groups),
        )
        .route(
            "/api/playlist/:hash/series",
            get(routes::playlist::get_series),
        )
        .route(
            "/api/playlist/:hash/series/:series_id/episodes",
            get(routes::playlist::get_series_episodes),
        )
        .route(
            "/api/playlist/:hash/search",
            get(routes::playlist::search_items),
        )
        // Item reads
        .route(
            "/api/playlist/items/:hash",
            get(routes::playlist::get_items),
        )
        .route(
            "/api/playlist/items/:hash/preview",
            get(routes::playlist::get_preview),
        )
        .route(
            "/api/playlist/items/:hash/partial",
            get(routes::playlist::get_partial),
        )
        // Jobs
        .route("/api/jobs/:job_id", get(routes::jobs::get_job))
        // Admin (protected by ADMIN_KEY)
        .route(
            "/api/admin/playlist/:hash",
            delete(routes::admin::delete_playlist),
        )
        .route("/api/admin/stats", get(routes::admin::get_stats))
        .route("/api/admin/expired", delete(routes::admin::delete_expired))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
