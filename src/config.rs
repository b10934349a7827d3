use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub port: u16,
    pub node_env: String,
    pub base_url: String,

    // Fetch / parsing
    pub max_playlist_size_mb: usize,
    pub fetch_timeout_ms: u64,
    pub max_retries: u32,
    pub user_agent: String,

    // Cache
    pub cache_dir: String,
    pub cache_ttl_days: i64,

    // Job queue
    pub worker_concurrency: usize,
    pub rate_limit_max: usize,
    pub rate_limit_window_ms: u64,
    pub lock_ttl_seconds: u64,

    // Batch tiers (items per flush)
    pub batch_size_tier_tv: usize,
    pub batch_size_tier_mobile: usize,
    pub batch_size_tier_desktop: usize,

    // Fuzzy series merge
    pub fuzzy_similarity_threshold: f64,
    pub fuzzy_max_comparisons_per_singleton: usize,
    pub fuzzy_max_singletons: usize,

    // Query
    pub max_items_page: usize,

    // Maintenance
    pub sweep_interval_secs: u64,
    pub admin_key: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            // Server
            port: env_parse("PORT", 3001),
            node_env: env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string()),
            base_url: env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3001".to_string()),

            // Fetch / parsing
            max_playlist_size_mb: env_parse("MAX_PLAYLIST_SIZE_MB", 1000),
            fetch_timeout_ms: env_parse("FETCH_TIMEOUT_MS", 1_800_000), // 30 minutes
            max_retries: env_parse("MAX_RETRIES", 3),
            // VLC user agent avoids IPTV server blocks
            user_agent: env::var("USER_AGENT")
                .unwrap_or_else(|_| "VLC/3.0.20 LibVLC/3.0.20".to_string()),

            // Cache
            cache_dir: env::var("CACHE_DIR").unwrap_or_else(|_| ".parse-cache".to_string()),
            cache_ttl_days: env_parse("CACHE_TTL_DAYS", 7),

            // Job queue
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 2),
            rate_limit_max: env_parse("RATE_LIMIT_MAX", 10),
            rate_limit_window_ms: env_parse("RATE_LIMIT_WINDOW_MS", 60_000),
            lock_ttl_seconds: env_parse("LOCK_TTL_SECONDS", 1800),

            // Batch tiers
            batch_size_tier_tv: env_parse("BATCH_SIZE_TIER_TV", 250),
            batch_size_tier_mobile: env_parse("BATCH_SIZE_TIER_MOBILE", 400),
            batch_size_tier_desktop: env_parse("BATCH_SIZE_TIER_DESKTOP", 1000),

            // Fuzzy series merge
            fuzzy_similarity_threshold: env_parse("FUZZY_SIMILARITY_THRESHOLD", 0.85),
            fuzzy_max_comparisons_per_singleton: env_parse(
                "FUZZY_MAX_COMPARISONS_PER_SINGLETON",
                50,
            ),
            fuzzy_max_singletons: env_parse("FUZZY_MAX_SINGLETONS", 5000),

            // Query
            max_items_page: env_parse("MAX_ITEMS_PAGE", 5000),

            // Maintenance
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", 86_400), // daily
            admin_key: env::var("ADMIN_KEY").ok().filter(|k| !k.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_env();
        assert!(config.worker_concurrency >= 1);
        assert!(config.fuzzy_similarity_threshold > 0.0);
        assert!(config.max_playlist_size_mb > 0);
    }
}
