//! Process-level configuration with environment overrides.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: f64) -> Duration {
    Duration::from_secs_f64(env_parse(key, default_secs))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// All bridge tunables. Every field can be overridden by the environment
/// variable of the same (upper-case) name.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Synthetic sample period (`MOCK_DATA_INTERVAL`, seconds).
    pub mock_interval: Duration,
    /// Database batch flush period (`DB_BATCH_INTERVAL`).
    pub db_batch_interval: Duration,
    /// Records per database insert (`MAX_BATCH_SIZE`).
    pub max_batch_size: usize,
    /// Database retry backoff floor/cap (`RETRY_BASE_BACKOFF`, `RETRY_BACKOFF_MAX`).
    pub retry_base_backoff: Duration,
    pub retry_backoff_max: Duration,
    /// Pending retry batches retained before the oldest is shed.
    pub retry_queue_cap: usize,

    pub connection_timeout: Duration,
    pub watchdog_timeout: Duration,
    pub health_check_interval: Duration,
    pub stats_interval: Duration,

    /// Republish queue cap (`MAX_QUEUE_SIZE`), drop-oldest on overflow.
    pub max_queue_size: usize,

    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,

    /// Token-bucket refill rate, messages/s (`PUBLISH_RATE_LIMIT`).
    pub publish_rate_limit: f64,
    pub publish_burst_capacity: usize,
    pub publish_queue_max_size: usize,
    pub publish_drain_interval: Duration,

    pub spool_dir: PathBuf,
    pub export_dir: PathBuf,

    /// Realtime transport endpoint and channel names.
    pub redis_url: String,
    pub source_channel: String,
    pub dashboard_channel: String,

    /// Database endpoint; `None` disables uploads (batches queue, and the
    /// journal is exported on shutdown).
    pub supabase_url: Option<String>,
    pub supabase_api_key: String,
    pub supabase_table: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mock_interval: env_secs("MOCK_DATA_INTERVAL", 0.2),
            db_batch_interval: env_secs("DB_BATCH_INTERVAL", 9.0),
            max_batch_size: env_parse("MAX_BATCH_SIZE", 200),
            retry_base_backoff: env_secs("RETRY_BASE_BACKOFF", 3.0),
            retry_backoff_max: env_secs("RETRY_BACKOFF_MAX", 60.0),
            retry_queue_cap: env_parse("RETRY_QUEUE_CAP", 500),
            connection_timeout: env_secs("CONNECTION_TIMEOUT", 15.0),
            watchdog_timeout: env_secs("WATCHDOG_TIMEOUT", 30.0),
            health_check_interval: env_secs("HEALTH_CHECK_INTERVAL", 10.0),
            stats_interval: env_secs("STATS_INTERVAL", 30.0),
            max_queue_size: env_parse("MAX_QUEUE_SIZE", 5000),
            reconnect_max_attempts: env_parse("RECONNECT_MAX_ATTEMPTS", 10),
            reconnect_base_delay: env_secs("RECONNECT_BASE_DELAY", 1.0),
            publish_rate_limit: env_parse("PUBLISH_RATE_LIMIT", 500.0),
            publish_burst_capacity: env_parse("PUBLISH_BURST_CAPACITY", 100),
            publish_queue_max_size: env_parse("PUBLISH_QUEUE_MAX_SIZE", 10_000),
            publish_drain_interval: env_secs("PUBLISH_DRAIN_INTERVAL", 0.002),
            spool_dir: PathBuf::from(env_string("SPOOL_DIR", "./spool")),
            export_dir: PathBuf::from(env_string("EXPORT_DIR", "./export")),
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            source_channel: env_string("SOURCE_CHANNEL", "vehicle-telemetry"),
            dashboard_channel: env_string("DASHBOARD_CHANNEL", "telemetry-dashboard"),
            supabase_url: std::env::var("SUPABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            supabase_api_key: env_string("SUPABASE_API_KEY", ""),
            supabase_table: env_string("SUPABASE_TABLE", "telemetry"),
        }
    }
}
