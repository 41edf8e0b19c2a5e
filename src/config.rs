//! Application configuration
//!
//! Every tunable lives here as a plain struct with a `Default` carrying the
//! documented value and a `from_env()` override path. No config files.

use std::env;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Top-level application config
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub admin_addr: String,
    pub dlq_fallback_log: String,
    pub ingest: IngestConfig,
    pub circuit: CircuitBreakerConfig,
    pub outbox: OutboxConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "./trade_capture.db".to_string(),
            admin_addr: "127.0.0.1:8080".to_string(),
            dlq_fallback_log: "./dlq_fallback.log".to_string(),
            ingest: IngestConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            db_path: env::var("APP_DB_PATH").unwrap_or_else(|_| "./trade_capture.db".to_string()),
            admin_addr: env::var("APP_ADMIN_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            dlq_fallback_log: env::var("APP_DLQ_FALLBACK_LOG")
                .unwrap_or_else(|_| "./dlq_fallback.log".to_string()),
            ingest: IngestConfig::from_env(),
            circuit: CircuitBreakerConfig::from_env(),
            outbox: OutboxConfig::from_env(),
        }
    }
}

/// Ingest buffer / persister tuning
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Upper bound on items drained per flush
    pub max_batch_size: usize,
    /// Periodic flush cadence; the watchdog fires at half this interval
    pub flush_interval: Duration,
    /// Hard upper bound on in-flight messages
    pub buffer_capacity: usize,
    /// Buffer level at which the paused receiver is resumed
    pub resume_threshold: usize,
    /// Sleep between retries of the same batch while the circuit is open
    pub db_retry_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let capacity = 10_000;
        Self {
            max_batch_size: 500,
            flush_interval: Duration::from_millis(100),
            buffer_capacity: capacity,
            resume_threshold: capacity / 10,
            db_retry_backoff: Duration::from_millis(5_000),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let capacity = env_parse("APP_INGEST_BUFFER_CAPACITY", 10_000usize);
        Self {
            max_batch_size: env_parse("APP_INGEST_BATCH_MAX_SIZE", 500),
            flush_interval: Duration::from_millis(env_parse("APP_INGEST_FLUSH_INTERVAL_MS", 100)),
            buffer_capacity: capacity,
            resume_threshold: env_parse("APP_INGEST_RESUME_THRESHOLD", capacity / 10),
            db_retry_backoff: Duration::from_millis(env_parse("APP_DB_RETRY_BACKOFF_MS", 5_000)),
        }
    }
}

/// Database circuit breaker tuning
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Fraction of failures that trips the breaker once volume is reached
    pub failure_rate_threshold: f64,
    /// Minimum calls in the window before the rate is evaluated
    pub min_request_volume: u32,
    /// How long the breaker stays open before probing
    pub open_duration: Duration,
    /// Successful probes required to close from half-open
    pub half_open_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            min_request_volume: 10,
            open_duration: Duration::from_millis(30_000),
            half_open_trials: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Self {
        Self {
            failure_rate_threshold: env_parse("APP_DB_CIRCUIT_FAILURE_RATE", 0.5),
            min_request_volume: env_parse("APP_DB_CIRCUIT_MIN_VOLUME", 10),
            open_duration: Duration::from_millis(env_parse("APP_DB_CIRCUIT_OPEN_MS", 30_000)),
            half_open_trials: env_parse("APP_DB_CIRCUIT_HALF_OPEN_TRIALS", 3),
        }
    }
}

/// Outbox dispatcher tuning
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Adaptive sizer lower bound (also the reset value)
    pub min_batch: usize,
    /// Adaptive sizer upper bound
    pub max_batch: usize,
    /// Sizer latency target per iteration
    pub target_latency: Duration,
    /// First backoff after a system failure
    pub system_failure_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Blocking wait for the downstream acknowledgement
    pub send_timeout: Duration,
    /// Sleep when the fetch returns no work
    pub idle_sleep: Duration,
    /// Portfolio lease expiry, covers instances that die mid-iteration
    pub lease_ttl: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            min_batch: 10,
            max_batch: 2_000,
            target_latency: Duration::from_millis(200),
            system_failure_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(30_000),
            send_timeout: Duration::from_millis(5_000),
            idle_sleep: Duration::from_millis(50),
            lease_ttl: Duration::from_millis(30_000),
        }
    }
}

impl OutboxConfig {
    pub fn from_env() -> Self {
        Self {
            min_batch: env_parse("APP_OUTBOX_MIN_BATCH", 10),
            max_batch: env_parse("APP_OUTBOX_MAX_BATCH", 2_000),
            target_latency: Duration::from_millis(env_parse("APP_OUTBOX_TARGET_LATENCY_MS", 200)),
            system_failure_backoff: Duration::from_millis(env_parse(
                "APP_OUTBOX_SYSTEM_FAILURE_BACKOFF_MS",
                1_000,
            )),
            max_backoff: Duration::from_millis(env_parse("APP_OUTBOX_MAX_BACKOFF_MS", 30_000)),
            send_timeout: Duration::from_millis(env_parse("APP_OUTBOX_SEND_TIMEOUT_MS", 5_000)),
            idle_sleep: Duration::from_millis(env_parse("APP_OUTBOX_IDLE_SLEEP_MS", 50)),
            lease_ttl: Duration::from_millis(env_parse("APP_OUTBOX_LEASE_TTL_MS", 30_000)),
        }
    }
}
