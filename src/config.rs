use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::telemetry::RetryPolicy;

// ─── Top level ───────────────────────────────────────────────────

/// Layered configuration: struct defaults → optional TOML file →
/// `APP__SECTION__KEY` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;
        let config: Self = settings.try_deserialize()?;

        if config.telemetry.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "telemetry.queue_capacity must be at least 1".to_string(),
            ));
        }
        if config.telemetry.flush_interval_secs == 0 {
            return Err(ConfigError::Message(
                "telemetry.flush_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

// ─── Server ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".into()
}

// ─── Telemetry pipeline ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Bounded ingestion queue size (events + control messages).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Longest `record_async` will wait for queue space before dropping.
    #[serde(default = "default_enqueue_wait_ms")]
    pub enqueue_wait_ms: u64,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Flush as soon as this many events were aggregated since the last flush.
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,

    /// Upper bound on a query's wait for its flush to complete.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Requests under one of these paths (whole segments) are not recorded.
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl TelemetryConfig {
    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            path == prefix
                || path
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            enqueue_wait_ms: default_enqueue_wait_ms(),
            flush_interval_secs: default_flush_interval_secs(),
            max_batch_events: default_max_batch_events(),
            query_timeout_ms: default_query_timeout_ms(),
            excluded_paths: default_excluded_paths(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_queue_capacity() -> usize {
    65_536
}
fn default_enqueue_wait_ms() -> u64 {
    5
}
fn default_flush_interval_secs() -> u64 {
    30
}
fn default_max_batch_events() -> usize {
    2_000
}
fn default_query_timeout_ms() -> u64 {
    5_000
}
fn default_excluded_paths() -> Vec<String> {
    vec!["/telemetria".into()]
}

/// Backoff knobs for persisting a flushed batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter_pct: f64,
    /// Upper bound on a single storage call; a slower call counts as a
    /// failed attempt.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.max(1))
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.initial_delay_ms,
            self.max_delay_ms,
            self.jitter_pct,
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_pct: 0.0,
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}
fn default_initial_delay_ms() -> u64 {
    150
}
fn default_max_delay_ms() -> u64 {
    2_000
}
/// Three attempts plus backoff still fit inside the default query timeout.
fn default_attempt_timeout_ms() -> u64 {
    1_500
}

// ─── Storage ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}
fn default_sqlite_path() -> String {
    "telemetry.db".into()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".into()
}
