use std::time::Duration;

use thiserror::Error;

/// Failures raised by a `TelemetryStore` backend.
///
/// These never reach the request path that produced an event; the flush
/// controller retries and then drops. Only the query path surfaces them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored row could not be decoded back into a record.
    #[error("corrupt telemetry row: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// One merge attempt did not finish within the attempt timeout.
    #[error("storage call did not finish within {0:?}")]
    Timeout(Duration),
}

/// Caller-visible failures of the telemetry facade.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The worker did not confirm the flush in time.
    #[error("telemetry flush did not complete within {0:?}")]
    FlushTimeout(Duration),

    /// The worker task is gone (shut down or crashed).
    #[error("telemetry pipeline is not running")]
    PipelineClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}
