use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::store::DailyTelemetryRecord;

// ─── Query response ──────────────────────────────────────────────

/// Merged daily telemetry for one day, as returned by `GET /telemetria`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub day: NaiveDate,
    pub endpoints: Vec<EndpointTelemetry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointTelemetry {
    pub name: String,
    pub request_count: u64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub success_ratio: f64,
}

impl From<DailyTelemetryRecord> for EndpointTelemetry {
    fn from(r: DailyTelemetryRecord) -> Self {
        Self {
            name: r.endpoint,
            request_count: r.request_count,
            avg_duration_ms: r.avg_duration_ms,
            min_duration_ms: r.min_duration_ms,
            max_duration_ms: r.max_duration_ms,
            success_ratio: r.success_ratio,
        }
    }
}

// ─── Flush bookkeeping ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Interval,
    BatchCeiling,
    Requested,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlushOutcome {
    /// Nothing aggregated since the last flush; storage was not touched.
    Skipped,
    Persisted { attempts: usize },
    /// Every attempt failed and the batch was discarded.
    Dropped { attempts: usize },
}

/// What one flush did. Flush requests are resolved with this.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    pub endpoints: usize,
    pub events: u64,
    pub outcome: FlushOutcome,
    pub finished_at: DateTime<Utc>,
}

impl FlushReport {
    pub(crate) fn skipped(trigger: FlushTrigger) -> Self {
        Self {
            trigger,
            endpoints: 0,
            events: 0,
            outcome: FlushOutcome::Skipped,
            finished_at: Utc::now(),
        }
    }

    pub fn persisted(&self) -> bool {
        matches!(self.outcome, FlushOutcome::Persisted { .. })
    }
}

// ─── Live (un-flushed) view ──────────────────────────────────────

/// In-memory state of the aggregator at one instant. Counts only cover
/// events since the last flush.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSnapshot {
    pub taken_at: DateTime<Utc>,
    pub pending_events: u64,
    pub dropped_events: u64,
    pub endpoints: Vec<LiveEndpoint>,
    pub last_flush: Option<FlushReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEndpoint {
    pub name: String,
    pub request_count: u64,
    pub success_count: u64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: u64,
    pub latency: LatencySummary,
    pub last_observed_at: Option<DateTime<Utc>>,
}

/// Percentile breakdown (ms) taken from the endpoint's HDR histogram.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LatencySummary {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
    pub mean: f64,
}
