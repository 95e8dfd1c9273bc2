use chrono::{DateTime, NaiveDate, Utc};
use hdrhistogram::Histogram;
use uuid::Uuid;

use super::report::{LatencySummary, LiveEndpoint};
use super::RequestEvent;
use crate::store::{average_ms, success_ratio, DailyTelemetryRecord};

/// HdrHistogram range: 1 ms → 1 h, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 3_600_000;
const HIST_SIGFIG: u8 = 3;

/// Running summary of one endpoint since the last flush.
///
/// Owned and mutated by the aggregator task only. `min_duration_ms` is
/// `None` exactly when `count == 0`, so a genuine 0 ms request is a valid
/// minimum rather than "unset".
#[derive(Debug, Clone)]
pub struct EndpointAggregate {
    count: u64,
    success_count: u64,
    total_duration_ms: u64,
    min_duration_ms: Option<u64>,
    max_duration_ms: u64,
    last_observed_at: Option<DateTime<Utc>>,
    latency: Histogram<u64>,
}

impl EndpointAggregate {
    pub fn new() -> Self {
        Self {
            count: 0,
            success_count: 0,
            total_duration_ms: 0,
            min_duration_ms: None,
            max_duration_ms: 0,
            last_observed_at: None,
            latency: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                .expect("histogram creation"),
        }
    }

    pub fn observe(&mut self, event: &RequestEvent) {
        let ms = event.duration_ms;

        self.count += 1;
        if event.success {
            self.success_count += 1;
        }
        self.total_duration_ms = self.total_duration_ms.saturating_add(ms);
        self.min_duration_ms = Some(self.min_duration_ms.map_or(ms, |min| min.min(ms)));
        self.max_duration_ms = self.max_duration_ms.max(ms);
        self.last_observed_at = Some(event.observed_at);

        // Histogram is clamped to its trackable range; counters above are exact
        self.latency.saturating_record(ms.max(HIST_LOW));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn min_duration_ms(&self) -> Option<u64> {
        self.min_duration_ms
    }

    pub fn max_duration_ms(&self) -> u64 {
        self.max_duration_ms
    }

    /// Persistable partial aggregate for `day`.
    pub fn to_record(&self, endpoint: &str, day: NaiveDate, now: DateTime<Utc>) -> DailyTelemetryRecord {
        DailyTelemetryRecord {
            id: Uuid::new_v4(),
            day,
            endpoint: endpoint.to_string(),
            request_count: self.count,
            success_count: self.success_count,
            total_duration_ms: self.total_duration_ms,
            avg_duration_ms: average_ms(self.total_duration_ms, self.count),
            min_duration_ms: self.min_duration_ms.unwrap_or(0),
            max_duration_ms: self.max_duration_ms,
            success_ratio: success_ratio(self.success_count, self.count),
            created_at: now,
        }
    }

    pub fn live_view(&self, endpoint: &str) -> LiveEndpoint {
        LiveEndpoint {
            name: endpoint.to_string(),
            request_count: self.count,
            success_count: self.success_count,
            avg_duration_ms: average_ms(self.total_duration_ms, self.count),
            min_duration_ms: self.min_duration_ms,
            max_duration_ms: self.max_duration_ms,
            latency: self.latency_summary(),
            last_observed_at: self.last_observed_at,
        }
    }

    fn latency_summary(&self) -> LatencySummary {
        if self.latency.is_empty() {
            return LatencySummary::default();
        }
        LatencySummary {
            p50: self.latency.value_at_quantile(0.50),
            p95: self.latency.value_at_quantile(0.95),
            p99: self.latency.value_at_quantile(0.99),
            max: self.latency.max(),
            mean: self.latency.mean(),
        }
    }
}

impl Default for EndpointAggregate {
    fn default() -> Self {
        Self::new()
    }
}
