pub mod redis_store;
pub mod sqlite_store;

pub use redis_store::RedisStore;
pub use sqlite_store::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;

/// Success ratios are persisted with four decimal places.
pub const RATIO_SCALE: f64 = 10_000.0;

// ─── Persisted row ───────────────────────────────────────────────

/// One merged daily summary, keyed by `(day, endpoint)`.
///
/// `success_count` and `total_duration_ms` are kept alongside the derived
/// average and ratio so repeated merges stay exact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTelemetryRecord {
    /// Surrogate id, never used to resolve conflicts.
    pub id: Uuid,
    pub day: NaiveDate,
    pub endpoint: String,
    pub request_count: u64,
    pub success_count: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub success_ratio: f64,
    pub created_at: DateTime<Utc>,
}

impl DailyTelemetryRecord {
    /// Fold `incoming` into `self` (stored) following the merge contract.
    /// Identity (`id`, `created_at`) stays with the stored row.
    pub fn merged_with(&self, incoming: &DailyTelemetryRecord) -> DailyTelemetryRecord {
        let request_count = self.request_count + incoming.request_count;
        let success_count = self.success_count + incoming.success_count;
        let total_duration_ms = self.total_duration_ms + incoming.total_duration_ms;

        let min_duration_ms = if self.request_count == 0 {
            incoming.min_duration_ms
        } else {
            self.min_duration_ms.min(incoming.min_duration_ms)
        };

        DailyTelemetryRecord {
            id: self.id,
            day: self.day,
            endpoint: self.endpoint.clone(),
            request_count,
            success_count,
            total_duration_ms,
            avg_duration_ms: average_ms(total_duration_ms, request_count),
            min_duration_ms,
            max_duration_ms: self.max_duration_ms.max(incoming.max_duration_ms),
            success_ratio: success_ratio(success_count, request_count),
            created_at: self.created_at,
        }
    }
}

/// Integer average, 0 for an empty count.
pub fn average_ms(total_ms: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        total_ms / count
    }
}

/// `successes / count` rounded to the stored precision, 0 for an empty count.
pub fn success_ratio(successes: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (successes as f64 / count as f64 * RATIO_SCALE).round() / RATIO_SCALE
}

// ─── Storage boundary ────────────────────────────────────────────

/// Durable merge store for daily telemetry.
///
/// `merge_batch` applies a whole batch atomically: each record is
/// inserted if `(day, endpoint)` is new, otherwise combined additively
/// with the stored row. `obtain_by_day` is a pure read ordered by
/// endpoint name.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn merge_batch(&self, records: &[DailyTelemetryRecord]) -> Result<(), StoreError>;

    async fn obtain_by_day(&self, day: NaiveDate) -> Result<Vec<DailyTelemetryRecord>, StoreError>;

    /// Short backend name for logs and `/health`.
    fn backend(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) fn sample_record(endpoint: &str, day: NaiveDate) -> DailyTelemetryRecord {
    DailyTelemetryRecord {
        id: Uuid::new_v4(),
        day,
        endpoint: endpoint.to_string(),
        request_count: 2,
        success_count: 1,
        total_duration_ms: 300,
        avg_duration_ms: 150,
        min_duration_ms: 100,
        max_duration_ms: 200,
        success_ratio: 0.5,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    #[test]
    fn merge_is_additive_not_overwrite() {
        let stored = sample_record("GET /simulacoes", day());
        let incoming = sample_record("GET /simulacoes", day());

        let merged = stored.merged_with(&incoming);
        assert_eq!(merged.request_count, 4);
        assert_eq!(merged.min_duration_ms, 100);
        assert_eq!(merged.max_duration_ms, 200);
        assert_eq!(merged.avg_duration_ms, 150);
        assert_eq!(merged.success_ratio, 0.5);
        assert_eq!(merged.id, stored.id);
    }

    #[test]
    fn merge_weights_by_count() {
        let stored = sample_record("POST /simulacoes", day());
        let incoming = DailyTelemetryRecord {
            request_count: 6,
            success_count: 6,
            total_duration_ms: 300,
            avg_duration_ms: 50,
            min_duration_ms: 20,
            max_duration_ms: 90,
            success_ratio: 1.0,
            ..sample_record("POST /simulacoes", day())
        };

        let merged = stored.merged_with(&incoming);
        assert_eq!(merged.request_count, 8);
        // (150*2 + 50*6) / 8
        assert_eq!(merged.avg_duration_ms, 75);
        assert_eq!(merged.min_duration_ms, 20);
        assert_eq!(merged.max_duration_ms, 200);
        // (0.5*2 + 1.0*6) / 8
        assert_eq!(merged.success_ratio, 0.875);
    }

    #[test]
    fn empty_stored_row_takes_incoming_min() {
        let stored = DailyTelemetryRecord {
            request_count: 0,
            success_count: 0,
            total_duration_ms: 0,
            avg_duration_ms: 0,
            min_duration_ms: 0,
            max_duration_ms: 0,
            success_ratio: 0.0,
            ..sample_record("GET /produtos", day())
        };
        let merged = stored.merged_with(&sample_record("GET /produtos", day()));
        assert_eq!(merged.min_duration_ms, 100);
    }

    #[test]
    fn ratio_rounds_to_four_places() {
        assert_eq!(success_ratio(1, 3), 0.3333);
        assert_eq!(success_ratio(2, 3), 0.6667);
        assert_eq!(success_ratio(0, 0), 0.0);
        assert_eq!(average_ms(10, 0), 0);
    }
}
