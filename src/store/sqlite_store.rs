use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{DailyTelemetryRecord, TelemetryStore};
use crate::error::StoreError;

// ─── Schema ──────────────────────────────────────────────────────

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS daily_telemetry (
    id                TEXT PRIMARY KEY,
    day               TEXT NOT NULL,
    endpoint          TEXT NOT NULL,
    request_count     INTEGER NOT NULL,
    success_count     INTEGER NOT NULL,
    total_duration_ms INTEGER NOT NULL,
    avg_duration_ms   INTEGER NOT NULL,
    min_duration_ms   INTEGER NOT NULL,
    max_duration_ms   INTEGER NOT NULL,
    success_ratio     REAL NOT NULL,
    created_at        TEXT NOT NULL,
    UNIQUE (day, endpoint)
);
CREATE INDEX IF NOT EXISTS idx_daily_telemetry_day ON daily_telemetry(day);
";

/// Insert-or-merge keyed on `(day, endpoint)`. Unqualified columns in the
/// UPDATE arm are the stored row, `excluded.*` the incoming one.
const UPSERT: &str = "
INSERT INTO daily_telemetry (
    id, day, endpoint, request_count, success_count, total_duration_ms,
    avg_duration_ms, min_duration_ms, max_duration_ms, success_ratio, created_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT (day, endpoint) DO UPDATE SET
    request_count     = request_count + excluded.request_count,
    success_count     = success_count + excluded.success_count,
    total_duration_ms = total_duration_ms + excluded.total_duration_ms,
    min_duration_ms   = CASE WHEN request_count = 0 THEN excluded.min_duration_ms
                             ELSE MIN(min_duration_ms, excluded.min_duration_ms) END,
    max_duration_ms   = MAX(max_duration_ms, excluded.max_duration_ms),
    avg_duration_ms   = CASE WHEN request_count + excluded.request_count = 0 THEN 0
                             ELSE (total_duration_ms + excluded.total_duration_ms)
                                  / (request_count + excluded.request_count) END,
    success_ratio     = CASE WHEN request_count + excluded.request_count = 0 THEN 0.0
                             ELSE ROUND(CAST(success_count + excluded.success_count AS REAL)
                                        / (request_count + excluded.request_count), 4) END
";

const SELECT_BY_DAY: &str = "
SELECT id, day, endpoint, request_count, success_count, total_duration_ms,
       avg_duration_ms, min_duration_ms, max_duration_ms, success_ratio, created_at
FROM daily_telemetry
WHERE day = ?1
ORDER BY endpoint
";

// ─── Store ───────────────────────────────────────────────────────

/// SQLite-backed merge store.
///
/// The connection sits behind a mutex and is only ever locked inside
/// `spawn_blocking`, never across an await point.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// File-backed store (WAL journal, busy timeout for concurrent writers).
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "sqlite telemetry store ready");
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database; used by tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

#[async_trait]
impl TelemetryStore for SqliteStore {
    async fn merge_batch(&self, records: &[DailyTelemetryRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = Arc::clone(&self.conn);
        let batch = records.to_vec();
        let merged = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            merge_in_transaction(&mut conn, &batch)
        })
        .await??;

        debug!(rows = merged, "sqlite batch merged");
        Ok(())
    }

    async fn obtain_by_day(&self, day: NaiveDate) -> Result<Vec<DailyTelemetryRecord>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let rows = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn.prepare_cached(SELECT_BY_DAY)?;
            let rows = stmt
                .query_map(params![day], record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;

        Ok(rows)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

/// One transaction per batch: any failing row rolls back the whole batch
/// (the transaction is dropped uncommitted).
fn merge_in_transaction(
    conn: &mut Connection,
    batch: &[DailyTelemetryRecord],
) -> Result<usize, rusqlite::Error> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(UPSERT)?;
        for r in batch {
            stmt.execute(params![
                r.id.to_string(),
                r.day,
                r.endpoint,
                r.request_count as i64,
                r.success_count as i64,
                r.total_duration_ms as i64,
                r.avg_duration_ms as i64,
                r.min_duration_ms as i64,
                r.max_duration_ms as i64,
                r.success_ratio,
                r.created_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(batch.len())
}

fn record_from_row(row: &Row<'_>) -> Result<DailyTelemetryRecord, rusqlite::Error> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let created_at: DateTime<Utc> = row.get(10)?;

    Ok(DailyTelemetryRecord {
        id,
        day: row.get(1)?,
        endpoint: row.get(2)?,
        request_count: row.get::<_, i64>(3)? as u64,
        success_count: row.get::<_, i64>(4)? as u64,
        total_duration_ms: row.get::<_, i64>(5)? as u64,
        avg_duration_ms: row.get::<_, i64>(6)? as u64,
        min_duration_ms: row.get::<_, i64>(7)? as u64,
        max_duration_ms: row.get::<_, i64>(8)? as u64,
        success_ratio: row.get(9)?,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sample_record;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    #[tokio::test]
    async fn first_merge_inserts_record_as_is() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = sample_record("GET /simulacoes", day());

        store.merge_batch(&[record.clone()]).await.unwrap();

        let rows = store.obtain_by_day(day()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, record.id);
        assert_eq!(rows[0].request_count, 2);
        assert_eq!(rows[0].avg_duration_ms, 150);
        assert_eq!(rows[0].success_ratio, 0.5);
    }

    #[tokio::test]
    async fn merging_same_batch_twice_doubles_counts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch = vec![sample_record("GET /simulacoes", day())];

        store.merge_batch(&batch).await.unwrap();
        let once = store.obtain_by_day(day()).await.unwrap();
        assert_eq!(once[0].request_count, 2);

        store.merge_batch(&batch).await.unwrap();
        let twice = store.obtain_by_day(day()).await.unwrap();
        assert_eq!(twice.len(), 1);
        let row = &twice[0];
        assert_eq!(row.request_count, 4);
        assert_eq!(row.success_count, 2);
        assert_eq!(row.min_duration_ms, 100);
        assert_eq!(row.max_duration_ms, 200);
        assert_eq!(row.avg_duration_ms, 150);
        assert_eq!(row.success_ratio, 0.5);
        // the surrogate id of the first insert survives
        assert_eq!(row.id, once[0].id);
    }

    #[tokio::test]
    async fn sql_merge_agrees_with_in_memory_merge() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stored = sample_record("POST /simulacoes", day());
        let incoming = DailyTelemetryRecord {
            request_count: 7,
            success_count: 3,
            total_duration_ms: 910,
            avg_duration_ms: 130,
            min_duration_ms: 40,
            max_duration_ms: 480,
            success_ratio: 0.4286,
            ..sample_record("POST /simulacoes", day())
        };

        store.merge_batch(&[stored.clone()]).await.unwrap();
        store.merge_batch(&[incoming.clone()]).await.unwrap();

        let expected = stored.merged_with(&incoming);
        let row = store.obtain_by_day(day()).await.unwrap().remove(0);
        assert_eq!(row.request_count, expected.request_count);
        assert_eq!(row.avg_duration_ms, expected.avg_duration_ms);
        assert_eq!(row.min_duration_ms, expected.min_duration_ms);
        assert_eq!(row.max_duration_ms, expected.max_duration_ms);
        assert_eq!(row.success_ratio, expected.success_ratio);
    }

    #[tokio::test]
    async fn rows_are_ordered_by_endpoint_and_scoped_to_day() {
        let store = SqliteStore::open_in_memory().unwrap();
        let other_day = day().succ_opt().unwrap();

        store
            .merge_batch(&[
                sample_record("POST /simulacoes", day()),
                sample_record("GET /produtos", day()),
                sample_record("GET /simulacoes", other_day),
            ])
            .await
            .unwrap();

        let names: Vec<_> = store
            .obtain_by_day(day())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.endpoint)
            .collect();
        assert_eq!(names, vec!["GET /produtos", "POST /simulacoes"]);
        assert_eq!(store.obtain_by_day(other_day).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_day_reads_as_empty_list() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.obtain_by_day(day()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_row_rolls_back_whole_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = sample_record("GET /simulacoes", day());
        store.merge_batch(&[first.clone()]).await.unwrap();

        // second row reuses the surrogate id under a different natural key
        let clash = DailyTelemetryRecord {
            id: first.id,
            ..sample_record("GET /telemetria-clash", day())
        };
        let result = store
            .merge_batch(&[sample_record("GET /produtos", day()), clash])
            .await;
        assert!(matches!(result, Err(StoreError::Sqlite(_))));

        let rows = store.obtain_by_day(day()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].endpoint, "GET /simulacoes");
        assert_eq!(rows[0].request_count, 2);
    }

    #[tokio::test]
    async fn file_backed_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.db");

        {
            let store = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
            store
                .merge_batch(&[sample_record("GET /simulacoes", day())])
                .await
                .unwrap();
        }

        let reopened = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
        let rows = reopened.obtain_by_day(day()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].max_duration_ms, 200);
    }
}
