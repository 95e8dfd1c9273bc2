use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DailyTelemetryRecord, TelemetryStore};
use crate::error::StoreError;

// ─── Key layout ──────────────────────────────────────────────────
//
//   telemetry:{day}:row:{endpoint}    HASH  one merged row
//   telemetry:{day}:index             SET   endpoint names seen that day
//
// Rows live under their own `row:` segment so no endpoint name can land
// on the index key.

const KEY_PREFIX: &str = "telemetry";

/// Whole-batch merge. KEYS come in (row, day-index) pairs; ARGV carries
/// nine values per row: id, day, endpoint, count, successes, total, min,
/// max, created_at.
///
/// Scripts do not roll back, so everything that can fail is checked
/// before the first write: numeric arguments and the type of every key.
const MERGE_BATCH: &str = r#"
local n = #KEYS / 2
for i = 1, n do
  local base = (i - 1) * 9
  for j = 4, 8 do
    if tonumber(ARGV[base + j]) == nil then
      return redis.error_reply('non-numeric telemetry argument')
    end
  end
  local row_type = redis.call('TYPE', KEYS[2 * i - 1]).ok
  if row_type ~= 'none' and row_type ~= 'hash' then
    return redis.error_reply('telemetry row key holds a ' .. row_type)
  end
  local index_type = redis.call('TYPE', KEYS[2 * i]).ok
  if index_type ~= 'none' and index_type ~= 'set' then
    return redis.error_reply('telemetry index key holds a ' .. index_type)
  end
end

for i = 1, n do
  local row = KEYS[2 * i - 1]
  local index = KEYS[2 * i]
  local base = (i - 1) * 9
  local endpoint = ARGV[base + 3]
  local min_ms = tonumber(ARGV[base + 7])
  local max_ms = tonumber(ARGV[base + 8])

  local stored = tonumber(redis.call('HGET', row, 'request_count') or '0')
  if stored == 0 then
    redis.call('HSET', row,
      'id', ARGV[base + 1], 'day', ARGV[base + 2], 'endpoint', endpoint,
      'created_at', ARGV[base + 9],
      'min_duration_ms', min_ms, 'max_duration_ms', max_ms)
  else
    local stored_min = tonumber(redis.call('HGET', row, 'min_duration_ms'))
    local stored_max = tonumber(redis.call('HGET', row, 'max_duration_ms'))
    redis.call('HSET', row,
      'min_duration_ms', math.min(stored_min, min_ms),
      'max_duration_ms', math.max(stored_max, max_ms))
  end

  local c = redis.call('HINCRBY', row, 'request_count', ARGV[base + 4])
  local s = redis.call('HINCRBY', row, 'success_count', ARGV[base + 5])
  local t = redis.call('HINCRBY', row, 'total_duration_ms', ARGV[base + 6])
  local avg, ratio = 0, '0'
  if c > 0 then
    avg = math.floor(t / c)
    ratio = string.format('%.4f', s / c)
  end
  redis.call('HSET', row, 'avg_duration_ms', avg, 'success_ratio', ratio)
  redis.call('SADD', index, endpoint)
end
return n
"#;

/// Redis-backed merge store.
///
/// `ConnectionManager` is cheaply cloneable and reconnects on its own;
/// every call clones it rather than sharing a lock.
pub struct RedisStore {
    conn: ConnectionManager,
    merge: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("redis telemetry store ready");
        Ok(Self {
            conn,
            merge: Script::new(MERGE_BATCH),
        })
    }
}

#[async_trait]
impl TelemetryStore for RedisStore {
    async fn merge_batch(&self, records: &[DailyTelemetryRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut invocation = self.merge.prepare_invoke();
        for r in records {
            invocation
                .key(row_key(r.day, &r.endpoint))
                .key(index_key(r.day))
                .arg(r.id.to_string())
                .arg(r.day.to_string())
                .arg(&r.endpoint)
                .arg(r.request_count)
                .arg(r.success_count)
                .arg(r.total_duration_ms)
                .arg(r.min_duration_ms)
                .arg(r.max_duration_ms)
                .arg(r.created_at.to_rfc3339());
        }

        let mut conn = self.conn.clone();
        let merged: usize = invocation.invoke_async(&mut conn).await?;
        debug!(rows = merged, "redis batch merged");
        Ok(())
    }

    async fn obtain_by_day(&self, day: NaiveDate) -> Result<Vec<DailyTelemetryRecord>, StoreError> {
        let mut conn = self.conn.clone();

        let mut endpoints: Vec<String> = redis::cmd("SMEMBERS")
            .arg(index_key(day))
            .query_async(&mut conn)
            .await?;
        if endpoints.is_empty() {
            return Ok(Vec::new());
        }
        endpoints.sort();

        let mut pipe = redis::pipe();
        for endpoint in &endpoints {
            pipe.cmd("HGETALL").arg(row_key(day, endpoint));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        hashes.iter().map(record_from_hash).collect()
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

fn row_key(day: NaiveDate, endpoint: &str) -> String {
    format!("{KEY_PREFIX}:{day}:row:{endpoint}")
}

fn index_key(day: NaiveDate) -> String {
    format!("{KEY_PREFIX}:{day}:index")
}

fn record_from_hash(map: &HashMap<String, String>) -> Result<DailyTelemetryRecord, StoreError> {
    fn field<'a>(map: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StoreError> {
        map.get(name)
            .map(String::as_str)
            .ok_or_else(|| StoreError::Corrupt(format!("missing field '{name}'")))
    }
    fn number(map: &HashMap<String, String>, name: &str) -> Result<u64, StoreError> {
        field(map, name)?
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("field '{name}': {e}")))
    }

    let id = Uuid::parse_str(field(map, "id")?)
        .map_err(|e| StoreError::Corrupt(format!("field 'id': {e}")))?;
    let day = field(map, "day")?
        .parse::<NaiveDate>()
        .map_err(|e| StoreError::Corrupt(format!("field 'day': {e}")))?;
    let created_at = DateTime::parse_from_rfc3339(field(map, "created_at")?)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("field 'created_at': {e}")))?;
    let success_ratio = field(map, "success_ratio")?
        .parse::<f64>()
        .map_err(|e| StoreError::Corrupt(format!("field 'success_ratio': {e}")))?;

    Ok(DailyTelemetryRecord {
        id,
        day,
        endpoint: field(map, "endpoint")?.to_string(),
        request_count: number(map, "request_count")?,
        success_count: number(map, "success_count")?,
        total_duration_ms: number(map, "total_duration_ms")?,
        avg_duration_ms: number(map, "avg_duration_ms")?,
        min_duration_ms: number(map, "min_duration_ms")?,
        max_duration_ms: number(map, "max_duration_ms")?,
        success_ratio,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn stored_hash() -> HashMap<String, String> {
        [
            ("id", "6f1c1f5e-8f5b-4b52-9d43-2d1b1d0e7a11"),
            ("day", "2025-03-14"),
            ("endpoint", "GET /simulacoes"),
            ("created_at", "2025-03-14T12:00:00+00:00"),
            ("request_count", "4"),
            ("success_count", "2"),
            ("total_duration_ms", "600"),
            ("avg_duration_ms", "150"),
            ("min_duration_ms", "100"),
            ("max_duration_ms", "200"),
            ("success_ratio", "0.5000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn keys_are_scoped_by_day() {
        assert_eq!(
            row_key(day(), "GET /simulacoes"),
            "telemetry:2025-03-14:row:GET /simulacoes"
        );
        assert_eq!(index_key(day()), "telemetry:2025-03-14:index");
    }

    #[test]
    fn no_endpoint_name_maps_onto_the_index_key() {
        for name in ["endpoints", "index", "", ":index", "row"] {
            assert_ne!(row_key(day(), name), index_key(day()), "endpoint {name:?}");
        }
    }

    #[test]
    fn decodes_stored_hash() {
        let record = record_from_hash(&stored_hash()).unwrap();
        assert_eq!(record.day, day());
        assert_eq!(record.endpoint, "GET /simulacoes");
        assert_eq!(record.request_count, 4);
        assert_eq!(record.avg_duration_ms, 150);
        assert_eq!(record.success_ratio, 0.5);
    }

    #[test]
    fn missing_or_bad_fields_are_corrupt() {
        let mut map = stored_hash();
        map.remove("max_duration_ms");
        assert!(matches!(
            record_from_hash(&map),
            Err(StoreError::Corrupt(msg)) if msg.contains("max_duration_ms")
        ));

        let mut map = stored_hash();
        map.insert("request_count".into(), "lots".into());
        assert!(matches!(record_from_hash(&map), Err(StoreError::Corrupt(_))));
    }

    // ── against a live server ──
    //
    // Run with REDIS_URL=redis://127.0.0.1:6379/ set; skipped otherwise.
    // Each test writes under its own random day and removes it afterwards.

    use crate::store::sample_record;
    use rand::Rng;

    async fn live_store() -> Option<RedisStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(RedisStore::connect(&url).await.unwrap())
    }

    fn scratch_day() -> NaiveDate {
        let days = rand::thread_rng().gen_range(800_000..1_000_000);
        NaiveDate::from_num_days_from_ce_opt(days).unwrap()
    }

    async fn clear_day(store: &RedisStore, day: NaiveDate, endpoints: &[&str]) {
        let mut conn = store.conn.clone();
        let mut keys: Vec<String> = endpoints.iter().map(|e| row_key(day, e)).collect();
        keys.push(index_key(day));
        let _: () = redis::cmd("DEL").arg(keys).query_async(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn live_first_merge_inserts_record_as_is() {
        let Some(store) = live_store().await else { return };
        let day = scratch_day();
        let record = sample_record("GET /simulacoes", day);

        store.merge_batch(&[record.clone()]).await.unwrap();
        let rows = store.obtain_by_day(day).await.unwrap();
        clear_day(&store, day, &["GET /simulacoes"]).await;

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, record.id);
        assert_eq!(rows[0].request_count, 2);
        assert_eq!(rows[0].min_duration_ms, 100);
        assert_eq!(rows[0].max_duration_ms, 200);
        assert_eq!(rows[0].avg_duration_ms, 150);
        assert_eq!(rows[0].success_ratio, 0.5);
    }

    #[tokio::test]
    async fn live_merging_same_batch_twice_doubles_counts() {
        let Some(store) = live_store().await else { return };
        let day = scratch_day();
        let batch = vec![sample_record("GET /simulacoes", day)];

        store.merge_batch(&batch).await.unwrap();
        let once = store.obtain_by_day(day).await.unwrap();
        store.merge_batch(&batch).await.unwrap();
        let twice = store.obtain_by_day(day).await.unwrap();
        clear_day(&store, day, &["GET /simulacoes"]).await;

        assert_eq!(twice.len(), 1);
        let row = &twice[0];
        assert_eq!(row.request_count, 4);
        assert_eq!(row.success_count, 2);
        assert_eq!(row.min_duration_ms, 100);
        assert_eq!(row.max_duration_ms, 200);
        assert_eq!(row.avg_duration_ms, 150);
        assert_eq!(row.success_ratio, 0.5);
        assert_eq!(row.id, once[0].id);
    }

    #[tokio::test]
    async fn live_script_merge_agrees_with_in_memory_merge() {
        let Some(store) = live_store().await else { return };
        let day = scratch_day();
        let stored = sample_record("POST /simulacoes", day);
        let incoming = DailyTelemetryRecord {
            request_count: 7,
            success_count: 3,
            total_duration_ms: 910,
            avg_duration_ms: 130,
            min_duration_ms: 40,
            max_duration_ms: 480,
            success_ratio: 0.4286,
            ..sample_record("POST /simulacoes", day)
        };

        store.merge_batch(&[stored.clone()]).await.unwrap();
        store.merge_batch(&[incoming.clone()]).await.unwrap();
        let row = store.obtain_by_day(day).await.unwrap().remove(0);
        clear_day(&store, day, &["POST /simulacoes"]).await;

        let expected = stored.merged_with(&incoming);
        assert_eq!(row.request_count, expected.request_count);
        assert_eq!(row.success_count, expected.success_count);
        assert_eq!(row.avg_duration_ms, expected.avg_duration_ms);
        assert_eq!(row.min_duration_ms, expected.min_duration_ms);
        assert_eq!(row.max_duration_ms, expected.max_duration_ms);
        assert_eq!(row.success_ratio, expected.success_ratio);
    }

    #[tokio::test]
    async fn live_endpoint_names_never_collide_with_the_index() {
        let Some(store) = live_store().await else { return };
        let day = scratch_day();
        let names = ["endpoints", "index", "GET /simulacoes"];
        let batch: Vec<_> = names.iter().map(|n| sample_record(n, day)).collect();

        // Twice, so the second pass exercises the merge branch as well
        store.merge_batch(&batch).await.unwrap();
        store.merge_batch(&batch).await.unwrap();
        let rows = store.obtain_by_day(day).await.unwrap();
        clear_day(&store, day, &names).await;

        let got: Vec<_> = rows.iter().map(|r| (r.endpoint.as_str(), r.request_count)).collect();
        assert_eq!(got, vec![("GET /simulacoes", 4), ("endpoints", 4), ("index", 4)]);
    }

    #[tokio::test]
    async fn live_wrong_typed_key_rejects_batch_before_any_write() {
        let Some(store) = live_store().await else { return };
        let day = scratch_day();
        let mut conn = store.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(row_key(day, "POST /simulacoes"))
            .arg("not a hash")
            .query_async(&mut conn)
            .await
            .unwrap();

        let result = store
            .merge_batch(&[
                sample_record("GET /simulacoes", day),
                sample_record("POST /simulacoes", day),
            ])
            .await;
        let untouched: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(row_key(day, "GET /simulacoes"))
            .query_async(&mut conn)
            .await
            .unwrap();
        let rows = store.obtain_by_day(day).await.unwrap();
        clear_day(&store, day, &["GET /simulacoes", "POST /simulacoes"]).await;

        assert!(matches!(result, Err(StoreError::Redis(_))));
        assert!(untouched.is_empty());
        assert!(rows.is_empty());
    }
}
