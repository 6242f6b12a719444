//! Redis store implementation.
//!
//! Layout on the shared instance:
//! - `gps:history:global` — list of JSON strings, newest at the tail,
//!   trimmed to the retention bound on every append
//! - `gps:last:<device_id>` — hash with the latest record per device,
//!   `metadata` JSON-encoded into a single field
//! - `gps:metadata:batch:<batch_id>` — optional per-batch bookkeeping
//!
//! All multi-record operations are pipelined; the append and the trim of a
//! history write travel in one pipeline so a reader never observes the list
//! beyond the bound.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::traits::{
    collapse_latest, CleanupReport, HistoryRecord, LatestRecord, PositionStore, StoreError,
    StorePolicy, StoreStats, BATCH_METADATA_PREFIX, HISTORY_KEY, LATEST_KEY_PREFIX,
};
use crate::position::Position;

/// How long the startup handshake may keep retrying before the gateway
/// aborts. A bad address or a down instance should surface in seconds.
const CONNECT_DEADLINE: Duration = Duration::from_secs(3);
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Replays per store command after the first attempt. Kept deliberately
/// small: the job queue owns delivery retry with exponential backoff, so a
/// write only replays here to ride out a dropped connection mid-command
/// before the error is handed back to the queue.
const COMMAND_REPLAYS: usize = 2;

/// Pause before the nth replay: 150ms, then 300ms. Flat and short; the
/// queue's backoff provides the spread between delivery attempts.
fn replay_pause(replay: usize) -> Duration {
    Duration::from_millis(150 * (replay as u64 + 1))
}

/// Keep attempting the initial connection until `deadline` elapses.
async fn connect_with_deadline(
    client: Client,
    deadline: Duration,
) -> Result<ConnectionManager, StoreError> {
    let started = std::time::Instant::now();
    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(connection) => return Ok(connection),
            Err(err) if started.elapsed() < deadline => {
                warn!(error = %err, "Redis not reachable yet, retrying connect");
                sleep(CONNECT_RETRY_PAUSE).await;
            }
            Err(err) => return Err(StoreError::Connection(err.to_string())),
        }
    }
}

/// Run a store command, replaying it up to [`COMMAND_REPLAYS`] times on
/// failure before surfacing the error.
async fn replay<T, F, Fut>(command: &str, mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, redis::RedisError>>,
{
    let mut replays = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if replays < COMMAND_REPLAYS => {
                warn!(command, replay = replays + 1, error = %err, "Store command failed, replaying");
                sleep(replay_pause(replays)).await;
                replays += 1;
            }
            Err(err) => return Err(StoreError::Backend(err.to_string())),
        }
    }
}

pub struct RedisPositionStore {
    connection: ConnectionManager,
    policy: StorePolicy,
    /// Optional key prefix for namespacing (e.g., "fleet1:" → "fleet1:gps:last:d1")
    prefix: String,
}

impl std::fmt::Debug for RedisPositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPositionStore")
            .field("policy", &self.policy)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisPositionStore {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str, policy: StorePolicy) -> Result<Self, StoreError> {
        Self::with_prefix(connection_string, None, policy).await
    }

    /// Connect with an optional key prefix.
    ///
    /// The prefix is prepended to every key, enabling namespacing when
    /// sharing a Redis instance with other applications.
    pub async fn with_prefix(
        connection_string: &str,
        prefix: Option<&str>,
        policy: StorePolicy,
    ) -> Result<Self, StoreError> {
        let client =
            Client::open(connection_string).map_err(|e| StoreError::Connection(e.to_string()))?;

        let connection = connect_with_deadline(client, CONNECT_DEADLINE).await?;

        Ok(Self {
            connection,
            policy,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    fn latest_key(&self, device_id: &str) -> String {
        self.prefixed_key(&format!("{}{}", LATEST_KEY_PREFIX, device_id))
    }

    fn history_key(&self) -> String {
        self.prefixed_key(HISTORY_KEY)
    }

    fn encode_history(
        batch_id: &str,
        positions: &[Position],
    ) -> Result<Vec<String>, StoreError> {
        positions
            .iter()
            .map(|p| {
                serde_json::to_string(&HistoryRecord::from_position(p, batch_id))
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .collect()
    }

    fn parse_latest_map(map: HashMap<String, String>) -> Result<LatestRecord, StoreError> {
        fn field<'a>(
            map: &'a HashMap<String, String>,
            name: &str,
        ) -> Result<&'a String, StoreError> {
            map.get(name)
                .ok_or_else(|| StoreError::Malformed(format!("missing field '{}'", name)))
        }
        fn parse_ts(raw: &str, name: &str) -> Result<DateTime<Utc>, StoreError> {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::Malformed(format!("bad {} '{}': {}", name, raw, e)))
        }

        Ok(LatestRecord {
            device_id: field(&map, "deviceId")?.clone(),
            lat: field(&map, "lat")?
                .parse()
                .map_err(|e| StoreError::Malformed(format!("bad lat: {}", e)))?,
            lng: field(&map, "lng")?
                .parse()
                .map_err(|e| StoreError::Malformed(format!("bad lng: {}", e)))?,
            timestamp: parse_ts(field(&map, "timestamp")?, "timestamp")?,
            received_at: parse_ts(field(&map, "receivedAt")?, "receivedAt")?,
            updated_at: parse_ts(field(&map, "updatedAt")?, "updatedAt")?,
            metadata: field(&map, "metadata")?.clone(),
        })
    }

    fn latest_fields(record: &LatestRecord) -> [(&'static str, String); 7] {
        [
            ("deviceId", record.device_id.clone()),
            ("lat", record.lat.to_string()),
            ("lng", record.lng.to_string()),
            ("timestamp", record.timestamp.to_rfc3339()),
            ("receivedAt", record.received_at.to_rfc3339()),
            ("updatedAt", record.updated_at.to_rfc3339()),
            ("metadata", record.metadata.clone()),
        ]
    }

    /// Collect all latest-record keys via SCAN (non-blocking cursor walk).
    async fn scan_latest_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.prefixed_key(LATEST_KEY_PREFIX));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, chunk): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            keys.extend(chunk);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl PositionStore for RedisPositionStore {
    async fn write_history_batch(
        &self,
        batch_id: &str,
        positions: &[Position],
    ) -> Result<usize, StoreError> {
        if positions.is_empty() {
            return Ok(0);
        }

        let encoded = Self::encode_history(batch_id, positions)?;
        let count = encoded.len();
        let key = self.history_key();
        let bound = self.policy.max_history_entries as i64;

        let meta_key = self
            .policy
            .batch_metadata_enabled
            .then(|| self.prefixed_key(&format!("{}{}", BATCH_METADATA_PREFIX, batch_id)));

        #[cfg(feature = "compression")]
        let compressed: Option<Vec<u8>> = if meta_key.is_some() {
            crate::compression::compress_positions(positions).ok()
        } else {
            None
        };

        let conn = self.connection.clone();
        replay("history_append", || {
            let mut conn = conn.clone();
            let key = key.clone();
            let encoded = encoded.clone();
            let meta_key = meta_key.clone();
            #[cfg(feature = "compression")]
            let compressed = compressed.clone();
            async move {
                let mut pipeline = pipe();
                let mut push = pipeline.cmd("RPUSH");
                push.arg(&key);
                for entry in &encoded {
                    push.arg(entry);
                }
                // Keep only the last `bound` entries; no-op when already within it
                pipeline.cmd("LTRIM").arg(&key).arg(-bound).arg(-1);
                if let Some(ref meta_key) = meta_key {
                    let mut hset = pipeline.cmd("HSET");
                    hset.arg(meta_key)
                        .arg("count")
                        .arg(encoded.len())
                        .arg("createdAt")
                        .arg(Utc::now().to_rfc3339());
                    #[cfg(feature = "compression")]
                    if let Some(ref blob) = compressed {
                        hset.arg("compressedBytes").arg(blob.len());
                        hset.arg("payload").arg(blob.as_slice());
                    }
                }
                pipeline.query_async::<()>(&mut conn).await?;
                Ok(())
            }
        })
        .await?;

        Ok(count)
    }

    async fn write_latest(&self, positions: &[Position]) -> Result<usize, StoreError> {
        let mut collapsed = collapse_latest(positions);
        if collapsed.is_empty() {
            return Ok(0);
        }

        // Guarded overwrite: read the stored timestamps first and drop any
        // fix older than what is already there, so a batch delivered out of
        // order by a concurrent worker cannot regress a device's record.
        // Not an atomic compare-and-set; cross-process races remain (see
        // DESIGN notes).
        let keys: Vec<String> = collapsed
            .iter()
            .map(|p| self.latest_key(&p.device_id))
            .collect();
        let stored: Vec<Option<String>> = {
            let mut conn = self.connection.clone();
            let mut pipeline = pipe();
            for key in &keys {
                pipeline.cmd("HGET").arg(key).arg("timestamp");
            }
            pipeline
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?
        };
        let mut index = 0;
        collapsed.retain(|position| {
            let stored_ts = stored[index]
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|ts| ts.with_timezone(&Utc));
            index += 1;
            stored_ts.map_or(true, |ts| ts <= position.timestamp)
        });
        if collapsed.is_empty() {
            return Ok(0);
        }

        let updated_at = Utc::now();
        let records: Vec<(String, LatestRecord)> = collapsed
            .iter()
            .map(|p| {
                (
                    self.latest_key(&p.device_id),
                    LatestRecord::from_position(p, updated_at),
                )
            })
            .collect();
        let count = records.len();
        let ttl = self.policy.latest_ttl_s;

        let conn = self.connection.clone();
        replay("latest_write", || {
            let mut conn = conn.clone();
            let records = records.clone();
            async move {
                let mut pipeline = pipe();
                for (key, record) in &records {
                    let mut hset = pipeline.cmd("HSET");
                    hset.arg(key);
                    for (field, value) in Self::latest_fields(record) {
                        hset.arg(field).arg(value);
                    }
                    if let Some(ttl) = ttl {
                        pipeline.expire(key, ttl as i64);
                    }
                }
                pipeline.query_async::<()>(&mut conn).await?;
                Ok(())
            }
        })
        .await?;

        Ok(count)
    }

    async fn get_latest(&self, device_id: &str) -> Result<Option<LatestRecord>, StoreError> {
        let key = self.latest_key(device_id);
        let conn = self.connection.clone();

        let map: HashMap<String, String> = replay("latest_get", || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let map: HashMap<String, String> = conn.hgetall(&key).await?;
                Ok(map)
            }
        })
        .await?;

        if map.is_empty() {
            return Ok(None);
        }
        Self::parse_latest_map(map).map(Some)
    }

    async fn get_latest_many(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<LatestRecord>, StoreError> {
        if device_ids.is_empty() {
            return Ok(vec![]);
        }

        let keys: Vec<String> = device_ids.iter().map(|id| self.latest_key(id)).collect();
        let conn = self.connection.clone();

        let maps: Vec<HashMap<String, String>> = replay("latest_get_many", || {
            let mut conn = conn.clone();
            let keys = keys.clone();
            async move {
                let mut pipeline = pipe();
                for key in &keys {
                    pipeline.hgetall(key);
                }
                let maps: Vec<HashMap<String, String>> = pipeline.query_async(&mut conn).await?;
                Ok(maps)
            }
        })
        .await?;

        maps.into_iter()
            .filter(|m| !m.is_empty())
            .map(Self::parse_latest_map)
            .collect()
    }

    async fn history_tail(&self, count: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let entries: Vec<String> = conn
            .lrange(self.history_key(), -(count as isize), -1)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        entries
            .iter()
            .map(|s| serde_json::from_str(s).map_err(|e| StoreError::Malformed(e.to_string())))
            .collect()
    }

    async fn history_len(&self) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();
        conn.llen(self.history_key())
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let history_len = self.history_len().await?;
        let sample = self.history_tail(self.policy.history_sample_size).await?;
        let mut device_frequency: HashMap<String, usize> = HashMap::new();
        for record in &sample {
            *device_frequency.entry(record.device_id.clone()).or_insert(0) += 1;
        }
        let device_count = self.scan_latest_keys().await?.len();

        Ok(StoreStats {
            history_len,
            max_history_entries: self.policy.max_history_entries,
            utilization_pct: history_len as f64 / self.policy.max_history_entries as f64 * 100.0,
            device_count,
            device_frequency,
        })
    }

    async fn cleanup(&self) -> Result<CleanupReport, StoreError> {
        let mut conn = self.connection.clone();
        let key = self.history_key();
        let bound = self.policy.max_history_entries;

        let before: usize = conn
            .llen(&key)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let _: () = cmd("LTRIM")
            .arg(&key)
            .arg(-(bound as i64))
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let history_trimmed = before.saturating_sub(bound);

        let mut latest_deleted = 0;
        if let Some(inactivity_ms) = self.policy.max_device_inactivity_ms {
            let cutoff = Utc::now() - chrono::Duration::milliseconds(inactivity_ms as i64);
            for key in self.scan_latest_keys().await? {
                let raw: Option<String> = conn
                    .hget(&key, "updatedAt")
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                let Some(raw) = raw else { continue };
                let Ok(updated_at) = DateTime::parse_from_rfc3339(&raw) else {
                    continue;
                };
                if updated_at.with_timezone(&Utc) < cutoff {
                    let removed: usize = conn
                        .del(&key)
                        .await
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    latest_deleted += removed;
                }
            }
        }

        Ok(CleanupReport {
            history_trimmed,
            latest_deleted,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let pong: String = cmd("PING")
            .arg("gateway")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if pong == "gateway" {
            Ok(())
        } else {
            Err(StoreError::Connection(format!("unexpected PING reply: {}", pong)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_latest_fields_cover_contract() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut position = Position::new("d1".into(), 1.25, -2.5, ts);
        position.received_at = ts;
        let record = LatestRecord::from_position(&position, ts);
        let fields = RedisPositionStore::latest_fields(&record);

        let names: Vec<&str> = fields.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["deviceId", "lat", "lng", "timestamp", "receivedAt", "updatedAt", "metadata"]
        );
        assert_eq!(fields[1].1, "1.25");
        assert_eq!(fields[6].1, "{}");
    }

    #[test]
    fn test_parse_latest_map_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        let mut position =
            Position::new("d7".into(), 48.8566, 2.3522, ts).with_metadata("accuracy", 3.5);
        position.received_at = ts;
        let record = LatestRecord::from_position(&position, ts);

        let map: HashMap<String, String> = RedisPositionStore::latest_fields(&record)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = RedisPositionStore::parse_latest_map(map).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_parse_latest_map_missing_field() {
        let mut map = HashMap::new();
        map.insert("deviceId".to_string(), "d1".to_string());
        let err = RedisPositionStore::parse_latest_map(map).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[test]
    fn test_encode_history_stamps_batch_id() {
        let positions = vec![
            Position::new("d1".into(), 0.0, 0.0, Utc::now()),
            Position::new("d2".into(), 1.0, 1.0, Utc::now()),
        ];
        let encoded = RedisPositionStore::encode_history("hist_42_xy", &positions).unwrap();
        assert_eq!(encoded.len(), 2);
        for entry in &encoded {
            assert!(entry.contains(r#""batchId":"hist_42_xy""#));
        }
    }

    #[test]
    fn test_replay_pause_schedule() {
        // Flat, short pauses; the queue's exponential backoff is the real
        // spacing between delivery attempts
        assert_eq!(replay_pause(0), Duration::from_millis(150));
        assert_eq!(replay_pause(1), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_bad_url_fails_without_retrying() {
        let err = RedisPositionStore::new("not-a-redis-url", StorePolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_deadline_bounds_startup() {
        // Port 9 (discard) refuses immediately on loopback; the connect
        // loop must give up once the deadline elapses instead of hanging
        let client = Client::open("redis://127.0.0.1:9").unwrap();
        let started = std::time::Instant::now();
        let err = match connect_with_deadline(client, Duration::from_millis(50)).await {
            Err(e) => e,
            Ok(_) => panic!("expected connection to fail"),
        };
        assert!(matches!(err, StoreError::Connection(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
