//! In-memory store implementation.
//!
//! Mirrors the Redis layout semantics (ordered history list of JSON
//! strings, per-device latest records, append-then-trim retention) without
//! a network hop. Used by tests and by embedded deployments that do not
//! configure `redis_url`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::traits::{
    collapse_latest, CleanupReport, HistoryRecord, LatestRecord, PositionStore, StoreError,
    StorePolicy, StoreStats,
};
use crate::position::Position;

pub struct MemoryPositionStore {
    policy: StorePolicy,
    /// Serialized history entries, oldest first (same encoding as Redis)
    history: Mutex<Vec<String>>,
    latest: DashMap<String, LatestRecord>,
    batch_metadata: DashMap<String, (usize, String)>,
}

impl MemoryPositionStore {
    #[must_use]
    pub fn new(policy: StorePolicy) -> Self {
        Self {
            policy,
            history: Mutex::new(Vec::new()),
            latest: DashMap::new(),
            batch_metadata: DashMap::new(),
        }
    }

    /// Number of per-batch metadata records retained.
    #[must_use]
    pub fn batch_metadata_len(&self) -> usize {
        self.batch_metadata.len()
    }

    /// Drop everything. Test hook.
    pub fn clear(&self) {
        self.history.lock().clear();
        self.latest.clear();
        self.batch_metadata.clear();
    }

    fn trim_locked(history: &mut Vec<String>, bound: usize) -> usize {
        if history.len() > bound {
            let excess = history.len() - bound;
            history.drain(..excess);
            excess
        } else {
            0
        }
    }
}

impl Default for MemoryPositionStore {
    fn default() -> Self {
        Self::new(StorePolicy::default())
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn write_history_batch(
        &self,
        batch_id: &str,
        positions: &[Position],
    ) -> Result<usize, StoreError> {
        if positions.is_empty() {
            return Ok(0);
        }

        let encoded: Result<Vec<String>, _> = positions
            .iter()
            .map(|p| serde_json::to_string(&HistoryRecord::from_position(p, batch_id)))
            .collect();
        let encoded = encoded.map_err(|e| StoreError::Backend(e.to_string()))?;
        let count = encoded.len();

        // Append and trim under one lock so no reader sees the list past
        // the retention bound.
        {
            let mut history = self.history.lock();
            history.extend(encoded);
            Self::trim_locked(&mut history, self.policy.max_history_entries);
        }

        if self.policy.batch_metadata_enabled {
            self.batch_metadata
                .insert(batch_id.to_string(), (count, Utc::now().to_rfc3339()));
        }

        Ok(count)
    }

    async fn write_latest(&self, positions: &[Position]) -> Result<usize, StoreError> {
        let collapsed = collapse_latest(positions);
        let updated_at = Utc::now();
        let mut written = 0;
        for position in collapsed {
            // Guarded overwrite: a batch carrying an older fix (e.g. written
            // out of order by a concurrent worker) must not regress the record
            if let Some(existing) = self.latest.get(&position.device_id) {
                if existing.timestamp > position.timestamp {
                    continue;
                }
            }
            self.latest.insert(
                position.device_id.clone(),
                LatestRecord::from_position(&position, updated_at),
            );
            written += 1;
        }
        Ok(written)
    }

    async fn get_latest(&self, device_id: &str) -> Result<Option<LatestRecord>, StoreError> {
        Ok(self.latest.get(device_id).map(|r| r.value().clone()))
    }

    async fn get_latest_many(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<LatestRecord>, StoreError> {
        Ok(device_ids
            .iter()
            .filter_map(|id| self.latest.get(id).map(|r| r.value().clone()))
            .collect())
    }

    async fn history_tail(&self, count: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let history = self.history.lock();
        let start = history.len().saturating_sub(count);
        history[start..]
            .iter()
            .map(|s| serde_json::from_str(s).map_err(|e| StoreError::Malformed(e.to_string())))
            .collect()
    }

    async fn history_len(&self) -> Result<usize, StoreError> {
        Ok(self.history.lock().len())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let history_len = self.history.lock().len();
        let sample = self.history_tail(self.policy.history_sample_size).await?;
        let mut device_frequency: HashMap<String, usize> = HashMap::new();
        for record in &sample {
            *device_frequency.entry(record.device_id.clone()).or_insert(0) += 1;
        }
        Ok(StoreStats {
            history_len,
            max_history_entries: self.policy.max_history_entries,
            utilization_pct: history_len as f64 / self.policy.max_history_entries as f64 * 100.0,
            device_count: self.latest.len(),
            device_frequency,
        })
    }

    async fn cleanup(&self) -> Result<CleanupReport, StoreError> {
        let history_trimmed = {
            let mut history = self.history.lock();
            Self::trim_locked(&mut history, self.policy.max_history_entries)
        };

        let mut latest_deleted = 0;
        if let Some(inactivity_ms) = self.policy.max_device_inactivity_ms {
            let cutoff = Utc::now() - chrono::Duration::milliseconds(inactivity_ms as i64);
            let stale: Vec<String> = self
                .latest
                .iter()
                .filter(|r| r.value().updated_at < cutoff)
                .map(|r| r.key().clone())
                .collect();
            for key in stale {
                if self.latest.remove(&key).is_some() {
                    latest_deleted += 1;
                }
            }
        }

        Ok(CleanupReport {
            history_trimmed,
            latest_deleted,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
