use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::position::Position;

/// Global history list key.
pub const HISTORY_KEY: &str = "gps:history:global";
/// Per-device latest record key prefix; the device id is appended.
pub const LATEST_KEY_PREFIX: &str = "gps:last:";
/// Optional per-batch metadata key prefix; the batch id is appended.
pub const BATCH_METADATA_PREFIX: &str = "gps:metadata:batch:";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("stored record is malformed: {0}")]
    Malformed(String),
}

/// One element of the global history list, exactly as persisted.
///
/// Serialized as a JSON string with camelCase fields and ISO-8601
/// timestamps; this shape is the contract with downstream consumers that
/// drain the list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub batch_id: String,
    pub metadata: Map<String, Value>,
}

impl HistoryRecord {
    pub fn from_position(position: &Position, batch_id: &str) -> Self {
        Self {
            device_id: position.device_id.clone(),
            lat: position.lat,
            lng: position.lng,
            timestamp: position.timestamp,
            received_at: position.received_at,
            batch_id: batch_id.to_string(),
            metadata: position.metadata.clone(),
        }
    }
}

/// The per-device latest record, exactly as persisted.
///
/// Stored as a field/value record under `gps:last:<device_id>`; `metadata`
/// is JSON-encoded into a single string field. Overwrites replace the whole
/// record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatestRecord {
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: String,
}

impl LatestRecord {
    pub fn from_position(position: &Position, updated_at: DateTime<Utc>) -> Self {
        Self {
            device_id: position.device_id.clone(),
            lat: position.lat,
            lng: position.lng,
            timestamp: position.timestamp,
            received_at: position.received_at,
            updated_at,
            metadata: Value::Object(position.metadata.clone()).to_string(),
        }
    }

    /// Decode the metadata string back into a map.
    pub fn metadata_map(&self) -> Result<Map<String, Value>, StoreError> {
        match serde_json::from_str(&self.metadata) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StoreError::Malformed("metadata is not an object".into())),
            Err(e) => Err(StoreError::Malformed(e.to_string())),
        }
    }
}

/// Retention and cleanup policy handed to store implementations.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    /// Keep only the last N history entries; enforced on every append
    pub max_history_entries: usize,
    /// TTL applied to latest records on write, when cleanup is enabled
    pub latest_ttl_s: Option<u64>,
    /// Delete latest records idle longer than this during cleanup
    pub max_device_inactivity_ms: Option<u64>,
    /// Write a `gps:metadata:batch:<id>` record per history append
    pub batch_metadata_enabled: bool,
    /// History tail length sampled for the device-frequency histogram
    pub history_sample_size: usize,
}

impl StorePolicy {
    pub fn from_config(config: &crate::config::GatewayConfig) -> Self {
        Self {
            max_history_entries: config.max_history_entries,
            latest_ttl_s: config.cleanup_enabled.then_some(config.latest_key_ttl_s),
            max_device_inactivity_ms: if config.cleanup_enabled {
                config.max_device_inactivity_ms
            } else {
                None
            },
            batch_metadata_enabled: config.batch_metadata_enabled,
            history_sample_size: config.history_sample_size,
        }
    }
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self::from_config(&crate::config::GatewayConfig::default())
    }
}

/// Snapshot of store-level statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub history_len: usize,
    pub max_history_entries: usize,
    /// history_len / max_history_entries, in percent
    pub utilization_pct: f64,
    pub device_count: usize,
    /// Appearance counts per device over the sampled history tail
    pub device_frequency: HashMap<String, usize>,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub history_trimmed: usize,
    pub latest_deleted: usize,
}

/// Durable dual-shape persistence for positions.
///
/// Implementations must make `write_history_batch` append-then-trim in a
/// single pipelined operation so readers never observe the list beyond the
/// retention bound, and must collapse `write_latest` input to at most one
/// record per device (greatest `timestamp` wins).
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Append all positions to the global history as one group, then trim
    /// to the retention bound. Returns the number of entries appended.
    async fn write_history_batch(
        &self,
        batch_id: &str,
        positions: &[Position],
    ) -> Result<usize, StoreError>;

    /// Overwrite each device's latest record. Input is collapsed to one
    /// entry per device first. Returns the number of records written.
    async fn write_latest(&self, positions: &[Position]) -> Result<usize, StoreError>;

    async fn get_latest(&self, device_id: &str) -> Result<Option<LatestRecord>, StoreError>;

    /// Pipelined multi-device read; devices with no record are omitted.
    async fn get_latest_many(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<LatestRecord>, StoreError>;

    /// Read the last `count` history entries, oldest first.
    async fn history_tail(&self, count: usize) -> Result<Vec<HistoryRecord>, StoreError>;

    async fn history_len(&self) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Enforce retention on the history list and, when configured, delete
    /// latest records past the inactivity bound. Idempotent.
    async fn cleanup(&self) -> Result<CleanupReport, StoreError>;

    /// Liveness probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Collapse positions to at most one per device, keeping the entry with the
/// greatest `timestamp`. Ties are broken by later arrival (later slice
/// position wins).
pub fn collapse_latest(positions: &[Position]) -> Vec<Position> {
    let mut by_device: HashMap<&str, &Position> = HashMap::new();
    for position in positions {
        match by_device.get(position.device_id.as_str()) {
            Some(existing) if existing.timestamp > position.timestamp => {}
            _ => {
                by_device.insert(position.device_id.as_str(), position);
            }
        }
    }
    by_device.into_values().cloned().collect()
}
