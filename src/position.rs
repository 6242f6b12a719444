//! Position data structures.
//!
//! [`RawPosition`] is the loosely-typed wire shape accepted from the adapter;
//! [`Position`] is the canonical record produced by the processor. A raw
//! record becomes canonical exactly once, at processing time, and is
//! immutable afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata keys recognized at the top level of a raw record and lifted
/// into [`Position::metadata`].
pub const RECOGNIZED_METADATA_KEYS: [&str; 4] = ["speed", "heading", "altitude", "accuracy"];

/// A normalized GPS record.
///
/// # Example
///
/// ```
/// use gps_gateway::Position;
/// use chrono::Utc;
///
/// let pos = Position::new("truck-17".into(), 40.7128, -74.0060, Utc::now());
/// assert_eq!(pos.device_id, "truck-17");
/// assert!(pos.metadata.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    /// Device identifier (`[A-Za-z0-9_-]+`, at most 50 characters)
    pub device_id: String,
    /// Latitude in decimal degrees, [-90, 90]
    pub lat: f64,
    /// Longitude in decimal degrees, [-180, 180]
    pub lng: f64,
    /// Device-reported fix time
    pub timestamp: DateTime<Utc>,
    /// Gateway entry time, set by the processor
    pub received_at: DateTime<Utc>,
    /// Recognized telemetry keys plus user-supplied keys, preserved verbatim
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Position {
    /// Create a position with empty metadata and `received_at` = now.
    pub fn new(device_id: String, lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id,
            lat,
            lng,
            timestamp,
            received_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// Attach a metadata key, returning self for chaining.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }
}

/// The loosely-typed record shape submitted by devices.
///
/// Field spellings vary between firmware generations: `id` vs `device_id`,
/// `lat` vs `latitude`, `lng` vs `longitude`. Coordinates and timestamps may
/// arrive as numbers or numeric strings; the processor coerces them. Keys
/// that are not recognized land in `extra` and are carried through to
/// [`Position::metadata`] verbatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPosition {
    #[serde(default, alias = "id")]
    pub device_id: Option<String>,
    #[serde(default, alias = "latitude")]
    pub lat: Option<Value>,
    #[serde(default, alias = "longitude")]
    pub lng: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub speed: Option<Value>,
    #[serde(default)]
    pub heading: Option<Value>,
    #[serde(default)]
    pub altitude: Option<Value>,
    #[serde(default)]
    pub accuracy: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawPosition {
    /// Minimal raw record for a device and coordinate pair.
    pub fn new(device_id: &str, lat: f64, lng: f64) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            lat: Some(Value::from(lat)),
            lng: Some(Value::from(lng)),
            ..Default::default()
        }
    }

    /// Set the timestamp from a `DateTime`, returning self for chaining.
    #[must_use]
    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(Value::String(ts.to_rfc3339()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_position_new() {
        let ts = Utc::now();
        let pos = Position::new("d1".into(), 1.5, -2.5, ts);
        assert_eq!(pos.device_id, "d1");
        assert_eq!(pos.lat, 1.5);
        assert_eq!(pos.lng, -2.5);
        assert_eq!(pos.timestamp, ts);
        assert!(pos.received_at >= ts - chrono::Duration::seconds(5));
        assert!(pos.metadata.is_empty());
    }

    #[test]
    fn test_position_with_metadata() {
        let pos = Position::new("d1".into(), 0.0, 0.0, Utc::now())
            .with_metadata("speed", 42.0)
            .with_metadata("driver", "alice");
        assert_eq!(pos.metadata["speed"], json!(42.0));
        assert_eq!(pos.metadata["driver"], json!("alice"));
    }

    #[test]
    fn test_raw_deserialize_aliases() {
        let raw: RawPosition = serde_json::from_value(json!({
            "id": "d1",
            "latitude": 40.5,
            "longitude": "-74.1",
        }))
        .unwrap();
        assert_eq!(raw.device_id.as_deref(), Some("d1"));
        assert_eq!(raw.lat, Some(json!(40.5)));
        assert_eq!(raw.lng, Some(json!("-74.1")));
    }

    #[test]
    fn test_raw_deserialize_canonical_names() {
        let raw: RawPosition = serde_json::from_value(json!({
            "device_id": "d2",
            "lat": 1,
            "lng": 2,
            "timestamp": "2024-01-01T12:00:00Z",
        }))
        .unwrap();
        assert_eq!(raw.device_id.as_deref(), Some("d2"));
        assert!(raw.timestamp.is_some());
    }

    #[test]
    fn test_raw_extra_keys_flattened() {
        let raw: RawPosition = serde_json::from_value(json!({
            "id": "d1",
            "lat": 0,
            "lng": 0,
            "speed": 12.5,
            "fleet": "north",
            "battery": 87,
        }))
        .unwrap();
        assert_eq!(raw.speed, Some(json!(12.5)));
        assert_eq!(raw.extra["fleet"], json!("north"));
        assert_eq!(raw.extra["battery"], json!(87));
    }

    #[test]
    fn test_position_serde_round_trip() {
        let pos = Position::new("d1".into(), 40.7128, -74.006, Utc::now())
            .with_metadata("heading", 270);
        let s = serde_json::to_string(&pos).unwrap();
        let back: Position = serde_json::from_str(&s).unwrap();
        assert_eq!(back, pos);
    }
}
