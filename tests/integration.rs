//! Integration tests against real Redis.
//!
//! Tests use testcontainers for portability - no external docker-compose
//! required.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker)
//! cargo test --test integration -- --ignored
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: lifecycle, dual-shape writes, retention
//! - `layout_*` - Key layout and encoding contracts on the wire

use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

use gps_gateway::{
    Gateway, GatewayConfig, Position, PositionStore, RawPosition, RedisPositionStore, StorePolicy,
    SubmitOutcome,
};

// =============================================================================
// Container Helpers
// =============================================================================

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7.2")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn redis_url(container: &Container<'_, GenericImage>) -> String {
    format!("redis://127.0.0.1:{}", container.get_host_port_ipv4(6379))
}

fn test_config(url: String) -> GatewayConfig {
    GatewayConfig {
        redis_url: Some(url),
        batch_interval_ms: 50,
        history_backoff_base_ms: 1,
        latest_backoff_base_ms: 1,
        shutdown_deadline_ms: 5_000,
        ..Default::default()
    }
}

fn fix(device: &str, lat: f64, lng: f64, ts_ms: i64) -> Position {
    Position::new(
        device.into(),
        lat,
        lng,
        Utc.timestamp_millis_opt(ts_ms).unwrap(),
    )
}

// =============================================================================
// Happy Path Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_gateway_lifecycle_with_redis() {
    let docker = Cli::default();
    let redis = redis_container(&docker);

    let mut gateway = Gateway::new(test_config(redis_url(&redis)));
    gateway.start().await.expect("Failed to start gateway");
    assert!(gateway.is_ready());

    for i in 0..10 {
        let raw = RawPosition::new(&format!("fleet-{}", i), 40.0 + i as f64 * 0.01, -74.0);
        assert_eq!(gateway.submit(&raw).unwrap(), SubmitOutcome::Processed);
    }

    gateway.force_flush().await.expect("Failed to flush");
    gateway.drain().await;

    let latest = gateway
        .get_latest("fleet-5")
        .await
        .unwrap()
        .expect("fleet-5 should have a latest record");
    assert_eq!(latest.lat, 40.05);

    let stats = gateway.stats().await.unwrap();
    assert_eq!(stats.store.history_len, 10);
    assert_eq!(stats.store.device_count, 10);

    let health = gateway.health().await;
    assert!(health.healthy);
    assert!(health.store_latency_ms.is_some());

    let report = gateway.shutdown().await;
    assert_eq!(report.unflushed_history, 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_history_round_trip_bit_exact() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = RedisPositionStore::new(&redis_url(&redis), StorePolicy::default())
        .await
        .unwrap();

    let position = fix("d1", 40.7128, -74.006, 1_704_110_400_000)
        .with_metadata("speed", 31.5)
        .with_metadata("route", "A7");
    store
        .write_history_batch("hist_1_roundtrip", &[position.clone()])
        .await
        .unwrap();

    let tail = store.history_tail(1).await.unwrap();
    let record = &tail[0];
    assert_eq!(record.device_id, position.device_id);
    assert_eq!(record.lat, position.lat);
    assert_eq!(record.lng, position.lng);
    assert_eq!(record.timestamp, position.timestamp);
    assert_eq!(record.received_at, position.received_at);
    assert_eq!(record.batch_id, "hist_1_roundtrip");
    assert_eq!(record.metadata, position.metadata);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_retention_trims_on_every_append() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let policy = StorePolicy {
        max_history_entries: 10,
        ..StorePolicy::default()
    };
    let store = RedisPositionStore::new(&redis_url(&redis), policy).await.unwrap();

    let first: Vec<Position> = (0..10).map(|i| fix(&format!("a{}", i), 1.0, 1.0, 1000 + i)).collect();
    store.write_history_batch("hist_1_a", &first).await.unwrap();
    assert_eq!(store.history_len().await.unwrap(), 10);

    let second: Vec<Position> = (0..5).map(|i| fix(&format!("b{}", i), 2.0, 2.0, 2000 + i)).collect();
    store.write_history_batch("hist_2_b", &second).await.unwrap();

    assert_eq!(store.history_len().await.unwrap(), 10);
    let tail = store.history_tail(10).await.unwrap();
    assert_eq!(tail[0].device_id, "a5");
    assert_eq!(tail[9].device_id, "b4");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_latest_overwrite_and_multi_get() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = RedisPositionStore::new(&redis_url(&redis), StorePolicy::default())
        .await
        .unwrap();

    store
        .write_latest(&[fix("d1", 1.0, 1.0, 1000), fix("d2", 2.0, 2.0, 2000)])
        .await
        .unwrap();
    // Overwrite d1 with a newer fix
    store.write_latest(&[fix("d1", 9.0, 9.0, 9000)]).await.unwrap();

    let records = store
        .get_latest_many(&["d1".into(), "d2".into(), "ghost".into()])
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    let d1 = records.iter().find(|r| r.device_id == "d1").unwrap();
    assert_eq!(d1.lat, 9.0);
    assert_eq!(d1.timestamp.timestamp_millis(), 9000);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_cleanup_idempotent() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let policy = StorePolicy {
        max_history_entries: 3,
        ..StorePolicy::default()
    };
    let store = RedisPositionStore::new(&redis_url(&redis), policy).await.unwrap();

    let positions: Vec<Position> = (0..3).map(|i| fix(&format!("c{}", i), 1.0, 1.0, 1000 + i)).collect();
    store.write_history_batch("hist_1_c", &positions).await.unwrap();

    let first = store.cleanup().await.unwrap();
    let second = store.cleanup().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.history_len().await.unwrap(), 3);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_inactivity_cleanup_deletes_stale_devices() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let policy = StorePolicy {
        max_device_inactivity_ms: Some(50),
        ..StorePolicy::default()
    };
    let store = RedisPositionStore::new(&redis_url(&redis), policy).await.unwrap();

    store.write_latest(&[fix("stale-1", 1.0, 1.0, 1000)]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = store.cleanup().await.unwrap();
    assert_eq!(report.latest_deleted, 1);
    assert!(store.get_latest("stale-1").await.unwrap().is_none());
}

// =============================================================================
// Wire Layout Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn layout_keys_and_hash_fields_match_contract() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = redis_url(&redis);
    let store = RedisPositionStore::new(&url, StorePolicy::default()).await.unwrap();

    let ts = Utc::now() - ChronoDuration::seconds(5);
    store
        .write_history_batch(
            "hist_7_layout",
            &[Position::new("layout-1".into(), 1.5, 2.5, ts)],
        )
        .await
        .unwrap();
    store
        .write_latest(&[Position::new("layout-1".into(), 1.5, 2.5, ts)])
        .await
        .unwrap();

    // Inspect raw keys with a plain client
    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();

    let history_entries: Vec<String> = redis::cmd("LRANGE")
        .arg("gps:history:global")
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(history_entries.len(), 1);
    let parsed: serde_json::Value = serde_json::from_str(&history_entries[0]).unwrap();
    assert_eq!(parsed["deviceId"], "layout-1");
    assert_eq!(parsed["batchId"], "hist_7_layout");

    let fields: Vec<String> = redis::cmd("HKEYS")
        .arg("gps:last:layout-1")
        .query_async(&mut conn)
        .await
        .unwrap();
    for expected in ["deviceId", "lat", "lng", "timestamp", "receivedAt", "updatedAt", "metadata"] {
        assert!(fields.iter().any(|f| f == expected), "missing field {expected}");
    }

    // Default policy carries the 7-day TTL on latest records
    let ttl: i64 = redis::cmd("TTL")
        .arg("gps:last:layout-1")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl > 0 && ttl <= 604_800);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn layout_key_prefix_namespaces_everything() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = redis_url(&redis);
    let store = RedisPositionStore::with_prefix(&url, Some("fleet9:"), StorePolicy::default())
        .await
        .unwrap();

    store
        .write_history_batch("hist_8_prefix", &[fix("p1", 1.0, 1.0, 1000)])
        .await
        .unwrap();
    store.write_latest(&[fix("p1", 1.0, 1.0, 1000)]).await.unwrap();

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();

    let len: usize = redis::cmd("LLEN")
        .arg("fleet9:gps:history:global")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(len, 1);

    let exists: bool = redis::cmd("EXISTS")
        .arg("fleet9:gps:last:p1")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(exists);

    assert!(store.get_latest("p1").await.unwrap().is_some());
}
