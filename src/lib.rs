//! # GPS Gateway
//!
//! An ingestion gateway for device location reports: deduplicate, batch,
//! and durably write positions into a shared store in two complementary
//! shapes — an append-only global history stream for downstream consumers,
//! and a per-device latest-position lookup for real-time queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Processor                            │
//! │  • Normalizes field aliases, coerces numeric strings       │
//! │  • Validates id / coordinates / timestamp window           │
//! │  • Drops near-duplicates (bounded per-device cache)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     BatchAccumulator                        │
//! │  • History buffer (ordered) + latest map (per device)      │
//! │  • Flush on timer, on size, or on force                    │
//! │  • Swap-then-enqueue; restore on enqueue failure           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (two named job queues)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        JobQueue ×2                          │
//! │  • history: 5 workers      • latest: 3 workers             │
//! │  • Retry with exponential backoff, then dead-letter        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                              │
//! │  • gps:history:global — list, trimmed to retention bound   │
//! │  • gps:last:<id> — whole-record overwrite, optional TTL    │
//! │  • Pipelined writes and reads                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gps_gateway::{Gateway, GatewayConfig, RawPosition};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gps_gateway::GatewayError> {
//!     let config = GatewayConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         ..Default::default()
//!     };
//!
//!     let mut gateway = Gateway::new(config);
//!     gateway.start().await?;
//!
//!     // Submit device reports
//!     let raw = RawPosition::new("truck-17", 40.7128, -74.0060);
//!     gateway.submit(&raw)?;
//!
//!     // Real-time read
//!     if let Some(record) = gateway.get_latest("truck-17").await? {
//!         println!("truck-17 is at {}, {}", record.lat, record.lng);
//!     }
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once** delivery of accepted positions to the global
//!   history: a flushed batch is retried by the queue, and a failed
//!   enqueue restores the buffer for the next trigger.
//! - **One latest record per device**, monotonic in `timestamp` within a
//!   single process instance.
//! - **Bounded history**: the retention trim travels in the same pipeline
//!   as the append, so readers never observe the list past the bound.
//! - No total order across devices, no exactly-once delivery.
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`Gateway`] orchestrating all components
//! - [`processor`]: Normalization, validation, duplicate filter
//! - [`batching`]: Dual batch accumulator with its flush triggers
//! - [`queue`]: Named job queues with bounded worker pools
//! - [`storage`]: Store implementations (Redis, in-memory)
//! - [`events`]: Process-local pub/sub for observability hooks

pub mod batching;
pub mod compression;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod metrics;
pub mod position;
pub mod processor;
pub mod queue;
pub mod storage;

pub use batching::{AccumulatorStats, BatchAccumulator, BatchKind, FlushReport};
pub use config::GatewayConfig;
pub use coordinator::{
    BatchSubmitReport, Gateway, GatewayError, GatewayState, GatewayStats, HealthCheck,
    ShutdownReport, SubmitOutcome,
};
pub use events::{EventBus, GatewayEvent};
pub use position::{Position, RawPosition};
pub use processor::{BatchReport, InvalidPosition, ProcessOutcome, Processor};
pub use queue::{JobPayload, JobQueue, QueueStats};
pub use storage::{
    CleanupReport, HistoryRecord, LatestRecord, MemoryPositionStore, PositionStore,
    RedisPositionStore, StoreError, StorePolicy, StoreStats,
};
