// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the gateway coordinator.

use serde::Serialize;
use thiserror::Error;

use crate::batching::AccumulatorStats;
use crate::processor::InvalidPosition;
use crate::queue::{QueueError, QueueStats};
use crate::storage::{StoreError, StoreStats};

/// Gateway lifecycle state.
///
/// The gateway progresses through states during startup and shutdown.
/// Use [`super::Gateway::state()`] to check the current state or
/// [`super::Gateway::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Just created, not yet started
    Created,
    /// Connecting to the store
    Connecting,
    /// Ready to accept submissions
    Ready,
    /// Run loop active
    Running,
    /// Graceful shutdown in progress; submissions rejected
    ShuttingDown,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Top-level error taxonomy.
///
/// - `Invalid` is per-record and never fails a batch
/// - `Store` is transient from the queue's perspective (retried by workers)
/// - `Queue` means an enqueue was rejected; the batch stays buffered
/// - `Config` aborts startup
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Invalid(#[from] InvalidPosition),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("gateway is not accepting submissions (state: {0})")]
    NotAccepting(GatewayState),
}

/// Outcome of a single-record submission, as reported to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Accepted and buffered for the next flush
    Processed,
    /// Acknowledged but not ingested
    Duplicate,
}

/// Per-record error entry in a batch submission report.
#[derive(Debug, Clone, Serialize)]
pub struct BatchErrorEntry {
    pub index: usize,
    pub reasons: Vec<String>,
}

/// Outcome of a batch submission; counts partition the input.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSubmitReport {
    pub processed_count: usize,
    pub duplicate_count: usize,
    pub errors: Vec<BatchErrorEntry>,
}

impl BatchSubmitReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.processed_count + self.duplicate_count + self.errors.len()
    }
}

/// Aggregated statistics across all components.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub accumulator: AccumulatorStats,
    pub history_queue: QueueStats,
    pub latest_queue: QueueStats,
    pub store: StoreStats,
    pub duplicate_cache_len: usize,
}

/// Health status of the gateway.
///
/// `store_connected` and `store_latency_ms` come from a live probe during
/// the `health()` call; everything else is cached component state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    #[serde(serialize_with = "serialize_state")]
    pub state: GatewayState,
    pub ready: bool,
    pub store_connected: bool,
    pub store_latency_ms: Option<u64>,
    pub accumulator: AccumulatorStats,
    pub history_queue: QueueStats,
    pub latest_queue: QueueStats,
    pub duplicate_cache_len: usize,
    /// Overall verdict: ready, store reachable
    pub healthy: bool,
}

fn serialize_state<S: serde::Serializer>(
    state: &GatewayState,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&state.to_string())
}

/// What remained when shutdown finished.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Positions still buffered after the final flush attempt
    pub unflushed_history: usize,
    pub unflushed_latest: usize,
    pub history_queue: QueueStats,
    pub latest_queue: QueueStats,
}
