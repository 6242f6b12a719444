//! Gateway coordinator.
//!
//! The [`Gateway`] is the main orchestrator that ties together all
//! components: the processor, the dual batch accumulator, the two job
//! queues, the store, and the event bus.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use gps_gateway::{Gateway, GatewayConfig, RawPosition};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), gps_gateway::GatewayError> {
//! let mut gateway = Gateway::new(GatewayConfig::default());
//! gateway.start().await?;
//!
//! let raw = RawPosition::new("truck-17", 40.7128, -74.0060);
//! gateway.submit(&raw)?;
//!
//! gateway.force_flush().await?;
//! let latest = gateway.get_latest("truck-17").await?;
//! assert!(latest.is_some());
//!
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{
    BatchErrorEntry, BatchSubmitReport, GatewayError, GatewayState, GatewayStats, HealthCheck,
    ShutdownReport, SubmitOutcome,
};

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::batching::BatchAccumulator;
use crate::config::GatewayConfig;
use crate::events::{EventBus, GatewayEvent};
use crate::processor::{ProcessOutcome, Processor};
use crate::queue::JobQueue;
use crate::storage::{LatestRecord, PositionStore};
use crate::position::RawPosition;

/// Largest batch accepted by [`Gateway::submit_batch`].
pub const MAX_SUBMIT_BATCH: usize = 100;

/// Main gateway coordinator.
///
/// Owns every component; components never hold back-references. The
/// gateway is `Send + Sync` once started and designed for concurrent
/// submissions.
pub struct Gateway {
    pub(super) config: GatewayConfig,

    /// Gateway state (broadcast to watchers)
    pub(super) state: watch::Sender<GatewayState>,
    pub(super) state_rx: watch::Receiver<GatewayState>,

    pub(super) processor: Processor,
    pub(super) events: Arc<EventBus>,

    /// Populated by `start()`
    pub(super) store: Option<Arc<dyn PositionStore>>,
    pub(super) accumulator: Option<Arc<BatchAccumulator>>,
    pub(super) history_queue: Option<Arc<JobQueue>>,
    pub(super) latest_queue: Option<Arc<JobQueue>>,
}

impl Gateway {
    /// Create a new gateway in `Created` state. Call
    /// [`start()`](Self::start) to connect the store and spawn workers.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(GatewayState::Created);
        Self {
            processor: Processor::new(&config),
            config,
            state: state_tx,
            state_rx,
            events: Arc::new(EventBus::new()),
            store: None,
            accumulator: None,
            history_queue: None,
            latest_queue: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> GatewayState {
        *self.state_rx.borrow()
    }

    /// A receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<GatewayState> {
        self.state_rx.clone()
    }

    /// Whether submissions are currently accepted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), GatewayState::Ready | GatewayState::Running)
    }

    /// The event bus, for observability subscribers.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The underlying store, once started. Downstream consumers drain the
    /// global history directly from here.
    #[must_use]
    pub fn store(&self) -> Option<&Arc<dyn PositionStore>> {
        self.store.as_ref()
    }

    // --- Ingestion ---

    /// Process and buffer one raw record.
    ///
    /// Returns the per-record outcome; an invalid record surfaces as
    /// [`GatewayError::Invalid`] with the full reason list.
    #[tracing::instrument(skip(self, raw))]
    pub fn submit(&self, raw: &RawPosition) -> Result<SubmitOutcome, GatewayError> {
        let accumulator = self.require_accepting()?;
        match self.processor.process(raw)? {
            ProcessOutcome::Accepted(position) => {
                self.events.publish(GatewayEvent::PositionProcessed {
                    device_id: position.device_id.clone(),
                    duplicate: false,
                });
                accumulator.submit(position);
                Ok(SubmitOutcome::Processed)
            }
            ProcessOutcome::Duplicate => {
                self.events.publish(GatewayEvent::PositionProcessed {
                    device_id: raw.device_id.clone().unwrap_or_default(),
                    duplicate: true,
                });
                Ok(SubmitOutcome::Duplicate)
            }
        }
    }

    /// Process and buffer a batch of up to [`MAX_SUBMIT_BATCH`] records.
    ///
    /// Per-record failures do not fail the batch; the report's counts
    /// always partition the input.
    #[tracing::instrument(skip(self, raws), fields(count = raws.len()))]
    pub fn submit_batch(&self, raws: &[RawPosition]) -> Result<BatchSubmitReport, GatewayError> {
        let accumulator = self.require_accepting()?;
        if raws.len() > MAX_SUBMIT_BATCH {
            return Err(GatewayError::Config(format!(
                "batch of {} exceeds the {} record limit",
                raws.len(),
                MAX_SUBMIT_BATCH
            )));
        }

        let outcome = self.processor.process_batch(raws);
        let mut report = BatchSubmitReport {
            processed_count: outcome.accepted.len(),
            duplicate_count: outcome.duplicate_count,
            errors: outcome
                .errors
                .into_iter()
                .map(|(index, invalid)| BatchErrorEntry {
                    index,
                    reasons: invalid.issues,
                })
                .collect(),
        };
        report.errors.sort_by_key(|e| e.index);

        for position in outcome.accepted {
            self.events.publish(GatewayEvent::PositionProcessed {
                device_id: position.device_id.clone(),
                duplicate: false,
            });
            accumulator.submit(position);
        }
        debug!(
            processed = report.processed_count,
            duplicates = report.duplicate_count,
            errors = report.errors.len(),
            "Batch submission processed"
        );
        Ok(report)
    }

    // --- Reads ---

    /// Latest stored record for one device, or `None`.
    pub async fn get_latest(&self, device_id: &str) -> Result<Option<LatestRecord>, GatewayError> {
        Ok(self.require_store()?.get_latest(device_id).await?)
    }

    /// Latest stored records for a list of devices; missing devices are
    /// omitted from the result.
    pub async fn get_latest_many(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<LatestRecord>, GatewayError> {
        Ok(self.require_store()?.get_latest_many(device_ids).await?)
    }

    /// Aggregated statistics across all components.
    pub async fn stats(&self) -> Result<GatewayStats, GatewayError> {
        let accumulator = self.require_accepting()?;
        let store = self.require_store()?;
        Ok(GatewayStats {
            accumulator: accumulator.stats(),
            history_queue: self.require_queue(&self.history_queue)?.stats(),
            latest_queue: self.require_queue(&self.latest_queue)?.stats(),
            store: store.stats().await?,
            duplicate_cache_len: self.processor.cache_len(),
        })
    }

    // --- Internal helpers ---

    fn require_accepting(&self) -> Result<&Arc<BatchAccumulator>, GatewayError> {
        if !self.is_ready() {
            return Err(GatewayError::NotAccepting(self.state()));
        }
        self.accumulator
            .as_ref()
            .ok_or(GatewayError::NotAccepting(GatewayState::Created))
    }

    pub(super) fn require_store(&self) -> Result<&Arc<dyn PositionStore>, GatewayError> {
        self.store
            .as_ref()
            .ok_or(GatewayError::NotAccepting(GatewayState::Created))
    }

    pub(super) fn require_queue<'a>(
        &self,
        queue: &'a Option<Arc<JobQueue>>,
    ) -> Result<&'a Arc<JobQueue>, GatewayError> {
        queue
            .as_ref()
            .ok_or(GatewayError::NotAccepting(GatewayState::Created))
    }
}
