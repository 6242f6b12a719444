//! Dual in-memory batch accumulation.
//!
//! The accumulator holds two shapes between flushes: an ordered history
//! buffer (every accepted position, source order preserved) and a latest map
//! (one position per device, greatest timestamp wins). Flushing swaps the
//! live structure for a fresh one under a short lock, then enqueues the
//! swapped-out data outside the lock, so submitters are never blocked by
//! the enqueue path.
//!
//! At most one flush cycle runs at a time; timer and size triggers that
//! arrive during a cycle are coalesced. When an enqueue fails the swapped
//! data is restored — history is prepended back in order, latest entries
//! are reinserted only where the map does not already hold a newer fix —
//! and the next trigger retries.

use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{generate_batch_id, BatchKind};
use crate::events::{EventBus, GatewayEvent};
use crate::position::Position;
use crate::queue::{BatchSink, JobPayload, QueueError};

/// Why a flush cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Batch interval elapsed
    Timer,
    /// History buffer reached the size trigger
    Size,
    /// Explicit force_flush call
    Force,
    /// Final flush during shutdown
    Shutdown,
}

/// Counts flushed by a completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub history_flushed: usize,
    pub latest_flushed: usize,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct AccumulatorStats {
    pub history_pending: usize,
    pub latest_pending: usize,
    pub flushes: u64,
    pub enqueue_failures: u64,
}

pub struct BatchAccumulator {
    max_batch_size: usize,
    history: PlMutex<Vec<Position>>,
    latest: PlMutex<HashMap<String, Position>>,
    /// Held for the duration of a flush cycle; triggers coalesce on it
    flush_cycle: Mutex<()>,
    size_flush_scheduled: AtomicBool,
    history_sink: Arc<dyn BatchSink>,
    latest_sink: Arc<dyn BatchSink>,
    events: Arc<EventBus>,
    flushes: AtomicU64,
    enqueue_failures: AtomicU64,
}

impl BatchAccumulator {
    pub fn new(
        max_batch_size: usize,
        history_sink: Arc<dyn BatchSink>,
        latest_sink: Arc<dyn BatchSink>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_batch_size: max_batch_size.max(1),
            history: PlMutex::new(Vec::new()),
            latest: PlMutex::new(HashMap::new()),
            flush_cycle: Mutex::new(()),
            size_flush_scheduled: AtomicBool::new(false),
            history_sink,
            latest_sink,
            events,
            flushes: AtomicU64::new(0),
            enqueue_failures: AtomicU64::new(0),
        })
    }

    /// Add an accepted position to both shapes.
    ///
    /// Non-suspending; the only locks taken are short buffer appends. When
    /// the history buffer reaches the size trigger a flush is scheduled on
    /// a separate task so the submitter is not blocked.
    pub fn submit(self: &Arc<Self>, position: Position) {
        let history_len = {
            let mut history = self.history.lock();
            history.push(position.clone());
            history.len()
        };
        {
            let mut latest = self.latest.lock();
            match latest.get(&position.device_id) {
                // Strictly-greater keeps the existing fix; an equal
                // timestamp is replaced (later arrival wins)
                Some(existing) if existing.timestamp > position.timestamp => {}
                _ => {
                    latest.insert(position.device_id.clone(), position);
                }
            }
        }
        crate::metrics::set_accumulator_depth("hist", history_len);

        if history_len >= self.max_batch_size
            && !self.size_flush_scheduled.swap(true, Ordering::AcqRel)
        {
            let this = self.clone();
            tokio::spawn(async move {
                let _cycle = this.flush_cycle.lock().await;
                this.size_flush_scheduled.store(false, Ordering::Release);
                if let Err(err) = this.flush_history(FlushReason::Size) {
                    warn!(error = %err, "Size-triggered flush failed, buffer restored");
                }
            });
        }
    }

    /// Flush both shapes, waiting for any in-progress cycle first. The
    /// error of a failed enqueue surfaces to the caller; the data stays
    /// buffered for the next trigger.
    pub async fn force_flush(&self) -> Result<FlushReport, QueueError> {
        let _cycle = self.flush_cycle.lock().await;
        self.flush_both(FlushReason::Force)
    }

    /// Timer-driven flush. Coalesces: if a cycle is already in progress
    /// this tick is skipped. Failures are logged, not surfaced — the
    /// restored buffers retry on the next tick.
    pub async fn flush_tick(&self) {
        let Ok(_cycle) = self.flush_cycle.try_lock() else {
            debug!("Flush already in progress, tick coalesced");
            return;
        };
        if let Err(err) = self.flush_both(FlushReason::Timer) {
            warn!(error = %err, "Timer flush failed, batches restored for next tick");
        }
    }

    /// Final flush during shutdown; returns what is still pending after.
    pub async fn shutdown(&self) -> AccumulatorStats {
        let _cycle = self.flush_cycle.lock().await;
        if let Err(err) = self.flush_both(FlushReason::Shutdown) {
            warn!(error = %err, "Shutdown flush failed, positions remain unflushed");
        }
        self.stats()
    }

    #[must_use]
    pub fn stats(&self) -> AccumulatorStats {
        AccumulatorStats {
            history_pending: self.history.lock().len(),
            latest_pending: self.latest.lock().len(),
            flushes: self.flushes.load(Ordering::Acquire),
            enqueue_failures: self.enqueue_failures.load(Ordering::Acquire),
        }
    }

    /// Drop both buffers without flushing. Admin/test hook.
    pub fn clear(&self) {
        self.history.lock().clear();
        self.latest.lock().clear();
        crate::metrics::set_accumulator_depth("hist", 0);
        crate::metrics::set_accumulator_depth("latest", 0);
    }

    fn flush_both(&self, reason: FlushReason) -> Result<FlushReport, QueueError> {
        let history = self.flush_history(reason);
        let latest = self.flush_latest(reason);
        match (history, latest) {
            (Ok(history_flushed), Ok(latest_flushed)) => Ok(FlushReport {
                history_flushed,
                latest_flushed,
            }),
            (Err(err), _) | (_, Err(err)) => Err(err),
        }
    }

    fn flush_history(&self, reason: FlushReason) -> Result<usize, QueueError> {
        let swapped = { std::mem::take(&mut *self.history.lock()) };
        if swapped.is_empty() {
            return Ok(0);
        }

        let batch_id = generate_batch_id(BatchKind::History);
        let count = swapped.len();
        let payload = JobPayload::new(batch_id.clone(), swapped.clone());

        match self.history_sink.enqueue(payload) {
            Ok(()) => {
                self.flushes.fetch_add(1, Ordering::AcqRel);
                crate::metrics::record_flush("hist", count);
                crate::metrics::set_accumulator_depth("hist", self.history.lock().len());
                self.events.publish(GatewayEvent::BatchFlushed {
                    kind: "hist",
                    batch_id: batch_id.clone(),
                    count,
                });
                debug!(batch_id = %batch_id, count, ?reason, "History batch enqueued");
                Ok(count)
            }
            Err(err) => {
                self.enqueue_failures.fetch_add(1, Ordering::AcqRel);
                crate::metrics::record_enqueue_failure("hist");
                // Prepend the swapped data so source order survives the retry
                let mut history = self.history.lock();
                let mut restored = swapped;
                restored.extend(history.drain(..));
                *history = restored;
                warn!(count, ?reason, error = %err, "History enqueue failed, buffer restored");
                Err(err)
            }
        }
    }

    fn flush_latest(&self, reason: FlushReason) -> Result<usize, QueueError> {
        let swapped = { std::mem::take(&mut *self.latest.lock()) };
        if swapped.is_empty() {
            return Ok(0);
        }

        let batch_id = generate_batch_id(BatchKind::Latest);
        let count = swapped.len();
        let positions: Vec<Position> = swapped.values().cloned().collect();
        let payload = JobPayload::new(batch_id.clone(), positions);

        match self.latest_sink.enqueue(payload) {
            Ok(()) => {
                self.flushes.fetch_add(1, Ordering::AcqRel);
                crate::metrics::record_flush("latest", count);
                self.events.publish(GatewayEvent::BatchFlushed {
                    kind: "latest",
                    batch_id: batch_id.clone(),
                    count,
                });
                debug!(batch_id = %batch_id, count, ?reason, "Latest batch enqueued");
                Ok(count)
            }
            Err(err) => {
                self.enqueue_failures.fetch_add(1, Ordering::AcqRel);
                crate::metrics::record_enqueue_failure("latest");
                // Reinsert only where the live map does not hold a newer fix
                let mut latest = self.latest.lock();
                for (device, position) in swapped {
                    match latest.get(&device) {
                        Some(current) if current.timestamp >= position.timestamp => {}
                        _ => {
                            latest.insert(device, position);
                        }
                    }
                }
                warn!(count, ?reason, error = %err, "Latest enqueue failed, map restored");
                Err(err)
            }
        }
    }
}
