// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable work queues between the accumulator and the store.
//!
//! Two named queues (`history`, `latest`) each own a bounded pool of worker
//! tasks draining a FIFO channel. A job is a full batch payload; delivery is
//! at-least-once from the queue's perspective: each job gets up to
//! `max_attempts` tries with exponential backoff and a per-attempt deadline,
//! then is dead-lettered for inspection. Priority across the queues is
//! concurrency shaping only — per-queue FIFO order is never reordered.
//!
//! Enqueue never blocks the caller beyond recording the job.

pub mod handlers;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as PlMutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::events::{EventBus, GatewayEvent};
use crate::position::Position;
use crate::storage::StoreError;

/// One batch, encoded for delivery to the store.
#[derive(Debug, Clone)]
pub struct JobPayload {
    pub batch_id: String,
    pub positions: Vec<Position>,
    pub count: usize,
    pub created_at: DateTime<Utc>,
}

impl JobPayload {
    #[must_use]
    pub fn new(batch_id: String, positions: Vec<Position>) -> Self {
        let count = positions.len();
        Self {
            batch_id,
            positions,
            count,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' is closed")]
    Closed(&'static str),
}

/// Delivers one payload to its destination. Implemented by the store
/// writers; test doubles implement it to inject failures.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: &JobPayload) -> Result<(), StoreError>;
}

/// The enqueue side of a queue, as seen by the accumulator.
pub trait BatchSink: Send + Sync {
    fn enqueue(&self, payload: JobPayload) -> Result<(), QueueError>;
}

/// Per-queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: &'static str,
    pub concurrency: usize,
    pub max_attempts: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub attempt_timeout: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl QueueConfig {
    /// The history queue: higher concurrency, slower backoff.
    #[must_use]
    pub fn history(config: &GatewayConfig) -> Self {
        Self {
            name: "history",
            concurrency: config.history_queue_concurrency,
            max_attempts: config.job_max_attempts,
            backoff_base: Duration::from_millis(config.history_backoff_base_ms),
            backoff_max: Duration::from_secs(60),
            attempt_timeout: Duration::from_millis(config.job_attempt_timeout_ms),
            keep_completed: config.keep_completed_history,
            keep_failed: config.keep_failed_history,
        }
    }

    /// The latest queue: fewer workers, faster backoff (real-time reads
    /// want fresh data sooner).
    #[must_use]
    pub fn latest(config: &GatewayConfig) -> Self {
        Self {
            name: "latest",
            concurrency: config.latest_queue_concurrency,
            max_attempts: config.job_max_attempts,
            backoff_base: Duration::from_millis(config.latest_backoff_base_ms),
            backoff_max: Duration::from_secs(60),
            attempt_timeout: Duration::from_millis(config.job_attempt_timeout_ms),
            keep_completed: config.keep_completed_latest,
            keep_failed: config.keep_failed_latest,
        }
    }
}

/// Terminal record of a finished job, kept for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub batch_id: String,
    pub count: usize,
    pub attempts: usize,
    pub finished_at: DateTime<Utc>,
    /// Present on dead-lettered jobs
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: &'static str,
    pub pending: usize,
    pub active: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub dead_letter_len: usize,
}

impl QueueStats {
    /// All-zero stats for a queue that has not been started.
    #[must_use]
    pub fn empty(name: &'static str) -> Self {
        Self {
            name,
            pending: 0,
            active: 0,
            completed_total: 0,
            failed_total: 0,
            dead_letter_len: 0,
        }
    }
}

struct QueueShared {
    name: &'static str,
    closed: AtomicBool,
    pending: AtomicUsize,
    active: AtomicUsize,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    completed: PlMutex<VecDeque<JobRecord>>,
    dead_letter: PlMutex<VecDeque<JobRecord>>,
}

impl QueueShared {
    fn push_bounded(ring: &PlMutex<VecDeque<JobRecord>>, record: JobRecord, cap: usize) {
        let mut ring = ring.lock();
        ring.push_back(record);
        while ring.len() > cap {
            ring.pop_front();
        }
    }
}

/// A named queue with its worker pool.
pub struct JobQueue {
    config: QueueConfig,
    tx: mpsc::UnboundedSender<JobPayload>,
    shared: Arc<QueueShared>,
    workers: PlMutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Create the queue and spawn its worker pool. Requires a running
    /// tokio runtime.
    pub fn start(
        config: QueueConfig,
        handler: Arc<dyn JobHandler>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(QueueShared {
            name: config.name,
            closed: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            completed: PlMutex::new(VecDeque::new()),
            dead_letter: PlMutex::new(VecDeque::new()),
        });

        let mut workers = Vec::with_capacity(config.concurrency);
        for worker_id in 0..config.concurrency {
            workers.push(tokio::spawn(Self::worker_loop(
                worker_id,
                config.clone(),
                rx.clone(),
                shared.clone(),
                handler.clone(),
                events.clone(),
            )));
        }
        info!(queue = config.name, workers = config.concurrency, "Job queue started");

        Arc::new(Self {
            config,
            tx,
            shared,
            workers: PlMutex::new(workers),
        })
    }

    async fn worker_loop(
        worker_id: usize,
        config: QueueConfig,
        rx: Arc<Mutex<mpsc::UnboundedReceiver<JobPayload>>>,
        shared: Arc<QueueShared>,
        handler: Arc<dyn JobHandler>,
        events: Arc<EventBus>,
    ) {
        loop {
            // Lock scope ends before the job runs, so other workers keep
            // draining while this one is busy.
            let payload = { rx.lock().await.recv().await };
            let Some(payload) = payload else {
                debug!(queue = config.name, worker_id, "Channel closed, worker exiting");
                break;
            };
            shared.active.fetch_add(1, Ordering::AcqRel);
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            crate::metrics::set_queue_depth(config.name, shared.pending.load(Ordering::Acquire));

            let (attempts, result) = Self::run_attempts(&config, &*handler, &payload).await;

            let record = JobRecord {
                batch_id: payload.batch_id.clone(),
                count: payload.count,
                attempts,
                finished_at: Utc::now(),
                error: result.as_ref().err().map(ToString::to_string),
            };

            match result {
                Ok(()) => {
                    shared.completed_total.fetch_add(1, Ordering::AcqRel);
                    QueueShared::push_bounded(&shared.completed, record, config.keep_completed);
                    crate::metrics::record_job(config.name, "success");
                    events.publish(GatewayEvent::QueueCompleted {
                        queue: config.name,
                        batch_id: payload.batch_id.clone(),
                        attempts,
                    });
                    debug!(
                        queue = config.name,
                        batch_id = %payload.batch_id,
                        attempts,
                        "Job completed"
                    );
                }
                Err(err) => {
                    shared.failed_total.fetch_add(1, Ordering::AcqRel);
                    QueueShared::push_bounded(&shared.dead_letter, record, config.keep_failed);
                    crate::metrics::record_job(config.name, "failed");
                    events.publish(GatewayEvent::QueueFailed {
                        queue: config.name,
                        batch_id: payload.batch_id.clone(),
                        attempts,
                        error: err.to_string(),
                    });
                    warn!(
                        queue = config.name,
                        batch_id = %payload.batch_id,
                        attempts,
                        error = %err,
                        "Job dead-lettered after final attempt"
                    );
                }
            }
            crate::metrics::record_job_attempts(config.name, attempts);
            shared.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Run one job to its terminal outcome: up to `max_attempts` tries with
    /// exponential backoff; an attempt that outlives its deadline counts as
    /// a failure.
    async fn run_attempts(
        config: &QueueConfig,
        handler: &dyn JobHandler,
        payload: &JobPayload,
    ) -> (usize, Result<(), StoreError>) {
        let mut delay = config.backoff_base;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match timeout(config.attempt_timeout, handler.run(payload)).await {
                Ok(Ok(())) => return (attempt, Ok(())),
                Ok(Err(err)) => err,
                Err(_) => StoreError::Backend(format!(
                    "attempt exceeded {:?} deadline",
                    config.attempt_timeout
                )),
            };

            if attempt >= config.max_attempts {
                return (attempt, Err(outcome));
            }

            debug!(
                queue = config.name,
                batch_id = %payload.batch_id,
                attempt,
                error = %outcome,
                "Attempt failed, backing off"
            );
            sleep(delay).await;
            delay = (delay * 2).min(config.backoff_max);
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.config.name
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.shared.name,
            pending: self.shared.pending.load(Ordering::Acquire),
            active: self.shared.active.load(Ordering::Acquire),
            completed_total: self.shared.completed_total.load(Ordering::Acquire),
            failed_total: self.shared.failed_total.load(Ordering::Acquire),
            dead_letter_len: self.shared.dead_letter.lock().len(),
        }
    }

    /// Recently completed jobs, oldest first.
    #[must_use]
    pub fn completed(&self) -> Vec<JobRecord> {
        self.shared.completed.lock().iter().cloned().collect()
    }

    /// Dead-lettered jobs, oldest first.
    #[must_use]
    pub fn dead_letter(&self) -> Vec<JobRecord> {
        self.shared.dead_letter.lock().iter().cloned().collect()
    }

    /// Resolve when no jobs are pending or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let pending = self.shared.pending.load(Ordering::Acquire);
            let active = self.shared.active.load(Ordering::Acquire);
            if pending == 0 && active == 0 {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop intake, drain in-flight work within `deadline`, then abort
    /// whatever remains. Returns the final stats snapshot.
    pub async fn shutdown(&self, deadline: Duration) -> QueueStats {
        self.shared.closed.store(true, Ordering::Release);
        if timeout(deadline, self.wait_idle()).await.is_err() {
            warn!(
                queue = self.config.name,
                pending = self.shared.pending.load(Ordering::Acquire),
                active = self.shared.active.load(Ordering::Acquire),
                "Shutdown deadline hit, abandoning in-flight jobs"
            );
        }
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        info!(queue = self.config.name, "Job queue stopped");
        self.stats()
    }
}

impl BatchSink for JobQueue {
    fn enqueue(&self, payload: JobPayload) -> Result<(), QueueError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.config.name));
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(payload).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(QueueError::Closed(self.config.name));
        }
        crate::metrics::set_queue_depth(
            self.config.name,
            self.shared.pending.load(Ordering::Acquire),
        );
        Ok(())
    }
}
