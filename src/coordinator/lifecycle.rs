//! Gateway lifecycle: start, run loop, force-flush, cleanup, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::batching::{AccumulatorStats, BatchAccumulator, FlushReport};
use crate::events::GatewayEvent;
use crate::queue::handlers::{HistoryWriteHandler, LatestWriteHandler};
use crate::queue::{BatchSink, JobQueue, QueueConfig, QueueStats};
use crate::storage::{
    CleanupReport, MemoryPositionStore, PositionStore, RedisPositionStore, StorePolicy,
};

use super::{Gateway, GatewayError, GatewayState, HealthCheck, ShutdownReport};

impl Gateway {
    /// Connect the store, spawn the queue workers, and wire the
    /// accumulator. A failure here is fatal: the configuration is wrong or
    /// the store is unreachable.
    #[tracing::instrument(skip(self), fields(has_redis = self.config.redis_url.is_some()))]
    pub async fn start(&mut self) -> Result<(), GatewayError> {
        info!("Starting gateway...");
        self.config.validate().map_err(GatewayError::Config)?;
        let _ = self.state.send(GatewayState::Connecting);

        let policy = StorePolicy::from_config(&self.config);
        let store: Arc<dyn PositionStore> = match self.config.redis_url {
            Some(ref url) => {
                info!(url = %url, prefix = ?self.config.key_prefix, "Connecting to Redis store...");
                let store = RedisPositionStore::with_prefix(
                    url,
                    self.config.key_prefix.as_deref(),
                    policy,
                )
                .await?;
                let store: Arc<dyn PositionStore> = Arc::new(store);
                store.ping().await?;
                info!("Redis store connected");
                store
            }
            None => {
                warn!("No redis_url configured - using the in-process store");
                Arc::new(MemoryPositionStore::new(policy))
            }
        };

        let history_queue = JobQueue::start(
            QueueConfig::history(&self.config),
            Arc::new(HistoryWriteHandler::new(store.clone(), self.events.clone())),
            self.events.clone(),
        );
        let latest_queue = JobQueue::start(
            QueueConfig::latest(&self.config),
            Arc::new(LatestWriteHandler::new(store.clone(), self.events.clone())),
            self.events.clone(),
        );

        self.accumulator = Some(BatchAccumulator::new(
            self.config.batch_max_size,
            history_queue.clone() as Arc<dyn BatchSink>,
            latest_queue.clone() as Arc<dyn BatchSink>,
            self.events.clone(),
        ));
        self.store = Some(store);
        self.history_queue = Some(history_queue);
        self.latest_queue = Some(latest_queue);

        let _ = self.state.send(GatewayState::Ready);
        info!("Gateway ready");
        Ok(())
    }

    /// Run the batch timer until shutdown. The timer drives the flush of
    /// both accumulator shapes every `batch_interval_ms`.
    #[tracing::instrument(skip(self))]
    pub async fn run(&mut self) {
        let _ = self.state.send(GatewayState::Running);
        info!(interval_ms = self.config.batch_interval_ms, "Gateway running");

        let mut flush_interval = tokio::time::interval(Duration::from_millis(
            self.config.batch_interval_ms,
        ));
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state_rx = self.state_rx.clone();

        loop {
            tokio::select! {
                _ = flush_interval.tick() => {
                    self.tick().await;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() == GatewayState::ShuttingDown {
                        break;
                    }
                }
            }
        }
    }

    /// One maintenance tick: timer-flush both accumulator shapes.
    /// Exposed for manual control instead of the run loop.
    pub async fn tick(&self) {
        if let Some(ref accumulator) = self.accumulator {
            accumulator.flush_tick().await;
        }
    }

    /// Flush both batches now. The caller sees any enqueue failure; the
    /// data stays buffered for the next trigger.
    pub async fn force_flush(&self) -> Result<FlushReport, GatewayError> {
        match self.accumulator {
            Some(ref accumulator) => Ok(accumulator.force_flush().await?),
            None => Err(GatewayError::NotAccepting(self.state())),
        }
    }

    /// Resolve when both queues have no pending or in-flight jobs.
    /// Useful for tests and flush-then-wait embedding patterns.
    pub async fn drain(&self) {
        if let Some(ref queue) = self.history_queue {
            queue.wait_idle().await;
        }
        if let Some(ref queue) = self.latest_queue {
            queue.wait_idle().await;
        }
    }

    /// Enforce retention and, when configured, evict inactive devices.
    pub async fn cleanup(&self) -> Result<CleanupReport, GatewayError> {
        let report = self.require_store()?.cleanup().await?;
        crate::metrics::record_cleanup(report.history_trimmed, report.latest_deleted);
        self.events.publish(GatewayEvent::StoreCleaned {
            history_trimmed: report.history_trimmed,
            latest_deleted: report.latest_deleted,
        });
        info!(
            history_trimmed = report.history_trimmed,
            latest_deleted = report.latest_deleted,
            "Cleanup complete"
        );
        Ok(report)
    }

    /// Aggregate component health. The store check is a live probe; the
    /// rest is cached state.
    pub async fn health(&self) -> HealthCheck {
        let (store_connected, store_latency_ms) = match self.store {
            Some(ref store) => {
                let probe_start = Instant::now();
                match store.ping().await {
                    Ok(()) => (true, Some(probe_start.elapsed().as_millis() as u64)),
                    Err(err) => {
                        warn!(error = %err, "Store health probe failed");
                        (false, None)
                    }
                }
            }
            None => (false, None),
        };

        let ready = self.is_ready();
        HealthCheck {
            state: self.state(),
            ready,
            store_connected,
            store_latency_ms,
            accumulator: self
                .accumulator
                .as_ref()
                .map(|a| a.stats())
                .unwrap_or_default(),
            history_queue: self
                .history_queue
                .as_ref()
                .map(|q| q.stats())
                .unwrap_or_else(|| QueueStats::empty("history")),
            latest_queue: self
                .latest_queue
                .as_ref()
                .map(|q| q.stats())
                .unwrap_or_else(|| QueueStats::empty("latest")),
            duplicate_cache_len: self.processor.cache_len(),
            healthy: ready && store_connected,
        }
    }

    /// Graceful shutdown: stop intake, flush both batches, drain the
    /// queues within the configured deadline, then stop the workers.
    /// Strictly leaves-first: accumulator → queue workers → store.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Initiating gateway shutdown...");
        let _ = self.state.send(GatewayState::ShuttingDown);
        self.events.publish(GatewayEvent::AppShutdown);

        let deadline = Duration::from_millis(self.config.shutdown_deadline_ms);
        let started = Instant::now();

        let accumulator_stats = match self.accumulator {
            Some(ref accumulator) => accumulator.shutdown().await,
            None => AccumulatorStats::default(),
        };
        if accumulator_stats.history_pending > 0 || accumulator_stats.latest_pending > 0 {
            warn!(
                history = accumulator_stats.history_pending,
                latest = accumulator_stats.latest_pending,
                "Positions remained unflushed at shutdown"
            );
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        let history_queue = match self.history_queue {
            Some(ref queue) => queue.shutdown(remaining).await,
            None => QueueStats::empty("history"),
        };
        let remaining = deadline.saturating_sub(started.elapsed());
        let latest_queue = match self.latest_queue {
            Some(ref queue) => queue.shutdown(remaining).await,
            None => QueueStats::empty("latest"),
        };

        info!("Gateway shutdown complete");
        ShutdownReport {
            unflushed_history: accumulator_stats.history_pending,
            unflushed_latest: accumulator_stats.latest_pending,
            history_queue,
            latest_queue,
        }
    }
}
