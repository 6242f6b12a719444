//! Store-writer handlers for the two queues.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::{JobHandler, JobPayload};
use crate::events::{EventBus, GatewayEvent};
use crate::storage::{PositionStore, StoreError};

/// Appends a batch to the global history list.
pub struct HistoryWriteHandler {
    store: Arc<dyn PositionStore>,
    events: Arc<EventBus>,
}

impl HistoryWriteHandler {
    pub fn new(store: Arc<dyn PositionStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }
}

#[async_trait]
impl JobHandler for HistoryWriteHandler {
    async fn run(&self, payload: &JobPayload) -> Result<(), StoreError> {
        let start = Instant::now();
        let written = self
            .store
            .write_history_batch(&payload.batch_id, &payload.positions)
            .await?;
        crate::metrics::record_store_write("hist", written, start.elapsed());
        self.events.publish(GatewayEvent::StoreWritten {
            kind: "hist",
            batch_id: payload.batch_id.clone(),
            count: written,
        });
        debug!(batch_id = %payload.batch_id, written, "History batch persisted");
        Ok(())
    }
}

/// Overwrites per-device latest records.
pub struct LatestWriteHandler {
    store: Arc<dyn PositionStore>,
    events: Arc<EventBus>,
}

impl LatestWriteHandler {
    pub fn new(store: Arc<dyn PositionStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }
}

#[async_trait]
impl JobHandler for LatestWriteHandler {
    async fn run(&self, payload: &JobPayload) -> Result<(), StoreError> {
        let start = Instant::now();
        let written = self.store.write_latest(&payload.positions).await?;
        crate::metrics::record_store_write("latest", written, start.elapsed());
        self.events.publish(GatewayEvent::StoreWritten {
            kind: "latest",
            batch_id: payload.batch_id.clone(),
            count: written,
        });
        debug!(batch_id = %payload.batch_id, written, "Latest records persisted");
        Ok(())
    }
}
