// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local pub/sub for observability hooks.
//!
//! The bus is informational only: delivery is best-effort and synchronous
//! to the publisher, and a misbehaving subscriber can never fail the main
//! path (a subscriber whose channel is closed is silently dropped from the
//! list). Correctness-critical signals — flush scheduling, shutdown — go
//! through explicit method calls, never through here.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::mpsc;

/// Topic names, as seen by subscribers.
pub mod topics {
    pub const POSITION_PROCESSED: &str = "position.processed";
    pub const BATCH_FLUSHED: &str = "batch.flushed";
    pub const QUEUE_COMPLETED: &str = "queue.completed";
    pub const QUEUE_FAILED: &str = "queue.failed";
    pub const STORE_WRITTEN: &str = "store.written";
    pub const STORE_CLEANED: &str = "store.cleaned";
    pub const APP_SHUTDOWN: &str = "app.shutdown";
}

/// An event published on the gateway bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    PositionProcessed {
        device_id: String,
        duplicate: bool,
    },
    BatchFlushed {
        kind: &'static str,
        batch_id: String,
        count: usize,
    },
    QueueCompleted {
        queue: &'static str,
        batch_id: String,
        attempts: usize,
    },
    QueueFailed {
        queue: &'static str,
        batch_id: String,
        attempts: usize,
        error: String,
    },
    StoreWritten {
        kind: &'static str,
        batch_id: String,
        count: usize,
    },
    StoreCleaned {
        history_trimmed: usize,
        latest_deleted: usize,
    },
    AppShutdown,
}

impl GatewayEvent {
    /// The topic this event is published under.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Self::PositionProcessed { .. } => topics::POSITION_PROCESSED,
            Self::BatchFlushed { .. } => topics::BATCH_FLUSHED,
            Self::QueueCompleted { .. } => topics::QUEUE_COMPLETED,
            Self::QueueFailed { .. } => topics::QUEUE_FAILED,
            Self::StoreWritten { .. } => topics::STORE_WRITTEN,
            Self::StoreCleaned { .. } => topics::STORE_CLEANED,
            Self::AppShutdown => topics::APP_SHUTDOWN,
        }
    }
}

/// A published event with its envelope.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub topic: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GatewayEvent,
}

/// Broadcast event bus supporting multiple subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    senders: Mutex<Vec<mpsc::Sender<EventEnvelope>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to receive all gateway events.
    pub fn subscribe(&self) -> mpsc::Receiver<EventEnvelope> {
        let (tx, rx) = mpsc::channel();
        self.senders.lock().push(tx);
        rx
    }

    /// Publish an event to all subscribers. Never fails into the caller;
    /// subscribers that have gone away are pruned.
    pub fn publish(&self, event: GatewayEvent) {
        let envelope = EventEnvelope {
            topic: event.topic(),
            timestamp: Utc::now(),
            event,
        };
        let mut senders = self.senders.lock();
        senders.retain(|sender| sender.send(envelope.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}
