//! Metrics instrumentation for the gateway.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `gateway_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `status`: accepted, duplicate, invalid / success, failed
//! - `kind`: hist, latest
//! - `queue`: history, latest

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record the outcome of processing one raw record
pub fn record_processed(status: &str) {
    counter!(
        "gateway_positions_processed_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a batch flush and its size
pub fn record_flush(kind: &str, count: usize) {
    counter!(
        "gateway_batches_flushed_total",
        "kind" => kind.to_string()
    )
    .increment(1);
    histogram!(
        "gateway_batch_size",
        "kind" => kind.to_string()
    )
    .record(count as f64);
}

/// Record a failed enqueue (batch restored to its accumulator)
pub fn record_enqueue_failure(kind: &str) {
    counter!(
        "gateway_enqueue_failures_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a job's terminal outcome
pub fn record_job(queue: &str, status: &str) {
    counter!(
        "gateway_jobs_total",
        "queue" => queue.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record how many attempts a job took before its terminal outcome
pub fn record_job_attempts(queue: &str, attempts: usize) {
    histogram!(
        "gateway_job_attempts",
        "queue" => queue.to_string()
    )
    .record(attempts as f64);
}

/// Set current queue depth (jobs waiting to start)
pub fn set_queue_depth(queue: &str, depth: usize) {
    gauge!(
        "gateway_queue_depth",
        "queue" => queue.to_string()
    )
    .set(depth as f64);
}

/// Record a successful store write and its latency
pub fn record_store_write(kind: &str, count: usize, duration: Duration) {
    counter!(
        "gateway_positions_written_total",
        "kind" => kind.to_string()
    )
    .increment(count as u64);
    histogram!(
        "gateway_store_write_seconds",
        "kind" => kind.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set current accumulator depth (positions held in memory)
pub fn set_accumulator_depth(kind: &str, depth: usize) {
    gauge!(
        "gateway_accumulator_depth",
        "kind" => kind.to_string()
    )
    .set(depth as f64);
}

/// Record what a cleanup pass removed
pub fn record_cleanup(history_trimmed: usize, latest_deleted: usize) {
    counter!("gateway_cleanup_history_trimmed_total").increment(history_trimmed as u64);
    counter!("gateway_cleanup_latest_deleted_total").increment(latest_deleted as u64);
}
