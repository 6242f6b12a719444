//! Configuration for the gateway.
//!
//! # Example
//!
//! ```
//! use gps_gateway::GatewayConfig;
//!
//! // Minimal config (uses defaults)
//! let config = GatewayConfig::default();
//! assert_eq!(config.batch_max_size, 100);
//!
//! // Full config
//! let config = GatewayConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     batch_interval_ms: 5_000,
//!     max_history_entries: 50_000,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use serde::Deserialize;

/// Configuration for the gateway.
///
/// All fields have sensible defaults. At minimum, you should configure
/// `redis_url` for production use; without it the gateway runs against the
/// in-process store.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Optional key prefix for namespacing a shared Redis instance
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Timer period for batch flushes, in milliseconds
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// History buffer size that triggers an immediate flush
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    /// Worker count for the history queue
    #[serde(default = "default_history_queue_concurrency")]
    pub history_queue_concurrency: usize,

    /// Worker count for the latest queue
    #[serde(default = "default_latest_queue_concurrency")]
    pub latest_queue_concurrency: usize,

    /// Attempt cap per queued job
    #[serde(default = "default_job_max_attempts")]
    pub job_max_attempts: usize,

    /// Per-attempt deadline; exceeding it counts as a failed attempt
    #[serde(default = "default_job_attempt_timeout_ms")]
    pub job_attempt_timeout_ms: u64,

    /// Backoff base for history jobs
    #[serde(default = "default_history_backoff_base_ms")]
    pub history_backoff_base_ms: u64,

    /// Backoff base for latest jobs
    #[serde(default = "default_latest_backoff_base_ms")]
    pub latest_backoff_base_ms: u64,

    /// Completed-job records retained per queue
    #[serde(default = "default_keep_completed_history")]
    pub keep_completed_history: usize,
    #[serde(default = "default_keep_completed_latest")]
    pub keep_completed_latest: usize,

    /// Dead-lettered job records retained per queue
    #[serde(default = "default_keep_failed_history")]
    pub keep_failed_history: usize,
    #[serde(default = "default_keep_failed_latest")]
    pub keep_failed_latest: usize,

    /// Retention bound on the global history list
    #[serde(default = "default_max_history_entries")]
    pub max_history_entries: usize,

    /// Duplicate filter settings
    #[serde(default = "default_duplicate_enabled")]
    pub duplicate_enabled: bool,
    #[serde(default = "default_duplicate_time_threshold_ms")]
    pub duplicate_time_threshold_ms: u64,
    #[serde(default = "default_duplicate_coordinate_threshold")]
    pub duplicate_coordinate_threshold: f64,
    #[serde(default = "default_duplicate_cache_size")]
    pub duplicate_cache_size: usize,

    /// Oldest acceptable fix time, relative to now
    #[serde(default = "default_max_position_age_ms")]
    pub max_position_age_ms: u64,

    /// Furthest acceptable future fix time, relative to now
    #[serde(default = "default_max_future_drift_ms")]
    pub max_future_drift_ms: u64,

    /// TTL and inactivity cleanup of latest records
    #[serde(default = "default_cleanup_enabled")]
    pub cleanup_enabled: bool,

    /// Delete latest records idle longer than this during cleanup (unset = keep)
    #[serde(default)]
    pub max_device_inactivity_ms: Option<u64>,

    /// TTL on latest records when cleanup is enabled
    #[serde(default = "default_latest_key_ttl_s")]
    pub latest_key_ttl_s: u64,

    /// Write a per-batch metadata record alongside each history append
    #[serde(default)]
    pub batch_metadata_enabled: bool,

    /// Overall deadline for graceful shutdown
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,

    /// History tail sampled for the device-frequency histogram in stats
    #[serde(default = "default_history_sample_size")]
    pub history_sample_size: usize,
}

fn default_batch_interval_ms() -> u64 { 10_000 }
fn default_batch_max_size() -> usize { 100 }
fn default_history_queue_concurrency() -> usize { 5 }
fn default_latest_queue_concurrency() -> usize { 3 }
fn default_job_max_attempts() -> usize { 3 }
fn default_job_attempt_timeout_ms() -> u64 { 30_000 }
fn default_history_backoff_base_ms() -> u64 { 2_000 }
fn default_latest_backoff_base_ms() -> u64 { 1_000 }
fn default_keep_completed_history() -> usize { 100 }
fn default_keep_completed_latest() -> usize { 50 }
fn default_keep_failed_history() -> usize { 50 }
fn default_keep_failed_latest() -> usize { 25 }
fn default_max_history_entries() -> usize { 100_000 }
fn default_duplicate_enabled() -> bool { true }
fn default_duplicate_time_threshold_ms() -> u64 { 1_000 }
fn default_duplicate_coordinate_threshold() -> f64 { 0.0001 }
fn default_duplicate_cache_size() -> usize { 1_000 }
fn default_max_position_age_ms() -> u64 { 86_400_000 } // 24h
fn default_max_future_drift_ms() -> u64 { 300_000 } // 5min
fn default_cleanup_enabled() -> bool { true }
fn default_latest_key_ttl_s() -> u64 { 604_800 } // 7 days
fn default_shutdown_deadline_ms() -> u64 { 10_000 }
fn default_history_sample_size() -> usize { 100 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: None,
            batch_interval_ms: default_batch_interval_ms(),
            batch_max_size: default_batch_max_size(),
            history_queue_concurrency: default_history_queue_concurrency(),
            latest_queue_concurrency: default_latest_queue_concurrency(),
            job_max_attempts: default_job_max_attempts(),
            job_attempt_timeout_ms: default_job_attempt_timeout_ms(),
            history_backoff_base_ms: default_history_backoff_base_ms(),
            latest_backoff_base_ms: default_latest_backoff_base_ms(),
            keep_completed_history: default_keep_completed_history(),
            keep_completed_latest: default_keep_completed_latest(),
            keep_failed_history: default_keep_failed_history(),
            keep_failed_latest: default_keep_failed_latest(),
            max_history_entries: default_max_history_entries(),
            duplicate_enabled: default_duplicate_enabled(),
            duplicate_time_threshold_ms: default_duplicate_time_threshold_ms(),
            duplicate_coordinate_threshold: default_duplicate_coordinate_threshold(),
            duplicate_cache_size: default_duplicate_cache_size(),
            max_position_age_ms: default_max_position_age_ms(),
            max_future_drift_ms: default_max_future_drift_ms(),
            cleanup_enabled: default_cleanup_enabled(),
            max_device_inactivity_ms: None,
            latest_key_ttl_s: default_latest_key_ttl_s(),
            batch_metadata_enabled: false,
            shutdown_deadline_ms: default_shutdown_deadline_ms(),
            history_sample_size: default_history_sample_size(),
        }
    }
}

impl GatewayConfig {
    /// Reject configurations the pipeline cannot run with.
    ///
    /// Called during startup; a failure here is fatal.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_max_size == 0 {
            return Err("batch_max_size must be at least 1".into());
        }
        if self.batch_interval_ms == 0 {
            return Err("batch_interval_ms must be at least 1".into());
        }
        if self.history_queue_concurrency == 0 || self.latest_queue_concurrency == 0 {
            return Err("queue concurrency must be at least 1".into());
        }
        if self.job_max_attempts == 0 {
            return Err("job_max_attempts must be at least 1".into());
        }
        if self.max_history_entries == 0 {
            return Err("max_history_entries must be at least 1".into());
        }
        if self.duplicate_coordinate_threshold < 0.0 {
            return Err("duplicate_coordinate_threshold must be non-negative".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let c = GatewayConfig::default();
        assert_eq!(c.batch_interval_ms, 10_000);
        assert_eq!(c.batch_max_size, 100);
        assert_eq!(c.history_queue_concurrency, 5);
        assert_eq!(c.latest_queue_concurrency, 3);
        assert_eq!(c.job_max_attempts, 3);
        assert_eq!(c.max_history_entries, 100_000);
        assert!(c.duplicate_enabled);
        assert_eq!(c.duplicate_time_threshold_ms, 1_000);
        assert_eq!(c.duplicate_coordinate_threshold, 0.0001);
        assert_eq!(c.duplicate_cache_size, 1_000);
        assert!(c.cleanup_enabled);
        assert_eq!(c.latest_key_ttl_s, 604_800);
        assert!(c.max_device_inactivity_ms.is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let c: GatewayConfig = serde_json::from_str(
            r#"{"redis_url": "redis://localhost:6379", "batch_max_size": 10}"#,
        )
        .unwrap();
        assert_eq!(c.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(c.batch_max_size, 10);
        // Everything else keeps its default
        assert_eq!(c.batch_interval_ms, 10_000);
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let c = GatewayConfig {
            batch_max_size: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let c = GatewayConfig {
            latest_queue_concurrency: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(GatewayConfig::default().validate().is_ok());
    }
}
