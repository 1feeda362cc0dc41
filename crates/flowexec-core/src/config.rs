//! Layered configuration for the worker and recovery sweeper: connection
//! tuning, claim/heartbeat timing, and reconnect backoff, each with
//! sensible defaults and a `validate()` for the invariants that span
//! fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

pub fn duration_as_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    (duration.as_millis() as u64).serialize(serializer)
}

mod duration_millis {
    pub use super::{duration_as_ms as serialize, duration_ms as deserialize};
}

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub consumer_group: String,
    pub max_concurrency: usize,

    #[serde(with = "duration_millis")]
    pub claim_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_millis")]
    pub claim_expiration_check_interval: Duration,

    /// Reconnect backoff after a transport loss: `base * 2^attempt`, capped,
    /// giving up after `max_attempts`.
    #[serde(with = "duration_millis")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            consumer_group: "execution-workers".to_string(),
            max_concurrency: 10,
            claim_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            claim_expiration_check_interval: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(32),
            reconnect_max_attempts: 10,
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self { worker_id: worker_id.into(), ..Default::default() }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Heartbeat must fire well inside the claim TTL or a healthy worker
    /// would race its own expiry.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval * 3 > self.claim_timeout {
            return Err(format!(
                "heartbeat_interval ({:?}) must be <= claim_timeout/3 ({:?})",
                self.heartbeat_interval,
                self.claim_timeout / 3
            ));
        }
        Ok(())
    }
}

/// Recovery sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub enabled: bool,
    #[serde(with = "duration_millis")]
    pub scan_interval: Duration,
    pub max_failure_count: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { enabled: true, scan_interval: Duration::from_secs(30), max_failure_count: 5 }
    }
}

impl RecoveryConfig {
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_max_failure_count(mut self, max: u32) -> Self {
        self.max_failure_count = max;
        self
    }
}
