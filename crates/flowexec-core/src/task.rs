//! Task-queue payload: one unit of work handed from the queue to a worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One prior failed attempt, kept for diagnostics and so a recovered
/// execution's history shows which worker died.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Message body enqueued onto the task queue, partitioned by `execution_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub execution_id: Uuid,
    pub flow_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_history: Vec<RetryAttempt>,
    pub debug: bool,
    pub execution_depth: u32,
    pub context: serde_json::Value,
}

impl ExecutionTask {
    /// New task for a freshly created execution, applying the defaults the
    /// worker loop would otherwise have to fill in on delivery.
    pub fn new(execution_id: Uuid, flow_id: Uuid, execution_depth: u32) -> Self {
        Self {
            execution_id,
            flow_id,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_history: Vec::new(),
            debug: false,
            execution_depth,
            context: serde_json::Value::Null,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Build the republished task for the next retry attempt: increments
    /// `retry_count` and appends a history entry, matching the republish
    /// step of the worker's failure path.
    pub fn into_retry(mut self, error: impl Into<String>, worker_id: impl Into<String>) -> Self {
        self.retry_count += 1;
        self.retry_history.push(RetryAttempt {
            attempt: self.retry_count,
            error: error.into(),
            worker_id: worker_id.into(),
            timestamp: Utc::now(),
        });
        self.timestamp = Utc::now();
        self
    }
}
