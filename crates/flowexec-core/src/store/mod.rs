//! Execution Store (C1): durable execution rows and the exclusive claim
//! lease layered on top of them.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{ExecutionClaim, ExecutionRecord, ExecutionStatus};
use crate::task::ExecutionTask;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("execution already exists: {0}")]
    Conflict(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Fields an update may change; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub error_node_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn to(status: ExecutionStatus) -> Self {
        Self { status, ..Default::default() }
    }

    pub fn with_error(mut self, message: impl Into<String>, node_id: Option<String>) -> Self {
        self.error_message = Some(message.into());
        self.error_node_id = node_id;
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub flow_id: Option<Uuid>,
    pub parent_execution_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { offset: 0, limit: 100 }
    }
}

/// Durable, atomic interface over execution lifecycle state. Implementations
/// must be thread-safe and make `claim_execution`/`extend_claim` single
/// transactions — the happy path and the expired-claim-replacement path
/// share one atomic check-and-set.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    async fn create(&self, record: ExecutionRecord) -> Result<(), StoreError>;

    async fn get(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Returns `true` iff a row was modified. Silently ignores (logs and
    /// returns `false` for) a transition the state machine forbids.
    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        update: StatusUpdate,
    ) -> Result<bool, StoreError>;

    /// `true` iff no active claim existed, or an expired one was atomically
    /// replaced, and the caller now holds an active claim expiring at
    /// `now + ttl`.
    async fn claim_execution(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError>;

    /// `true` iff `worker_id` currently holds the active claim; the claim's
    /// `expires_at`/`heartbeat_at` are reset. `false` means the caller has
    /// lost ownership and must stop processing.
    async fn extend_claim(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError>;

    /// Idempotent; a no-op if `worker_id` is not the current owner.
    async fn release_execution(&self, execution_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Snapshots the task body `worker_id` is currently processing onto its
    /// claim, so a recovery sweeper can rebuild this execution's retry
    /// state if the claim is later found abandoned. A no-op if `worker_id`
    /// does not hold the claim.
    async fn record_claim_task(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        task: &ExecutionTask,
    ) -> Result<(), StoreError>;

    /// Marks every claim with `expires_at < now` as expired. Returns the
    /// execution ids swept.
    async fn expire_old_claims(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn get_claim_for_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionClaim>, StoreError>;

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        page: Pagination,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Per-execution counter of how many times the recovery sweeper has had
    /// to republish this execution's task, used to enforce
    /// `recovery.maxFailureCount`.
    async fn increment_recovery_attempts(&self, execution_id: Uuid) -> Result<u32, StoreError>;
}
