//! Execution record, status machine, and claim types owned by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::ExecutionTask;

/// Lifecycle status of an execution.
///
/// Legal transitions are enforced by [`ExecutionStatus::can_transition_to`]:
///
/// ```text
/// Idle -> Creating -> Created -> Running -> {Completed, Failed, Paused, Stopped}
/// Paused -> {Running, Stopped, Failed}
/// Running -> Paused
/// Created -> Failed
/// {Running, Paused} -> Created   (a retry resets status before republishing)
/// {Completed, Failed, Stopped} are absorbing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Creating,
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Whether moving from `self` to `next` is a legal state transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ExecutionStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Idle, Creating)
                | (Creating, Created)
                | (Created, Running)
                | (Created, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Paused, Failed)
                | (Running, Created)
                | (Paused, Created)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Durable record for one execution of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub status: ExecutionStatus,
    pub parent_execution_id: Option<Uuid>,
    pub root_execution_id: Option<Uuid>,
    pub execution_depth: u32,
    pub error_message: Option<String>,
    pub error_node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub integrations: Option<serde_json::Value>,
}

impl ExecutionRecord {
    pub fn new(id: Uuid, flow_id: Uuid) -> Self {
        Self {
            id,
            flow_id,
            status: ExecutionStatus::Created,
            parent_execution_id: None,
            root_execution_id: None,
            execution_depth: 0,
            error_message: None,
            error_node_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            integrations: None,
        }
    }

    pub fn child_of(id: Uuid, flow_id: Uuid, parent: &ExecutionRecord) -> Self {
        let mut rec = Self::new(id, flow_id);
        rec.parent_execution_id = Some(parent.id);
        rec.root_execution_id = Some(parent.root_execution_id.unwrap_or(parent.id));
        rec.execution_depth = parent.execution_depth + 1;
        rec
    }
}

/// Status of an exclusive ownership lease over an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Active,
    Released,
    Expired,
}

/// Exclusive-ownership lease a worker holds over an execution.
///
/// Invariant: at most one claim with `status == Active` exists per
/// `execution_id` at any instant (enforced by the store, not by this type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionClaim {
    pub execution_id: Uuid,
    pub worker_id: String,
    pub status: ClaimStatus,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// The task body `worker_id` is currently processing under this claim,
    /// snapshotted so a recovery sweeper can rebuild retry state for an
    /// execution abandoned mid-task instead of restarting its retry budget.
    pub task_snapshot: Option<ExecutionTask>,
}

impl ExecutionClaim {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn owned_by(&self, worker_id: &str) -> bool {
        self.status == ClaimStatus::Active && self.worker_id == worker_id
    }
}
