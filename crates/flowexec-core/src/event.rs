//! Per-execution event log entries published through the [`crate::eventbus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminated event payload. Tagged so the wire form carries its own
/// shape and the bus never needs a side table to decode a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    FlowSubscribed,
    FlowStarted { input: serde_json::Value },
    FlowCompleted { result: serde_json::Value },
    FlowFailed { error_message: String, error_node_id: Option<String> },
    FlowCancelled { reason: String },
    FlowPaused,
    FlowResumed,

    NodeStarted { node_id: String },
    /// The node detached from the flow's completion (fire-and-forget); see
    /// DESIGN.md for the recorded decision on this event's semantics.
    NodeBackgrounded { node_id: String, child_execution_id: Uuid },
    NodeCompleted { node_id: String, output: serde_json::Value },
    NodeFailed { node_id: String, error_message: String },
    NodeSkipped { node_id: String, reason: String },
    NodeStatusChanged { node_id: String, status: String },
    DebugLogString { node_id: Option<String>, message: String },

    EdgeTransferStarted { edge_id: String, from_node: String, to_node: String },
    EdgeTransferCompleted { edge_id: String },
    EdgeTransferFailed { edge_id: String, error_message: String },

    DebugBreakpointHit { node_id: String },

    ChildExecutionSpawned { child_execution_id: Uuid, node_id: String },
    ChildExecutionCompleted { child_execution_id: Uuid, result: serde_json::Value },
    ChildExecutionFailed { child_execution_id: Uuid, error_message: String },
}

impl EventData {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id }
            | Self::NodeBackgrounded { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::NodeSkipped { node_id, .. }
            | Self::NodeStatusChanged { node_id, .. } => Some(node_id),
            Self::DebugLogString { node_id, .. } => node_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_flow_terminal(&self) -> bool {
        matches!(
            self,
            Self::FlowCompleted { .. } | Self::FlowFailed { .. } | Self::FlowCancelled { .. }
        )
    }
}

/// Event kind, surfaced separately from [`EventData`] so a header-only
/// filter never has to deserialize the payload (see [`crate::eventbus`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FlowSubscribed,
    FlowStarted,
    FlowCompleted,
    FlowFailed,
    FlowCancelled,
    FlowPaused,
    FlowResumed,
    NodeStarted,
    NodeBackgrounded,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    NodeStatusChanged,
    DebugLogString,
    EdgeTransferStarted,
    EdgeTransferCompleted,
    EdgeTransferFailed,
    DebugBreakpointHit,
    ChildExecutionSpawned,
    ChildExecutionCompleted,
    ChildExecutionFailed,
}

impl From<&EventData> for EventType {
    fn from(data: &EventData) -> Self {
        match data {
            EventData::FlowSubscribed => Self::FlowSubscribed,
            EventData::FlowStarted { .. } => Self::FlowStarted,
            EventData::FlowCompleted { .. } => Self::FlowCompleted,
            EventData::FlowFailed { .. } => Self::FlowFailed,
            EventData::FlowCancelled { .. } => Self::FlowCancelled,
            EventData::FlowPaused => Self::FlowPaused,
            EventData::FlowResumed => Self::FlowResumed,
            EventData::NodeStarted { .. } => Self::NodeStarted,
            EventData::NodeBackgrounded { .. } => Self::NodeBackgrounded,
            EventData::NodeCompleted { .. } => Self::NodeCompleted,
            EventData::NodeFailed { .. } => Self::NodeFailed,
            EventData::NodeSkipped { .. } => Self::NodeSkipped,
            EventData::NodeStatusChanged { .. } => Self::NodeStatusChanged,
            EventData::DebugLogString { .. } => Self::DebugLogString,
            EventData::EdgeTransferStarted { .. } => Self::EdgeTransferStarted,
            EventData::EdgeTransferCompleted { .. } => Self::EdgeTransferCompleted,
            EventData::EdgeTransferFailed { .. } => Self::EdgeTransferFailed,
            EventData::DebugBreakpointHit { .. } => Self::DebugBreakpointHit,
            EventData::ChildExecutionSpawned { .. } => Self::ChildExecutionSpawned,
            EventData::ChildExecutionCompleted { .. } => Self::ChildExecutionCompleted,
            EventData::ChildExecutionFailed { .. } => Self::ChildExecutionFailed,
        }
    }
}

/// One entry in an execution's append-only, gap-free, per-producer event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    pub index: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
    pub worker_id: String,
}

impl ExecutionEvent {
    pub fn new(execution_id: Uuid, index: u64, data: EventData, worker_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            index,
            event_type: EventType::from(&data),
            timestamp: Utc::now(),
            data,
            worker_id: worker_id.into(),
        }
    }
}
