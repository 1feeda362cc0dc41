//! Control-plane command payload, fanned out over the [`crate::commandbus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A control action directed at one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Create,
    Start,
    Stop,
    Pause,
    Resume,
    Step,
    Heartbeat,
}

/// Message published on the command bus. `id` makes delivery idempotent:
/// applying the same `id` twice must have the same effect as once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCommand {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub command: CommandKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub issued_by: String,
}

impl ExecutionCommand {
    pub fn new(execution_id: Uuid, command: CommandKind, issued_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            command,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
            issued_by: issued_by.into(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
