//! External capabilities the coordination plane consumes but does not
//! implement: the graph engine that runs a flow's nodes, flow loading, and
//! node-type registration. The worker builds one engine instance per task
//! delivery and drives it through this boundary without owning its
//! internals.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cancellation::AbortHandle;
use crate::event::EventData;

#[derive(Debug, thiserror::Error, Clone, Serialize, Deserialize)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
    pub node_id: Option<String>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), node_id: None }
    }

    pub fn at_node(message: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self { message: message.into(), node_id: Some(node_id.into()) }
    }
}

/// Sink an engine publishes execution events through. Asynchronous so the
/// engine awaits each publish before moving on, which is what guarantees
/// events reach the event bus in the order the engine emitted them.
pub type EventEmitter = std::sync::Arc<dyn Fn(EventData) -> BoxFuture<'static, ()> + Send + Sync>;

/// Debugger controls exposed by a running engine instance.
pub trait Debugger: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn step(&self);
    fn stop(&self);
}

/// One running instance of a flow's graph engine, constructed by
/// [`crate::service::ExecutionService`] for a single execution attempt.
///
/// Implementations must be deterministic enough to emit events through the
/// supplied sink in the exact order other subscribers must observe them;
/// the engine never talks back to the worker except through that sink and
/// through `on_complete`.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Drives the flow to completion, publishing [`EventData`] for every
    /// node/edge/flow transition through `emit`. Must respect `abort`:
    /// cancellation should unblock execution within a bounded time.
    async fn execute(
        &self,
        emit: EventEmitter,
        abort: AbortHandle,
    ) -> Result<serde_json::Value, EngineError>;

    fn debugger(&self) -> Box<dyn Debugger>;
}

/// A flow definition as the engine needs it; opaque to the coordination
/// plane beyond its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub definition: serde_json::Value,
}

#[async_trait]
pub trait FlowLoader: Send + Sync + 'static {
    async fn load_flow(&self, flow_id: Uuid) -> Result<Option<FlowDefinition>, EngineError>;
}

/// Maps a node type name to whatever the engine needs to construct it.
/// Caller-provided; the coordination plane only needs the lookup to exist
/// so `ExecutionService` can hand it to the engine at construction time.
pub trait NodeRegistry: Send + Sync + 'static {
    fn has_node_type(&self, node_type: &str) -> bool;
}

/// Builds one [`ExecutionEngine`] instance for a single task delivery. The
/// worker calls this after loading the flow and before starting execution;
/// implementations own whatever node/registry wiring the engine needs.
pub trait EngineFactory: Send + Sync + 'static {
    fn build(
        &self,
        flow: &FlowDefinition,
        task: &crate::task::ExecutionTask,
    ) -> Result<std::sync::Arc<dyn ExecutionEngine>, EngineError>;
}
