//! Top-level error type the worker loop and recovery sweeper surface.

use crate::commandbus::CommandBusError;
use crate::engine::EngineError;
use crate::eventbus::EventBusError;
use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),

    #[error(transparent)]
    CommandBus(#[from] CommandBusError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("flow not found: {0}")]
    FlowNotFound(uuid::Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(uuid::Uuid),

    #[error("lost claim ownership for execution {0}")]
    LostClaim(uuid::Uuid),
}
