//! Execution coordination plane for flow-graph workloads.
//!
//! ```text
//!   ExecutionService ──create──▶ ExecutionStore          (status, claims, lineage)
//!         │                              ▲
//!         └──publish(task)──▶ TaskQueue  │
//!                                 │      │  claim / extend / release
//!                                 ▼      │
//!                          ExecutionWorker ──heartbeat──┘
//!                                 │
//!                                 ├──execute via ExecutionEngine (external)
//!                                 ├──publish──▶ EventBus ──subscribe──▶ consumers
//!                                 └──re-verify before acting──▶ CommandBus
//!
//!   RecoverySweeper polls ExecutionStore.expire_old_claims() independently
//!   of the worker loop and republishes abandoned tasks.
//! ```
//!
//! Everything above a storage backend is expressed as a trait so the same
//! worker/service/sweeper code runs against Postgres or the in-memory
//! doubles used by tests.

pub mod cancellation;
pub mod command;
pub mod commandbus;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod model;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod service;
pub mod store;
pub mod task;
pub mod worker;

pub mod prelude {
    pub use crate::cancellation::{AbortController, AbortHandle};
    pub use crate::command::{CommandKind, ExecutionCommand};
    pub use crate::commandbus::{CommandBus, CommandBusError, InMemoryCommandBus};
    pub use crate::config::{RecoveryConfig, WorkerConfig};
    pub use crate::engine::{
        Debugger, EngineError, EngineFactory, EventEmitter, ExecutionEngine, FlowDefinition, FlowLoader,
        NodeRegistry,
    };
    pub use crate::error::WorkerError;
    pub use crate::event::{EventData, EventType, ExecutionEvent};
    pub use crate::eventbus::{EventBatch, EventBus, EventBusError, SubscribeOptions};
    pub use crate::model::{ExecutionClaim, ExecutionRecord, ExecutionStatus};
    pub use crate::queue::{ConsumeContext, TaskQueue, QueueError};
    pub use crate::recovery::RecoverySweeper;
    pub use crate::retry::RetryPolicy;
    pub use crate::service::ExecutionService;
    pub use crate::store::{ExecutionFilter, ExecutionStore, Pagination, StoreError};
    pub use crate::task::{ExecutionTask, RetryAttempt};
    pub use crate::worker::ExecutionWorker;
}
