//! Execution Service (C5): creates executions and wires a running engine
//! instance to the event bus.

use std::sync::Arc;

use uuid::Uuid;

use crate::cancellation::AbortController;
use crate::engine::{Debugger, EngineError, EventEmitter, ExecutionEngine};
use crate::event::EventData;
use crate::eventbus::EventBus;
use crate::model::ExecutionRecord;
use crate::queue::{QueueError, TaskQueue};
use crate::store::{ExecutionStore, StoreError};
use crate::task::ExecutionTask;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct ExecutionService {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn TaskQueue>,
}

impl ExecutionService {
    pub fn new(store: Arc<dyn ExecutionStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Writes a `Created` execution row and enqueues its first task. Records
    /// lineage when `parent` is given (see [`ExecutionRecord::child_of`]).
    pub async fn create_execution(
        &self,
        flow_id: Uuid,
        parent: Option<&ExecutionRecord>,
        debug: bool,
        context: serde_json::Value,
    ) -> Result<Uuid, ServiceError> {
        let id = Uuid::now_v7();
        let record = match parent {
            Some(parent) => ExecutionRecord::child_of(id, flow_id, parent),
            None => ExecutionRecord::new(id, flow_id),
        };
        let depth = record.execution_depth;
        self.store.create(record).await?;

        let task = ExecutionTask::new(id, flow_id, depth).with_debug(debug).with_context(context);
        self.queue.publish_task(task).await?;
        Ok(id)
    }

    /// Wires an already-constructed engine to the event bus for one
    /// execution attempt.
    pub fn create_execution_instance(
        &self,
        execution_id: Uuid,
        worker_id: impl Into<String>,
        engine: Arc<dyn ExecutionEngine>,
        event_bus: Arc<dyn EventBus>,
        abort: AbortController,
    ) -> ExecutionInstance {
        ExecutionInstance { execution_id, worker_id: worker_id.into(), engine, event_bus, abort }
    }
}

/// A running engine instance with its event-publishing tap wired in.
pub struct ExecutionInstance {
    pub execution_id: Uuid,
    pub abort: AbortController,
    worker_id: String,
    engine: Arc<dyn ExecutionEngine>,
    event_bus: Arc<dyn EventBus>,
}

impl ExecutionInstance {
    /// Builds the emitter the engine awaits on every publish. Publishing
    /// inline, rather than handing the engine a fire-and-forget sink, is
    /// what guarantees events reach the event bus in emission order.
    fn emit_hook(&self) -> EventEmitter {
        let event_bus = self.event_bus.clone();
        let execution_id = self.execution_id;
        let worker_id = self.worker_id.clone();
        Arc::new(move |data: EventData| {
            let event_bus = event_bus.clone();
            let worker_id = worker_id.clone();
            Box::pin(async move {
                if let Err(e) = event_bus.publish_event(execution_id, data, &worker_id).await {
                    tracing::error!(error = %e, "failed to publish execution event");
                }
            })
        })
    }

    pub async fn execute(&self) -> Result<serde_json::Value, EngineError> {
        self.engine.execute(self.emit_hook(), self.abort.handle()).await
    }

    pub fn debugger(&self) -> Box<dyn Debugger> {
        self.engine.debugger()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::AbortHandle;
    use crate::engine::Debugger;
    use crate::eventbus::memory::InMemoryEventBus;
    use crate::eventbus::SubscribeOptions;
    use crate::queue::memory::InMemoryTaskQueue;
    use crate::store::memory::InMemoryExecutionStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopDebugger;
    impl Debugger for NoopDebugger {
        fn pause(&self) {}
        fn resume(&self) {}
        fn step(&self) {}
        fn stop(&self) {}
    }

    struct TwoNodeEngine;

    #[async_trait]
    impl ExecutionEngine for TwoNodeEngine {
        async fn execute(
            &self,
            emit: EventEmitter,
            _abort: AbortHandle,
        ) -> Result<serde_json::Value, EngineError> {
            emit(EventData::FlowStarted { input: json!({}) }).await;
            emit(EventData::NodeStarted { node_id: "a".into() }).await;
            emit(EventData::NodeCompleted { node_id: "a".into(), output: json!({}) }).await;
            emit(EventData::NodeStarted { node_id: "b".into() }).await;
            emit(EventData::NodeCompleted { node_id: "b".into(), output: json!({}) }).await;
            emit(EventData::FlowCompleted { result: json!({"ok": true}) }).await;
            Ok(json!({"ok": true}))
        }

        fn debugger(&self) -> Box<dyn Debugger> {
            Box::new(NoopDebugger)
        }
    }

    #[tokio::test]
    async fn create_execution_writes_a_row_and_enqueues_a_task() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new(4));
        let service = ExecutionService::new(store.clone(), queue.clone());

        let id = service.create_execution(Uuid::now_v7(), None, false, json!({})).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.execution_depth, 0);
    }

    #[tokio::test]
    async fn child_execution_inherits_root_and_increments_depth() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new(4));
        let service = ExecutionService::new(store.clone(), queue.clone());

        let parent_id = service.create_execution(Uuid::now_v7(), None, false, json!({})).await.unwrap();
        let parent = store.get(parent_id).await.unwrap().unwrap();
        let child_id = service
            .create_execution(Uuid::now_v7(), Some(&parent), false, json!({}))
            .await
            .unwrap();
        let child = store.get(child_id).await.unwrap().unwrap();

        assert_eq!(child.parent_execution_id, Some(parent_id));
        assert_eq!(child.root_execution_id, Some(parent_id));
        assert_eq!(child.execution_depth, 1);
    }

    #[tokio::test]
    async fn every_emitted_event_is_durable_and_in_order_once_execute_returns() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new(4));
        let bus = Arc::new(InMemoryEventBus::new(4));
        let service = ExecutionService::new(store, queue);

        let execution_id = Uuid::now_v7();
        let instance = service.create_execution_instance(
            execution_id,
            "worker-1",
            Arc::new(TwoNodeEngine),
            bus.clone(),
            AbortController::new(),
        );

        instance.execute().await.unwrap();

        let mut sub = bus.subscribe_to_events(execution_id, 0, SubscribeOptions::default()).await.unwrap();
        let batch = sub.next_batch().await.unwrap();
        assert_eq!(batch.events.len(), 6);
        for pair in batch.events.windows(2) {
            assert!(pair[0].index < pair[1].index);
        }
        assert!(batch.events.last().unwrap().data.is_flow_terminal());
    }
}
