//! Demo binary: wires every in-memory backend together, runs one execution
//! through a trivial two-node engine, and prints its event log as it
//! streams in. Exercises the coordination plane end to end without a
//! database or a real flow-graph engine.

use std::sync::Arc;

use async_trait::async_trait;
use flowexec_core::prelude::*;
use serde_json::json;
use uuid::Uuid;
use flowexec_core::eventbus::memory::InMemoryEventBus;
use flowexec_core::queue::memory::InMemoryTaskQueue;
use flowexec_core::store::memory::InMemoryExecutionStore;

struct NoopDebugger;
impl Debugger for NoopDebugger {
    fn pause(&self) {
        tracing::info!("pause requested (no-op in the demo engine)");
    }
    fn resume(&self) {
        tracing::info!("resume requested (no-op in the demo engine)");
    }
    fn step(&self) {
        tracing::info!("step requested (no-op in the demo engine)");
    }
    fn stop(&self) {
        tracing::info!("stop requested (no-op in the demo engine)");
    }
}

/// Runs two no-op nodes in sequence, emitting the same event shape a real
/// flow-graph engine would, so the worker loop has something to drive.
struct DemoEngine {
    flow_id: Uuid,
}

#[async_trait]
impl ExecutionEngine for DemoEngine {
    async fn execute(
        &self,
        emit: EventEmitter,
        abort: AbortHandle,
    ) -> Result<serde_json::Value, EngineError> {
        emit(EventData::FlowStarted { input: json!({"flow_id": self.flow_id}) }).await;

        for node_id in ["fetch", "transform"] {
            if abort.is_aborted() {
                emit(EventData::FlowCancelled { reason: "aborted".into() }).await;
                return Err(EngineError::new("execution was cancelled"));
            }
            emit(EventData::NodeStarted { node_id: node_id.into() }).await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            emit(EventData::NodeCompleted { node_id: node_id.into(), output: json!({"node_id": node_id}) }).await;
        }

        let result = json!({"status": "ok"});
        emit(EventData::FlowCompleted { result: result.clone() }).await;
        Ok(result)
    }

    fn debugger(&self) -> Box<dyn Debugger> {
        Box::new(NoopDebugger)
    }
}

struct DemoFlowLoader;

#[async_trait]
impl FlowLoader for DemoFlowLoader {
    async fn load_flow(&self, flow_id: Uuid) -> Result<Option<FlowDefinition>, EngineError> {
        Ok(Some(FlowDefinition { id: flow_id, definition: json!({"nodes": ["fetch", "transform"]}) }))
    }
}

struct DemoEngineFactory;

impl EngineFactory for DemoEngineFactory {
    fn build(
        &self,
        flow: &FlowDefinition,
        _task: &ExecutionTask,
    ) -> Result<Arc<dyn ExecutionEngine>, EngineError> {
        Ok(Arc::new(DemoEngine { flow_id: flow.id }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let store = Arc::new(InMemoryExecutionStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new(4));
    let command_bus = Arc::new(InMemoryCommandBus::default());
    let event_bus = Arc::new(InMemoryEventBus::new(4));

    let service = ExecutionService::new(store.clone(), queue.clone());
    let flow_id = Uuid::now_v7();
    let execution_id = service.create_execution(flow_id, None, false, json!({})).await?;
    tracing::info!(%execution_id, %flow_id, "created execution");

    let worker = Arc::new(ExecutionWorker::new(
        WorkerConfig::new("demo-worker"),
        store.clone(),
        queue.clone(),
        command_bus.clone(),
        event_bus.clone() as Arc<dyn EventBus>,
        Arc::new(DemoFlowLoader),
        Arc::new(DemoEngineFactory),
    ));
    let worker_handle = tokio::spawn(worker.run());

    let mut subscription =
        event_bus.subscribe_to_events(execution_id, 0, SubscribeOptions::default()).await?;
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(5), subscription.next_batch()).await {
            Ok(Some(batch)) => {
                let terminal = batch.events.iter().any(|e| e.data.is_flow_terminal());
                for event in &batch.events {
                    println!("[{:>3}] {:?}", event.index, event.data);
                }
                if terminal {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("timed out waiting for the demo execution to finish");
                break;
            }
        }
    }

    worker_handle.abort();
    Ok(())
}
