//! End-to-end coverage of the claim/execute/settle loop against the
//! in-memory backends: a worker actually drives an execution to completion
//! or exhausts its retry budget, rather than each component being tested in
//! isolation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowexec_core::prelude::*;
use flowexec_core::eventbus::memory::InMemoryEventBus;
use flowexec_core::queue::memory::InMemoryTaskQueue;
use flowexec_core::store::memory::InMemoryExecutionStore;
use serde_json::json;
use uuid::Uuid;

struct NoopDebugger;
impl Debugger for NoopDebugger {
    fn pause(&self) {}
    fn resume(&self) {}
    fn step(&self) {}
    fn stop(&self) {}
}

struct FlowLoaderStub;
#[async_trait]
impl FlowLoader for FlowLoaderStub {
    async fn load_flow(&self, flow_id: Uuid) -> Result<Option<FlowDefinition>, EngineError> {
        Ok(Some(FlowDefinition { id: flow_id, definition: json!({}) }))
    }
}

/// Succeeds immediately, emitting the standard flow-start/flow-complete pair.
struct AlwaysSucceedsEngine;
#[async_trait]
impl ExecutionEngine for AlwaysSucceedsEngine {
    async fn execute(
        &self,
        emit: EventEmitter,
        _abort: AbortHandle,
    ) -> Result<serde_json::Value, EngineError> {
        emit(EventData::FlowStarted { input: json!({}) }).await;
        emit(EventData::FlowCompleted { result: json!({"ok": true}) }).await;
        Ok(json!({"ok": true}))
    }
    fn debugger(&self) -> Box<dyn Debugger> {
        Box::new(NoopDebugger)
    }
}

struct SucceedsEngineFactory;
impl EngineFactory for SucceedsEngineFactory {
    fn build(&self, _flow: &FlowDefinition, _task: &ExecutionTask) -> Result<Arc<dyn ExecutionEngine>, EngineError> {
        Ok(Arc::new(AlwaysSucceedsEngine))
    }
}

/// Always fails, counting attempts so the test can assert on retry budget.
struct AlwaysFailsEngine {
    attempts: Arc<AtomicU32>,
}
#[async_trait]
impl ExecutionEngine for AlwaysFailsEngine {
    async fn execute(
        &self,
        emit: EventEmitter,
        _abort: AbortHandle,
    ) -> Result<serde_json::Value, EngineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        emit(EventData::FlowStarted { input: json!({}) }).await;
        Err(EngineError::new("node boom"))
    }
    fn debugger(&self) -> Box<dyn Debugger> {
        Box::new(NoopDebugger)
    }
}

struct FailsEngineFactory {
    attempts: Arc<AtomicU32>,
}
impl EngineFactory for FailsEngineFactory {
    fn build(&self, _flow: &FlowDefinition, _task: &ExecutionTask) -> Result<Arc<dyn ExecutionEngine>, EngineError> {
        Ok(Arc::new(AlwaysFailsEngine { attempts: self.attempts.clone() }))
    }
}

#[tokio::test]
async fn a_worker_drives_a_freshly_created_execution_to_completion() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new(2));
    let command_bus = Arc::new(InMemoryCommandBus::default());
    let event_bus = Arc::new(InMemoryEventBus::new(2));

    let service = ExecutionService::new(store.clone(), queue.clone());
    let execution_id = service.create_execution(Uuid::now_v7(), None, false, json!({})).await.unwrap();

    let worker = Arc::new(ExecutionWorker::new(
        WorkerConfig::new("worker-1"),
        store.clone(),
        queue.clone(),
        command_bus,
        event_bus as Arc<dyn EventBus>,
        Arc::new(FlowLoaderStub),
        Arc::new(SucceedsEngineFactory),
    ));
    let handle = tokio::spawn(worker.run());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = store.get(execution_id).await.unwrap().unwrap();
        if record.status == ExecutionStatus::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "execution never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.abort();
}

#[tokio::test]
async fn an_execution_is_failed_once_its_retry_budget_is_exhausted() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new(2));
    let command_bus = Arc::new(InMemoryCommandBus::default());
    let event_bus = Arc::new(InMemoryEventBus::new(2));

    let execution_id = Uuid::now_v7();
    let flow_id = Uuid::now_v7();
    let record = ExecutionRecord::new(execution_id, flow_id);
    store.create(record).await.unwrap();
    let task = ExecutionTask::new(execution_id, flow_id, 0);
    queue.publish_task(task).await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let worker = Arc::new(ExecutionWorker::new(
        WorkerConfig::new("worker-1"),
        store.clone(),
        queue.clone(),
        command_bus,
        event_bus as Arc<dyn EventBus>,
        Arc::new(FlowLoaderStub),
        Arc::new(FailsEngineFactory { attempts: attempts.clone() }),
    ));
    let handle = tokio::spawn(worker.run());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let record = store.get(execution_id).await.unwrap().unwrap();
        if record.status == ExecutionStatus::Failed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "execution never failed out");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // default max_retries is 3, so the engine should have run 4 times
    // (the initial attempt plus three retries) before giving up.
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    handle.abort();
}

#[derive(Default)]
struct DebuggerCounters {
    pause: AtomicU32,
    resume: AtomicU32,
    step: AtomicU32,
    stop: AtomicU32,
}

struct RecordingDebugger {
    counters: Arc<DebuggerCounters>,
}
impl Debugger for RecordingDebugger {
    fn pause(&self) {
        self.counters.pause.fetch_add(1, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.counters.resume.fetch_add(1, Ordering::SeqCst);
    }
    fn step(&self) {
        self.counters.step.fetch_add(1, Ordering::SeqCst);
    }
    fn stop(&self) {
        self.counters.stop.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs until aborted, so the test can drive it through pause/resume/step/stop
/// commands while it is still in flight.
struct LoopingEngine {
    counters: Arc<DebuggerCounters>,
}
#[async_trait]
impl ExecutionEngine for LoopingEngine {
    async fn execute(
        &self,
        emit: EventEmitter,
        abort: AbortHandle,
    ) -> Result<serde_json::Value, EngineError> {
        emit(EventData::FlowStarted { input: json!({}) }).await;
        loop {
            if abort.is_aborted() {
                emit(EventData::FlowCancelled { reason: "aborted".into() }).await;
                return Err(EngineError::new("execution was cancelled"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    fn debugger(&self) -> Box<dyn Debugger> {
        Box::new(RecordingDebugger { counters: self.counters.clone() })
    }
}

struct LoopingEngineFactory {
    counters: Arc<DebuggerCounters>,
}
impl EngineFactory for LoopingEngineFactory {
    fn build(&self, _flow: &FlowDefinition, _task: &ExecutionTask) -> Result<Arc<dyn ExecutionEngine>, EngineError> {
        Ok(Arc::new(LoopingEngine { counters: self.counters.clone() }))
    }
}

/// Republishes `command` every 50ms until `condition` is observed or the
/// deadline passes, to ride out the gap between the worker subscribing to
/// the command bus and this test's first publish.
async fn drive_command_until<F, Fut>(
    command_bus: &InMemoryCommandBus,
    command: ExecutionCommand,
    mut condition: F,
    what: &str,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        command_bus.publish_command(command.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        if condition().await {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
    }
}

#[tokio::test]
async fn commands_drive_the_debugger_and_status_through_pause_resume_step_stop() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new(2));
    let command_bus = Arc::new(InMemoryCommandBus::default());
    let event_bus = Arc::new(InMemoryEventBus::new(2));

    let service = ExecutionService::new(store.clone(), queue.clone());
    let execution_id = service.create_execution(Uuid::now_v7(), None, false, json!({})).await.unwrap();

    let counters = Arc::new(DebuggerCounters::default());
    let worker = Arc::new(ExecutionWorker::new(
        WorkerConfig::new("worker-1"),
        store.clone(),
        queue.clone(),
        command_bus.clone(),
        event_bus as Arc<dyn EventBus>,
        Arc::new(FlowLoaderStub),
        Arc::new(LoopingEngineFactory { counters: counters.clone() }),
    ));
    let handle = tokio::spawn(worker.run());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = store.get(execution_id).await.unwrap().unwrap();
        if record.status == ExecutionStatus::Running {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "execution never started running");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    drive_command_until(
        &command_bus,
        ExecutionCommand::new(execution_id, CommandKind::Pause, "test"),
        || async { store.get(execution_id).await.unwrap().unwrap().status == ExecutionStatus::Paused },
        "pause to take effect",
    )
    .await;
    assert!(counters.pause.load(Ordering::SeqCst) >= 1);

    drive_command_until(
        &command_bus,
        ExecutionCommand::new(execution_id, CommandKind::Resume, "test"),
        || async { store.get(execution_id).await.unwrap().unwrap().status == ExecutionStatus::Running },
        "resume to take effect",
    )
    .await;
    assert!(counters.resume.load(Ordering::SeqCst) >= 1);

    drive_command_until(
        &command_bus,
        ExecutionCommand::new(execution_id, CommandKind::Step, "test"),
        || async { counters.step.load(Ordering::SeqCst) >= 1 },
        "step to take effect",
    )
    .await;
    assert_eq!(store.get(execution_id).await.unwrap().unwrap().status, ExecutionStatus::Running);

    drive_command_until(
        &command_bus,
        ExecutionCommand::new(execution_id, CommandKind::Stop, "test"),
        || async { store.get(execution_id).await.unwrap().unwrap().status == ExecutionStatus::Stopped },
        "stop to take effect",
    )
    .await;
    assert!(counters.stop.load(Ordering::SeqCst) >= 1);

    let claim = store.get_claim_for_execution(execution_id).await.unwrap();
    assert!(claim.map(|c| c.status != flowexec_core::model::ClaimStatus::Active).unwrap_or(true));

    handle.abort();
}
