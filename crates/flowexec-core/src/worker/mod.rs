//! Execution Worker (C6): claims tasks, runs a flow to completion, and
//! drives the retry/command/cancellation lifecycle around one execution
//! attempt at a time.

pub mod backpressure;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::cancellation::AbortController;
use crate::command::CommandKind;
use crate::commandbus::CommandBus;
use crate::config::WorkerConfig;
use crate::engine::{EngineFactory, FlowLoader};
use crate::error::WorkerError;
use crate::eventbus::EventBus;
use crate::model::ExecutionStatus;
use crate::queue::{ConsumeContext, QueueError, TaskQueue};
use crate::retry::RetryPolicy;
use crate::service::ExecutionService;
use crate::store::{ExecutionStore, StatusUpdate};
use crate::task::ExecutionTask;

use backpressure::{BackpressureConfig, BackpressureState};

/// Everything one worker process needs to run the claim/execute/retry loop.
/// Cheap to clone: every field is already an `Arc` or `Arc`-backed.
pub struct ExecutionWorker {
    config: WorkerConfig,
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn TaskQueue>,
    command_bus: Arc<dyn CommandBus>,
    event_bus: Arc<dyn EventBus>,
    flow_loader: Arc<dyn FlowLoader>,
    engine_factory: Arc<dyn EngineFactory>,
    service: ExecutionService,
    backpressure: Arc<BackpressureState>,
}

impl ExecutionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn ExecutionStore>,
        queue: Arc<dyn TaskQueue>,
        command_bus: Arc<dyn CommandBus>,
        event_bus: Arc<dyn EventBus>,
        flow_loader: Arc<dyn FlowLoader>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let backpressure = Arc::new(BackpressureState::new(
            BackpressureConfig::default(),
            config.max_concurrency,
        ));
        let service = ExecutionService::new(store.clone(), queue.clone());
        Self { config, store, queue, command_bus, event_bus, flow_loader, engine_factory, service, backpressure }
    }

    /// Runs the consume loop until the queue is closed, reconnecting with
    /// exponential backoff (`reconnect_base_delay` doubling up to
    /// `reconnect_max_delay`) after a transport failure. Gives up after
    /// `reconnect_max_attempts` consecutive failures.
    pub async fn run(self: Arc<Self>) -> Result<(), WorkerError> {
        let mut attempt = 0u32;
        loop {
            let worker = self.clone();
            let handler = Arc::new(move |task: ExecutionTask, ctx: ConsumeContext| {
                let worker = worker.clone();
                Box::pin(async move { worker.handle_task(task, ctx).await })
                    as futures::future::BoxFuture<'static, ()>
            });

            match self.queue.consume_tasks(&self.config.consumer_group, &self.config.worker_id, handler).await {
                Ok(()) => return Ok(()),
                Err(QueueError::Closed) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.reconnect_max_attempts {
                        return Err(WorkerError::Queue(e));
                    }
                    let delay = reconnect_delay(
                        attempt,
                        self.config.reconnect_base_delay,
                        self.config.reconnect_max_delay,
                    );
                    tracing::warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "queue consume loop failed, reconnecting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// The 13-step per-task loop: claim, run, and settle one delivery.
    async fn handle_task(&self, task: ExecutionTask, ctx: ConsumeContext) {
        if !self.backpressure.should_accept() {
            // Leave the message uncommitted; the queue's visibility timeout
            // redelivers it once load has room, to this or another worker.
            tracing::debug!(
                execution_id = %task.execution_id,
                reason = ?self.backpressure.reason(),
                "rejecting delivery under backpressure"
            );
            return;
        }
        self.backpressure.task_started();
        self.process_task(task, ctx).await;
        self.backpressure.task_finished();
    }

    async fn process_task(&self, task: ExecutionTask, ctx: ConsumeContext) {
        let execution_id = task.execution_id;
        let worker_id = self.config.worker_id.clone();

        let record = match self.store.get(execution_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::error!(%execution_id, "task references an execution that no longer exists");
                ctx.commit_offset();
                return;
            }
            Err(e) => {
                tracing::error!(%execution_id, error = %e, "failed to look up execution");
                return; // leave uncommitted, retry delivery
            }
        };

        if record.status.is_terminal() {
            tracing::debug!(%execution_id, status = %record.status, "dropping delivery for an already-terminal execution");
            ctx.commit_offset();
            return;
        }

        match self.store.claim_execution(execution_id, &worker_id, self.config.claim_timeout).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(%execution_id, "execution already claimed by another worker");
                ctx.commit_offset();
                return;
            }
            Err(e) => {
                tracing::error!(%execution_id, error = %e, "failed to claim execution");
                return;
            }
        }

        if let Err(e) = self.store.record_claim_task(execution_id, &worker_id, &task).await {
            tracing::warn!(%execution_id, error = %e, "failed to snapshot task onto claim");
        }

        // The claim, not the queue delivery, is now what guarantees
        // exclusive ownership — committing immediately lets the queue move
        // on regardless of how long execution subsequently takes.
        ctx.commit_offset();

        let abort = AbortController::new();
        let heartbeat = self.spawn_heartbeat(execution_id, worker_id.clone(), abort.clone());

        let outcome = self.run_claimed(&record, task, &worker_id, &abort).await;

        heartbeat.abort();

        if let Err(e) = outcome {
            tracing::error!(%execution_id, error = %e, "execution attempt ended in error");
        }
    }

    /// Periodically extends the claim lease. Aborts the execution if
    /// ownership is lost (another worker stole an expired claim, or the
    /// claim row was released out from under us).
    fn spawn_heartbeat(
        &self,
        execution_id: Uuid,
        worker_id: String,
        abort: AbortController,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.heartbeat_interval;
        let ttl = self.config.claim_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.extend_claim(execution_id, &worker_id, ttl).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        tracing::warn!(%execution_id, "lost claim ownership, aborting execution");
                        abort.abort("lost claim ownership");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(%execution_id, error = %e, "heartbeat extend failed");
                    }
                }
            }
        })
    }

    async fn run_claimed(
        &self,
        record: &crate::model::ExecutionRecord,
        task: ExecutionTask,
        worker_id: &str,
        abort: &AbortController,
    ) -> Result<(), WorkerError> {
        let execution_id = record.id;

        let flow = match self.flow_loader.load_flow(task.flow_id).await {
            Ok(Some(flow)) => flow,
            Ok(None) => {
                self.finish_unrecoverable(execution_id, worker_id, "flow not found").await;
                return Err(WorkerError::FlowNotFound(task.flow_id));
            }
            Err(e) => {
                self.fail_or_retry(execution_id, worker_id, task, e.to_string()).await;
                return Err(WorkerError::Engine(e));
            }
        };

        let engine = match self.engine_factory.build(&flow, &task) {
            Ok(engine) => engine,
            Err(e) => {
                self.fail_or_retry(execution_id, worker_id, task, e.to_string()).await;
                return Err(WorkerError::Engine(e));
            }
        };

        if record.status == ExecutionStatus::Created {
            let _ = self
                .store
                .update_execution_status(
                    execution_id,
                    StatusUpdate::to(ExecutionStatus::Running).with_started_at(Utc::now()),
                )
                .await;
        }

        let instance =
            self.service.create_execution_instance(execution_id, worker_id, engine, self.event_bus.clone(), abort.clone());

        let commands = self.spawn_command_listener(execution_id, worker_id.to_string(), &instance, abort.clone());

        let result = instance.execute().await;
        commands.abort();

        match result {
            Ok(_) => {
                let _ = self
                    .store
                    .update_execution_status(
                        execution_id,
                        StatusUpdate::to(ExecutionStatus::Completed).with_completed_at(Utc::now()),
                    )
                    .await;
                self.store.release_execution(execution_id, worker_id).await?;
                Ok(())
            }
            Err(e) => {
                if abort.reason().as_deref() == Some("stop command") {
                    tracing::info!(%execution_id, "execution stopped by command, skipping retry");
                } else {
                    self.fail_or_retry(execution_id, worker_id, task, e.to_string()).await;
                }
                Ok(())
            }
        }
    }

    /// Failure path for an execution that still holds its claim: re-verify
    /// ownership before deciding anything, since a lost claim means a new
    /// owner (or the recovery sweeper) is already handling the outcome and
    /// a second retry decision here would double-enqueue the task.
    async fn fail_or_retry(&self, execution_id: Uuid, worker_id: &str, task: ExecutionTask, error: String) {
        let still_owned = matches!(
            self.store.get_claim_for_execution(execution_id).await,
            Ok(Some(claim)) if claim.owned_by(worker_id)
        );

        if let Err(e) = self.store.release_execution(execution_id, worker_id).await {
            tracing::warn!(%execution_id, error = %e, "failed to release claim after execution failure");
        }

        if !still_owned {
            tracing::warn!(%execution_id, "ownership was already lost, deferring retry decision to the new owner");
            return;
        }

        if task.has_attempts_remaining() {
            self.reset_for_retry(execution_id, &error).await;
            self.schedule_retry(task, error, worker_id);
        } else {
            self.finish_unrecoverable(execution_id, worker_id, &error).await;
        }
    }

    /// Moves a failed-but-retryable execution back to `Created` with an
    /// explanatory error before its task is republished, so the record
    /// never shows `Running` for an attempt that has already ended.
    async fn reset_for_retry(&self, execution_id: Uuid, error: &str) {
        let _ = self
            .store
            .update_execution_status(
                execution_id,
                StatusUpdate::to(ExecutionStatus::Created).with_error(error, None),
            )
            .await;
    }

    async fn finish_unrecoverable(&self, execution_id: Uuid, worker_id: &str, error: &str) {
        let _ = self
            .store
            .update_execution_status(
                execution_id,
                StatusUpdate::to(ExecutionStatus::Failed)
                    .with_error(error, None)
                    .with_completed_at(Utc::now()),
            )
            .await;
        if let Err(e) = self.store.release_execution(execution_id, worker_id).await {
            tracing::warn!(%execution_id, error = %e, "failed to release claim while failing execution");
        }
    }

    /// Republishes the task after its backoff delay. Runs detached so the
    /// consumer loop is free to pick up the next delivery immediately.
    fn schedule_retry(&self, task: ExecutionTask, error: String, worker_id: &str) {
        let policy = RetryPolicy::from_task_defaults(task.retry_delay_ms, task.max_retries);
        let retried = task.into_retry(error, worker_id);
        let delay = policy.delay_for_attempt(retried.retry_count + 1);
        let queue = self.queue.clone();
        let execution_id = retried.execution_id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.publish_task(retried).await {
                tracing::error!(%execution_id, error = %e, "failed to republish task for retry");
            }
        });
    }

    /// Listens for commands targeting this execution while it runs.
    /// Re-verifies claim ownership before applying every command: a
    /// command delivered after ownership already moved on is stale.
    fn spawn_command_listener(
        &self,
        execution_id: Uuid,
        worker_id: String,
        instance: &crate::service::ExecutionInstance,
        abort: AbortController,
    ) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.command_bus.subscribe();
        let store = self.store.clone();
        let debugger = instance.debugger();
        tokio::spawn(async move {
            loop {
                let command = match receiver.recv().await {
                    Ok(command) => command,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                if command.execution_id != execution_id {
                    continue;
                }

                let owned = matches!(
                    store.get_claim_for_execution(execution_id).await,
                    Ok(Some(claim)) if claim.owned_by(&worker_id)
                );
                if !owned {
                    continue;
                }

                match command.command {
                    CommandKind::Stop => {
                        debugger.stop();
                        abort.abort("stop command");
                        let _ = store
                            .update_execution_status(execution_id, StatusUpdate::to(ExecutionStatus::Stopped))
                            .await;
                        if let Err(e) = store.release_execution(execution_id, &worker_id).await {
                            tracing::warn!(%execution_id, error = %e, "failed to release claim after stop command");
                        }
                    }
                    CommandKind::Pause => {
                        debugger.pause();
                        let _ = store
                            .update_execution_status(execution_id, StatusUpdate::to(ExecutionStatus::Paused))
                            .await;
                    }
                    CommandKind::Resume | CommandKind::Start => {
                        debugger.resume();
                        let _ = store
                            .update_execution_status(execution_id, StatusUpdate::to(ExecutionStatus::Running))
                            .await;
                    }
                    CommandKind::Step => debugger.step(),
                    CommandKind::Heartbeat | CommandKind::Create => {}
                }
            }
        })
    }
}

fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let scaled = base.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    scaled.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_until_the_cap() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(32);
        assert_eq!(reconnect_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(reconnect_delay(6, base, cap), Duration::from_secs(32));
        assert_eq!(reconnect_delay(20, base, cap), Duration::from_secs(32));
    }
}
