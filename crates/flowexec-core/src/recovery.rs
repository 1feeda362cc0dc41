//! Recovery Sweeper (C7): periodically detects claims abandoned by a
//! crashed worker (the claim's `expires_at` passed with no heartbeat) and
//! either republishes the execution's task or gives up once
//! `recovery.maxFailureCount` attempts have been made.
//!
//! Runs independently of any worker's own loop — it is itself just another
//! claim-store client, not special-cased storage access.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::cancellation::AbortHandle;
use crate::config::RecoveryConfig;
use crate::model::ExecutionStatus;
use crate::queue::TaskQueue;
use crate::store::{ExecutionStore, StatusUpdate, StoreError};
use crate::task::ExecutionTask;

pub struct RecoverySweeper {
    config: RecoveryConfig,
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn TaskQueue>,
}

impl RecoverySweeper {
    pub fn new(config: RecoveryConfig, store: Arc<dyn ExecutionStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { config, store, queue }
    }

    /// Runs the sweep loop until `abort` signals. A disabled sweeper still
    /// honours cancellation so callers can spawn it unconditionally.
    pub async fn run(self: Arc<Self>, abort: AbortHandle) {
        if !self.config.enabled {
            return;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval) => {}
                _ = wait_for_abort(&abort) => return,
            }
            match self.sweep_once().await {
                Ok(swept) if swept > 0 => tracing::info!(swept, "recovery sweep reclaimed abandoned executions"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "recovery sweep failed"),
            }
        }
    }

    /// One sweep pass. Returns how many executions had an expired claim.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let expired = self.store.expire_old_claims().await?;
        for execution_id in &expired {
            self.recover_execution(*execution_id).await;
        }
        Ok(expired.len())
    }

    async fn recover_execution(&self, execution_id: Uuid) {
        let record = match self.store.get(execution_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(%execution_id, error = %e, "failed to load execution during recovery");
                return;
            }
        };
        if record.status.is_terminal() {
            return;
        }

        let attempts = match self.store.increment_recovery_attempts(execution_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(%execution_id, error = %e, "failed to record a recovery attempt");
                return;
            }
        };

        if attempts > self.config.max_failure_count {
            tracing::warn!(%execution_id, attempts, "abandoning execution after exceeding the recovery failure cap");
            let _ = self
                .store
                .update_execution_status(
                    execution_id,
                    StatusUpdate::to(ExecutionStatus::Failed)
                        .with_error("abandoned by its worker and exceeded the recovery retry cap", None)
                        .with_completed_at(Utc::now()),
                )
                .await;
            return;
        }

        let claim = match self.store.get_claim_for_execution(execution_id).await {
            Ok(claim) => claim,
            Err(e) => {
                tracing::error!(%execution_id, error = %e, "failed to load claim during recovery");
                None
            }
        };

        let abandoned_by = claim.as_ref().map(|c| c.worker_id.clone()).unwrap_or_else(|| "unknown worker".to_string());
        let error = format!("abandoned by worker '{abandoned_by}': heartbeat expired");

        let task = match claim.and_then(|c| c.task_snapshot) {
            Some(snapshot) => snapshot.into_retry(error.clone(), abandoned_by),
            None => ExecutionTask::new(execution_id, record.flow_id, record.execution_depth),
        };

        if !task.has_attempts_remaining() {
            tracing::warn!(%execution_id, "abandoned execution already exhausted its retry budget");
            let _ = self
                .store
                .update_execution_status(
                    execution_id,
                    StatusUpdate::to(ExecutionStatus::Failed)
                        .with_error("abandoned by its worker after exhausting its retry budget", None)
                        .with_completed_at(Utc::now()),
                )
                .await;
            return;
        }

        let _ = self
            .store
            .update_execution_status(execution_id, StatusUpdate::to(ExecutionStatus::Created).with_error(error, None))
            .await;

        tracing::info!(%execution_id, attempts, retry_count = task.retry_count, "republishing task for an execution abandoned by its worker");
        if let Err(e) = self.queue.publish_task(task).await {
            tracing::error!(%execution_id, error = %e, "failed to republish an abandoned task");
        }
    }
}

async fn wait_for_abort(abort: &AbortHandle) {
    const POLL_INTERVAL: Duration = Duration::from_millis(200);
    loop {
        if abort.is_aborted() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionRecord;
    use crate::queue::memory::InMemoryTaskQueue;
    use crate::store::memory::InMemoryExecutionStore;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn an_expired_claim_is_republished_with_its_retry_history_intact() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new(4));
        let execution_id = Uuid::now_v7();
        let flow_id = Uuid::now_v7();
        let mut record = ExecutionRecord::new(execution_id, flow_id);
        record.status = ExecutionStatus::Running;
        store.create(record).await.unwrap();
        store.claim_execution(execution_id, "worker-1", StdDuration::from_millis(1)).await.unwrap();
        let task = ExecutionTask::new(execution_id, flow_id, 0);
        store.record_claim_task(execution_id, "worker-1", &task).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        let sweeper = RecoverySweeper::new(
            RecoveryConfig { enabled: true, scan_interval: StdDuration::from_secs(30), max_failure_count: 5 },
            store.clone(),
            queue.clone(),
        );
        let swept = sweeper.sweep_once().await.unwrap();
        assert_eq!(swept, 1);

        let record = store.get(execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Created);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        queue
            .consume_tasks(
                "recovery-test",
                "worker-2",
                Arc::new(move |task: ExecutionTask, ctx: crate::queue::ConsumeContext| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(task);
                        ctx.commit_offset();
                    }) as futures::future::BoxFuture<'static, ()>
                }),
            )
            .await
            .ok();

        let republished = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .expect("republished task should arrive")
            .expect("channel should not close");
        assert_eq!(republished.retry_count, 1);
        assert_eq!(republished.retry_history.len(), 1);
        assert_eq!(republished.retry_history[0].worker_id, "worker-1");
    }

    #[tokio::test]
    async fn an_execution_is_failed_once_the_recovery_cap_is_exceeded() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new(4));
        let execution_id = Uuid::now_v7();
        let mut record = ExecutionRecord::new(execution_id, Uuid::now_v7());
        record.status = ExecutionStatus::Running;
        store.create(record).await.unwrap();

        let sweeper = RecoverySweeper::new(
            RecoveryConfig { enabled: true, scan_interval: StdDuration::from_secs(30), max_failure_count: 1 },
            store.clone(),
            queue,
        );

        for _ in 0..3 {
            store.claim_execution(execution_id, "worker-1", StdDuration::from_millis(1)).await.unwrap();
            tokio::time::sleep(StdDuration::from_millis(5)).await;
            sweeper.sweep_once().await.unwrap();
        }

        let record = store.get(execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
    }
}
