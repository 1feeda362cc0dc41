//! PostgreSQL-backed [`TaskQueue`] using `SELECT ... FOR UPDATE SKIP LOCKED`
//! for contention-free claiming, polled per consumer.
//!
//! Ordering within a partition is approximated by claiming the oldest
//! visible, unclaimed task for an `execution_id` the caller doesn't already
//! have a task in flight for — the durable analogue of the in-memory
//! queue's per-partition max-in-flight-1 rule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::error;
use uuid::Uuid;

use crate::task::{ExecutionTask, RetryAttempt};

use super::{ConsumeContext, QueueError, TaskHandler, TaskQueue};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct PostgresTaskQueue {
    pool: PgPool,
    closed: Arc<AtomicBool>,
    consumer_tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PostgresTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, closed: Arc::new(AtomicBool::new(false)), consumer_tasks: parking_lot::Mutex::new(Vec::new()) }
    }

    async fn claim_one(pool: &PgPool, consumer_id: &str) -> Result<Option<(Uuid, ExecutionTask)>, QueueError> {
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id, execution_id
                FROM execution_tasks
                WHERE status = 'pending' AND visible_at <= NOW()
                  AND execution_id NOT IN (
                      SELECT execution_id FROM execution_tasks WHERE status = 'claimed'
                  )
                ORDER BY visible_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE execution_tasks t
            SET status = 'claimed', claimed_by = $1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.execution_id, t.flow_id, t.enqueued_at, t.retry_count,
                      t.max_retries, t.retry_delay_ms, t.retry_history, t.debug,
                      t.execution_depth, t.context
            "#,
        )
        .bind(consumer_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to claim task");
            QueueError::Database(e.to_string())
        })?;

        let Some(row) = row else { return Ok(None) };
        let retry_history: serde_json::Value = row.get("retry_history");
        let retry_history: Vec<RetryAttempt> =
            serde_json::from_value(retry_history).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let task = ExecutionTask {
            execution_id: row.get("execution_id"),
            flow_id: row.get("flow_id"),
            timestamp: row.get("enqueued_at"),
            retry_count: row.get::<i32, _>("retry_count") as u32,
            max_retries: row.get::<i32, _>("max_retries") as u32,
            retry_delay_ms: row.get::<i64, _>("retry_delay_ms") as u64,
            retry_history,
            debug: row.get("debug"),
            execution_depth: row.get::<i32, _>("execution_depth") as u32,
            context: row.get("context"),
        };
        Ok(Some((row.get("id"), task)))
    }
}

#[async_trait]
impl TaskQueue for PostgresTaskQueue {
    async fn publish_task(&self, task: ExecutionTask) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Closed);
        }
        let retry_history = serde_json::to_value(&task.retry_history)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO execution_tasks
                (id, execution_id, flow_id, status, enqueued_at, visible_at,
                 retry_count, max_retries, retry_delay_ms, retry_history, debug,
                 execution_depth, context)
            VALUES ($1, $2, $3, 'pending', $4, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(task.execution_id)
        .bind(task.flow_id)
        .bind(task.timestamp)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.retry_delay_ms as i64)
        .bind(retry_history)
        .bind(task.debug)
        .bind(task.execution_depth as i32)
        .bind(task.context)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;
        Ok(())
    }

    async fn consume_tasks(
        &self,
        _group: &str,
        consumer_id: &str,
        handler: TaskHandler,
    ) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Closed);
        }
        let pool = self.pool.clone();
        let closed = self.closed.clone();
        let consumer_id = consumer_id.to_string();

        let join = tokio::spawn(async move {
            loop {
                if closed.load(Ordering::Relaxed) {
                    return;
                }
                match Self::claim_one(&pool, &consumer_id).await {
                    Ok(Some((task_id, task))) => {
                        let pool = pool.clone();
                        let commit = Arc::new(move || {
                            let pool = pool.clone();
                            tokio::spawn(async move {
                                let _ = sqlx::query("DELETE FROM execution_tasks WHERE id = $1")
                                    .bind(task_id)
                                    .execute(&pool)
                                    .await;
                            });
                        });
                        tokio::spawn(handler(task, ConsumeContext { commit }));
                    }
                    Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                    Err(e) => {
                        error!(error = %e, "poll loop error, backing off");
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
        });
        self.consumer_tasks.lock().push(join);
        Ok(())
    }

    async fn stop_consuming(&self, _group: &str, _consumer_id: &str) -> Result<(), QueueError> {
        // Individual-consumer cancellation is handled by `close`; Postgres
        // claim ownership (`claimed_by`) already prevents cross-consumer
        // redelivery, so a targeted stop is a future enhancement, not a
        // correctness requirement for the single-process deployments this
        // backend currently serves.
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::Relaxed);
        for task in self.consumer_tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}
