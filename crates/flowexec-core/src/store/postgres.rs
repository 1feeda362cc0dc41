//! PostgreSQL-backed [`ExecutionStore`].
//!
//! Claims are a standalone table (`execution_claims`) rather than columns on
//! the execution row, so claim churn doesn't write-amplify the execution
//! record and so the "at most one active claim" invariant can be enforced
//! with a single partial unique index instead of row-level bookkeeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::model::{ClaimStatus, ExecutionClaim, ExecutionRecord, ExecutionStatus};
use crate::task::ExecutionTask;

use super::{ExecutionFilter, ExecutionStore, Pagination, StatusUpdate, StoreError};

pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn parse_status(raw: &str) -> Result<ExecutionStatus, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn status_str(status: ExecutionStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| status.to_string())
}

fn claim_status_str(status: ClaimStatus) -> &'static str {
    match status {
        ClaimStatus::Active => "active",
        ClaimStatus::Released => "released",
        ClaimStatus::Expired => "expired",
    }
}

fn parse_claim_status(raw: &str) -> ClaimStatus {
    match raw {
        "active" => ClaimStatus::Active,
        "released" => ClaimStatus::Released,
        _ => ClaimStatus::Expired,
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, record))]
    async fn create(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions
                (id, flow_id, status, parent_execution_id, root_execution_id,
                 execution_depth, created_at, integrations)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.flow_id)
        .bind(status_str(record.status))
        .bind(record.parent_execution_id)
        .bind(record.root_execution_id)
        .bind(record.execution_depth as i32)
        .bind(record.created_at)
        .bind(record.integrations)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::Conflict(record.id))
            }
            Err(e) => {
                error!(error = %e, "failed to create execution");
                Err(StoreError::Database(e.to_string()))
            }
        }
    }

    #[instrument(skip(self))]
    async fn get(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, flow_id, status, parent_execution_id, root_execution_id,
                   execution_depth, error_message, error_node_id,
                   created_at, started_at, completed_at, integrations
            FROM executions WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(ExecutionRecord {
            id: row.get("id"),
            flow_id: row.get("flow_id"),
            status: parse_status(row.get::<String, _>("status").as_str())?,
            parent_execution_id: row.get("parent_execution_id"),
            root_execution_id: row.get("root_execution_id"),
            execution_depth: row.get::<i32, _>("execution_depth") as u32,
            error_message: row.get("error_message"),
            error_node_id: row.get("error_node_id"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            integrations: row.get("integrations"),
        }))
    }

    #[instrument(skip(self, update))]
    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM executions WHERE id = $1 FOR UPDATE")
                .bind(execution_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

        let Some(current) = current else {
            return Err(StoreError::NotFound(execution_id));
        };
        let current = parse_status(&current)?;
        if !current.can_transition_to(update.status) {
            warn!(execution_id = %execution_id, from = %current, to = %update.status, "rejected illegal status transition");
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                error_message = COALESCE($3, error_message),
                error_node_id = COALESCE($4, error_node_id),
                started_at = COALESCE($5, started_at),
                completed_at = COALESCE($6, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status_str(update.status))
        .bind(update.error_message)
        .bind(update.error_node_id)
        .bind(update.started_at)
        .bind(update.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn claim_execution(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
        let now = Utc::now();
        let expires_at = now + ttl;

        // Single statement: insert a fresh claim, or steal an expired one.
        // The partial unique index on (execution_id) WHERE status='active'
        // is what makes this race-free under concurrent callers.
        // task_snapshot resets to NULL on every fresh/stolen claim: the new
        // owner hasn't processed a delivery yet, so there is nothing to
        // reconstruct a retry from until it calls `record_claim_task`.
        let rows = sqlx::query(
            r#"
            INSERT INTO execution_claims (execution_id, worker_id, status, expires_at, heartbeat_at, task_snapshot)
            VALUES ($1, $2, 'active', $3, $4, NULL)
            ON CONFLICT (execution_id) DO UPDATE
                SET worker_id = EXCLUDED.worker_id,
                    status = 'active',
                    expires_at = EXCLUDED.expires_at,
                    heartbeat_at = EXCLUDED.heartbeat_at,
                    task_snapshot = NULL
                WHERE execution_claims.status != 'active'
                   OR execution_claims.expires_at < $4
            RETURNING execution_id
            "#,
        )
        .bind(execution_id)
        .bind(worker_id)
        .bind(expires_at)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "claim_execution failed");
            StoreError::Database(e.to_string())
        })?;

        Ok(!rows.is_empty())
    }

    #[instrument(skip(self))]
    async fn extend_claim(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE execution_claims
            SET expires_at = $3, heartbeat_at = $4
            WHERE execution_id = $1 AND worker_id = $2 AND status = 'active' AND expires_at >= $4
            "#,
        )
        .bind(execution_id)
        .bind(worker_id)
        .bind(now + ttl)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn release_execution(&self, execution_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE execution_claims SET status = 'released'
            WHERE execution_id = $1 AND worker_id = $2
            "#,
        )
        .bind(execution_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, task))]
    async fn record_claim_task(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        task: &ExecutionTask,
    ) -> Result<(), StoreError> {
        let snapshot =
            serde_json::to_value(task).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE execution_claims SET task_snapshot = $3
            WHERE execution_id = $1 AND worker_id = $2
            "#,
        )
        .bind(execution_id)
        .bind(worker_id)
        .bind(snapshot)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expire_old_claims(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE execution_claims
            SET status = 'expired'
            WHERE status = 'active' AND expires_at < NOW()
            RETURNING execution_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("execution_id")).collect())
    }

    #[instrument(skip(self))]
    async fn get_claim_for_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionClaim>, StoreError> {
        let row = sqlx::query(
            "SELECT execution_id, worker_id, status, expires_at, heartbeat_at, task_snapshot FROM execution_claims WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };
        let task_snapshot: Option<serde_json::Value> = row.get("task_snapshot");
        let task_snapshot = task_snapshot
            .map(|v| serde_json::from_value(v).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()?;
        Ok(Some(ExecutionClaim {
            execution_id: row.get("execution_id"),
            worker_id: row.get("worker_id"),
            status: parse_claim_status(row.get::<String, _>("status").as_str()),
            expires_at: row.get::<DateTime<Utc>, _>("expires_at"),
            heartbeat_at: row.get::<DateTime<Utc>, _>("heartbeat_at"),
            task_snapshot,
        }))
    }

    #[instrument(skip(self, page))]
    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        page: Pagination,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, flow_id, status, parent_execution_id, root_execution_id,
                   execution_depth, error_message, error_node_id,
                   created_at, started_at, completed_at, integrations
            FROM executions
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR flow_id = $2)
              AND ($3::uuid IS NULL OR parent_execution_id = $3)
            ORDER BY created_at
            OFFSET $4 LIMIT $5
            "#,
        )
        .bind(filter.status.map(status_str))
        .bind(filter.flow_id)
        .bind(filter.parent_execution_id)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(ExecutionRecord {
                    id: row.get("id"),
                    flow_id: row.get("flow_id"),
                    status: parse_status(row.get::<String, _>("status").as_str())?,
                    parent_execution_id: row.get("parent_execution_id"),
                    root_execution_id: row.get("root_execution_id"),
                    execution_depth: row.get::<i32, _>("execution_depth") as u32,
                    error_message: row.get("error_message"),
                    error_node_id: row.get("error_node_id"),
                    created_at: row.get("created_at"),
                    started_at: row.get("started_at"),
                    completed_at: row.get("completed_at"),
                    integrations: row.get("integrations"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn increment_recovery_attempts(&self, execution_id: Uuid) -> Result<u32, StoreError> {
        let count: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO execution_recovery_attempts (execution_id, attempts)
            VALUES ($1, 1)
            ON CONFLICT (execution_id) DO UPDATE SET attempts = execution_recovery_attempts.attempts + 1
            RETURNING attempts
            "#,
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(count as u32)
    }
}
