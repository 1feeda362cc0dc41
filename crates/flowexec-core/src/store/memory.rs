//! In-process [`ExecutionStore`] backed by `parking_lot`-guarded maps.
//!
//! Used by tests and the bundled CLI demo; implements the same atomicity
//! guarantees as the Postgres backend by holding a single lock across each
//! check-and-set operation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{ClaimStatus, ExecutionClaim, ExecutionRecord};
use crate::task::ExecutionTask;

use super::{ExecutionFilter, ExecutionStore, Pagination, StatusUpdate, StoreError};

#[derive(Default)]
struct State {
    executions: HashMap<Uuid, ExecutionRecord>,
    claims: HashMap<Uuid, ExecutionClaim>,
    recovery_attempts: HashMap<Uuid, u32>,
}

/// In-memory [`ExecutionStore`].
#[derive(Default)]
pub struct InMemoryExecutionStore {
    state: RwLock<State>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.executions.contains_key(&record.id) {
            return Err(StoreError::Conflict(record.id));
        }
        state.executions.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.state.read().executions.get(&execution_id).cloned())
    }

    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let Some(record) = state.executions.get_mut(&execution_id) else {
            return Err(StoreError::NotFound(execution_id));
        };
        if !record.status.can_transition_to(update.status) {
            tracing::warn!(
                execution_id = %execution_id,
                from = %record.status,
                to = %update.status,
                "rejected illegal status transition",
            );
            return Ok(false);
        }
        record.status = update.status;
        if update.error_message.is_some() {
            record.error_message = update.error_message;
        }
        if update.error_node_id.is_some() {
            record.error_node_id = update.error_node_id;
        }
        if update.started_at.is_some() {
            record.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            record.completed_at = update.completed_at;
        }
        Ok(true)
    }

    async fn claim_execution(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let now = Utc::now();
        let can_claim = match state.claims.get(&execution_id) {
            None => true,
            Some(claim) => claim.status != ClaimStatus::Active || claim.is_expired(now),
        };
        if !can_claim {
            return Ok(false);
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
        state.claims.insert(
            execution_id,
            ExecutionClaim {
                execution_id,
                worker_id: worker_id.to_string(),
                status: ClaimStatus::Active,
                expires_at: now + ttl,
                heartbeat_at: now,
                task_snapshot: None,
            },
        );
        Ok(true)
    }

    async fn extend_claim(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let now = Utc::now();
        let Some(claim) = state.claims.get_mut(&execution_id) else {
            return Ok(false);
        };
        if !claim.owned_by(worker_id) || claim.is_expired(now) {
            return Ok(false);
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
        claim.expires_at = now + ttl;
        claim.heartbeat_at = now;
        Ok(true)
    }

    async fn release_execution(&self, execution_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(claim) = state.claims.get_mut(&execution_id) {
            if claim.worker_id == worker_id {
                claim.status = ClaimStatus::Released;
            }
        }
        Ok(())
    }

    async fn record_claim_task(
        &self,
        execution_id: Uuid,
        worker_id: &str,
        task: &ExecutionTask,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(claim) = state.claims.get_mut(&execution_id) {
            if claim.worker_id == worker_id {
                claim.task_snapshot = Some(task.clone());
            }
        }
        Ok(())
    }

    async fn expire_old_claims(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut expired = Vec::new();
        for (execution_id, claim) in state.claims.iter_mut() {
            if claim.status == ClaimStatus::Active && claim.is_expired(now) {
                claim.status = ClaimStatus::Expired;
                expired.push(*execution_id);
            }
        }
        Ok(expired)
    }

    async fn get_claim_for_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionClaim>, StoreError> {
        Ok(self.state.read().claims.get(&execution_id).cloned())
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        page: Pagination,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let state = self.state.read();
        let mut matched: Vec<ExecutionRecord> = state
            .executions
            .values()
            .filter(|record| filter.status.map_or(true, |s| s == record.status))
            .filter(|record| filter.flow_id.map_or(true, |id| id == record.flow_id))
            .filter(|record| {
                filter
                    .parent_execution_id
                    .map_or(true, |id| Some(id) == record.parent_execution_id)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|record| record.created_at);
        let start = page.offset as usize;
        let end = (start + page.limit as usize).min(matched.len());
        Ok(if start >= matched.len() { Vec::new() } else { matched[start..end].to_vec() })
    }

    async fn increment_recovery_attempts(&self, execution_id: Uuid) -> Result<u32, StoreError> {
        let mut state = self.state.write();
        let counter = state.recovery_attempts.entry(execution_id).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionRecord, ExecutionStatus};

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(Uuid::now_v7(), Uuid::now_v7())
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryExecutionStore::new();
        let record = record();
        let id = record.id;
        store.create(record).await.unwrap();

        let ttl = std::time::Duration::from_secs(30);
        assert!(store.claim_execution(id, "worker-a", ttl).await.unwrap());
        assert!(!store.claim_execution(id, "worker-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_claim_can_be_replaced() {
        let store = InMemoryExecutionStore::new();
        let record = record();
        let id = record.id;
        store.create(record).await.unwrap();

        assert!(store
            .claim_execution(id, "worker-a", std::time::Duration::from_millis(0))
            .await
            .unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(store
            .claim_execution(id, "worker-b", std::time::Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn extend_claim_fails_for_non_owner() {
        let store = InMemoryExecutionStore::new();
        let record = record();
        let id = record.id;
        store.create(record).await.unwrap();
        let ttl = std::time::Duration::from_secs(30);
        store.claim_execution(id, "worker-a", ttl).await.unwrap();

        assert!(!store.extend_claim(id, "worker-b", ttl).await.unwrap());
        assert!(store.extend_claim(id, "worker-a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let store = InMemoryExecutionStore::new();
        let record = record();
        let id = record.id;
        store.create(record).await.unwrap();

        let applied = store
            .update_execution_status(id, StatusUpdate::to(ExecutionStatus::Running))
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, ExecutionStatus::Created);
    }

    #[tokio::test]
    async fn expire_old_claims_sweeps_only_expired_active_claims() {
        let store = InMemoryExecutionStore::new();
        let record = record();
        let id = record.id;
        store.create(record).await.unwrap();
        store
            .claim_execution(id, "worker-a", std::time::Duration::from_millis(0))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let expired = store.expire_old_claims().await.unwrap();
        assert_eq!(expired, vec![id]);
        assert_eq!(
            store.get_claim_for_execution(id).await.unwrap().unwrap().status,
            ClaimStatus::Expired
        );
    }
}
