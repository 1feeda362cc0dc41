//! Task Queue (C2): durable, partition-keyed FIFO delivery with manual
//! commit and consumer-group load balancing.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use uuid::Uuid;

use crate::task::ExecutionTask;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Handed to a delivered task so the handler decides exactly when the
/// message is considered durably processed. The worker's own contract
/// (commit immediately after a successful claim, regardless of how long
/// execution subsequently takes) is what this type exists to support.
#[derive(Clone)]
pub struct ConsumeContext {
    pub(crate) commit: Arc<dyn Fn() + Send + Sync>,
}

impl ConsumeContext {
    pub fn commit_offset(&self) {
        (self.commit)();
    }
}

pub type TaskHandler =
    Arc<dyn Fn(ExecutionTask, ConsumeContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Durable FIFO-per-`execution_id` queue with consumer-group rebalancing.
/// Per-partition max-in-flight is always 1: a partition's next message is
/// not delivered to anyone until the current one commits or its visibility
/// timeout elapses.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    async fn publish_task(&self, task: ExecutionTask) -> Result<(), QueueError>;

    /// Joins `consumer_id` to `group`; triggers a rebalance of partition
    /// ownership across the group's live consumers. `handler` is invoked
    /// for each delivery assigned to this consumer.
    async fn consume_tasks(
        &self,
        group: &str,
        consumer_id: &str,
        handler: TaskHandler,
    ) -> Result<(), QueueError>;

    /// Leaves the group; triggers a rebalance of the vacated partitions.
    async fn stop_consuming(&self, group: &str, consumer_id: &str) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// Stable partition for a queue/bus key, shared by [`crate::queue`] and
/// [`crate::eventbus`] so both route the same `execution_id` consistently.
pub fn partition_for(execution_id: Uuid, partition_count: u32) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    execution_id.hash(&mut hasher);
    (hasher.finish() % partition_count as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitioning_is_stable_for_the_same_id() {
        let id = Uuid::now_v7();
        assert_eq!(partition_for(id, 8), partition_for(id, 8));
    }

    #[test]
    fn partitioning_stays_in_range() {
        let id = Uuid::now_v7();
        assert!(partition_for(id, 8) < 8);
    }
}
