//! In-process [`TaskQueue`] with partition-FIFO ordering and consumer-group
//! rebalancing, for tests and the bundled CLI demo.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::task::ExecutionTask;

use super::{partition_for, ConsumeContext, QueueError, TaskHandler, TaskQueue};

const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct InFlight {
    message_id: Uuid,
    delivered_at: std::time::Instant,
}

struct QueuedMessage {
    id: Uuid,
    task: ExecutionTask,
    visible_at: std::time::Instant,
}

struct Partition {
    messages: VecDeque<QueuedMessage>,
    in_flight: Option<InFlight>,
    owner: Option<String>,
}

impl Default for Partition {
    fn default() -> Self {
        Self { messages: VecDeque::new(), in_flight: None, owner: None }
    }
}

struct Group {
    consumers: Vec<String>,
}

struct Inner {
    partitions: Vec<Mutex<Partition>>,
    groups: Mutex<HashMap<String, Group>>,
}

/// In-memory [`TaskQueue`]. Partition count is fixed at construction;
/// repartitioning is an operator-driven drain-then-resize operation, not
/// something this type supports online.
pub struct InMemoryTaskQueue {
    inner: Arc<Inner>,
    closed: Arc<AtomicBool>,
    consumer_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl InMemoryTaskQueue {
    pub fn new(partition_count: u32) -> Self {
        let partitions = (0..partition_count).map(|_| Mutex::new(Partition::default())).collect();
        Self {
            inner: Arc::new(Inner { partitions, groups: Mutex::new(HashMap::new()) }),
            closed: Arc::new(AtomicBool::new(false)),
            consumer_tasks: Mutex::new(Vec::new()),
        }
    }

    fn partition_count(&self) -> u32 {
        self.inner.partitions.len() as u32
    }

    /// Recompute round-robin partition ownership across a group's consumers.
    fn rebalance(inner: &Inner, group: &str) {
        let groups = inner.groups.lock();
        let Some(g) = groups.get(group) else { return };
        if g.consumers.is_empty() {
            for partition in &inner.partitions {
                partition.lock().owner = None;
            }
            return;
        }
        for (idx, partition) in inner.partitions.iter().enumerate() {
            let owner = g.consumers[idx % g.consumers.len()].clone();
            partition.lock().owner = Some(owner);
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn publish_task(&self, task: ExecutionTask) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Closed);
        }
        let partition = partition_for(task.execution_id, self.partition_count()) as usize;
        let mut guard = self.inner.partitions[partition].lock();
        guard.messages.push_back(QueuedMessage {
            id: Uuid::now_v7(),
            task,
            visible_at: std::time::Instant::now(),
        });
        Ok(())
    }

    async fn consume_tasks(
        &self,
        group: &str,
        consumer_id: &str,
        handler: TaskHandler,
    ) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Closed);
        }

        {
            let mut groups = self.inner.groups.lock();
            let entry = groups.entry(group.to_string()).or_insert_with(|| Group { consumers: Vec::new() });
            if !entry.consumers.iter().any(|c| c == consumer_id) {
                entry.consumers.push(consumer_id.to_string());
            }
        }
        Self::rebalance(&self.inner, group);

        let inner = self.inner.clone();
        let closed = self.closed.clone();
        let consumer_id = consumer_id.to_string();
        let partition_count = self.partition_count();

        let task = tokio::spawn(async move {
            loop {
                if closed.load(Ordering::Relaxed) {
                    return;
                }
                let mut delivered_any = false;
                for idx in 0..partition_count as usize {
                    let partition = &inner.partitions[idx];
                    let owned = {
                        let p = partition.lock();
                        p.owner.as_deref() == Some(consumer_id.as_str())
                    };
                    if !owned {
                        continue;
                    }

                    let next = {
                        let mut p = partition.lock();
                        if let Some(in_flight) = &p.in_flight {
                            if in_flight.delivered_at.elapsed() < VISIBILITY_TIMEOUT {
                                continue;
                            }
                            // visibility timeout elapsed: treat as redelivery
                            p.in_flight = None;
                        }
                        let now = std::time::Instant::now();
                        let popped = p.messages.front().filter(|m| m.visible_at <= now).map(|m| m.id);
                        popped.map(|id| {
                            let msg = p.messages.pop_front().unwrap();
                            debug_assert_eq!(msg.id, id);
                            p.in_flight = Some(InFlight { message_id: msg.id, delivered_at: now });
                            msg
                        })
                    };

                    let Some(msg) = next else { continue };
                    delivered_any = true;

                    let message_id = msg.id;
                    let commit_inner = inner.clone();
                    let commit = Arc::new(move || {
                        let mut p = commit_inner.partitions[idx].lock();
                        if p.in_flight.as_ref().map(|f| f.message_id) == Some(message_id) {
                            p.in_flight = None;
                        }
                    });

                    let ctx = ConsumeContext { commit };
                    tokio::spawn(handler(msg.task, ctx));
                }

                if !delivered_any {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        });

        self.consumer_tasks.lock().push(task);
        Ok(())
    }

    async fn stop_consuming(&self, group: &str, consumer_id: &str) -> Result<(), QueueError> {
        {
            let mut groups = self.inner.groups.lock();
            if let Some(g) = groups.get_mut(group) {
                g.consumers.retain(|c| c != consumer_id);
            }
        }
        Self::rebalance(&self.inner, group);
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn delivers_tasks_in_publish_order_per_execution() {
        let queue = InMemoryTaskQueue::new(4);
        let execution_id = Uuid::now_v7();
        for i in 0..5u32 {
            let mut task = ExecutionTask::new(execution_id, Uuid::now_v7(), 0);
            task.context = serde_json::json!({"seq": i});
            queue.publish_task(task).await.unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: TaskHandler = Arc::new(move |task, ctx| {
            let tx = tx.clone();
            Box::pin(async move {
                ctx.commit_offset();
                let _ = tx.send(task.context["seq"].as_u64().unwrap());
            })
        });
        queue.consume_tasks("group-a", "consumer-1", handler).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn an_uncommitted_message_is_redelivered_after_visibility_timeout() {
        let queue = InMemoryTaskQueue::new(1);
        let execution_id = Uuid::now_v7();
        queue
            .publish_task(ExecutionTask::new(execution_id, Uuid::now_v7(), 0))
            .await
            .unwrap();

        let deliveries = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = deliveries.clone();
        let handler: TaskHandler = Arc::new(move |_task, ctx| {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n >= 1 {
                    ctx.commit_offset();
                }
                // first delivery deliberately does not commit
            })
        });
        queue.consume_tasks("group-a", "consumer-1", handler).await.unwrap();

        tokio::time::sleep(VISIBILITY_TIMEOUT + Duration::from_millis(200)).await;
        assert!(deliveries.load(Ordering::SeqCst) >= 2);
    }
}
