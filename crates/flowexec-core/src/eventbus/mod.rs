//! Event Bus (C4): durable per-execution append log with partition-aware,
//! replay-capable subscriptions.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::event::{EventData, ExecutionEvent};

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A non-empty, ascending-by-`index` slice of events for one execution.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<ExecutionEvent>,
}

/// Batching knobs: deliver as soon as `max_events` accumulate, or
/// `max_wait` elapses since the first buffered event, whichever is first.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_events: usize,
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_events: 100, max_wait: Duration::from_millis(200) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    pub batch: BatchConfig,
    /// Subscription is torn down after this long with no events delivered.
    pub idle_timeout: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { batch: BatchConfig::default(), idle_timeout: Duration::from_secs(300) }
    }
}

/// A live, cooperatively-cancellable handle to a subscription. Dropping it
/// (or calling [`EventSubscription::close`]) releases the underlying reader
/// promptly; an idle subscription tears itself down after `idle_timeout`.
pub struct EventSubscription {
    receiver: tokio::sync::mpsc::Receiver<EventBatch>,
    cancel: tokio::sync::watch::Sender<bool>,
    early_skipped_count: Arc<AtomicU64>,
}

impl EventSubscription {
    pub(crate) fn new(
        receiver: tokio::sync::mpsc::Receiver<EventBatch>,
        cancel: tokio::sync::watch::Sender<bool>,
        early_skipped_count: Arc<AtomicU64>,
    ) -> Self {
        Self { receiver, cancel, early_skipped_count }
    }

    /// Awaits the next batch; `None` once the subscription has closed
    /// (consumer cancelled, idle timeout elapsed, or the bus shut down).
    pub async fn next_batch(&mut self) -> Option<EventBatch> {
        self.receiver.recv().await
    }

    pub fn close(&self) {
        let _ = self.cancel.send(true);
    }

    /// Count of messages discarded by the partition-hint pre-filter before
    /// any full deserialisation/comparison — see [`partition_for`](crate::queue::partition_for).
    pub fn early_skipped_count(&self) -> u64 {
        self.early_skipped_count.load(Ordering::Relaxed)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Durable append-only per-execution event log with partition-aware,
/// replay-capable subscribe.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Appends the next event for `execution_id` (index assigned by the
    /// bus, monotonic and gap-free per execution) and returns it.
    async fn publish_event(
        &self,
        execution_id: Uuid,
        data: EventData,
        worker_id: &str,
    ) -> Result<ExecutionEvent, EventBusError>;

    /// Every event with `index >= from_index` for `execution_id` is
    /// observed at least once, in ascending order, by the returned
    /// subscription — durable history first, then live traffic.
    async fn subscribe_to_events(
        &self,
        execution_id: Uuid,
        from_index: u64,
        options: SubscribeOptions,
    ) -> Result<EventSubscription, EventBusError>;
}
