//! PostgreSQL-backed [`EventBus`]: events are rows in `execution_events`;
//! subscriptions poll for `index > last_seen` the way a durable log with no
//! native push transport would be consumed.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::event::{EventData, ExecutionEvent, EventType};
use crate::queue::partition_for;

use super::{EventBatch, EventBus, EventBusError, EventSubscription, SubscribeOptions};

const POLL_INTERVAL: Duration = Duration::from_millis(150);

pub struct PostgresEventBus {
    pool: PgPool,
    partition_count: u32,
}

impl PostgresEventBus {
    pub fn new(pool: PgPool, partition_count: u32) -> Self {
        Self { pool, partition_count }
    }
}

#[async_trait]
impl EventBus for PostgresEventBus {
    async fn publish_event(
        &self,
        execution_id: Uuid,
        data: EventData,
        worker_id: &str,
    ) -> Result<ExecutionEvent, EventBusError> {
        let partition = partition_for(execution_id, self.partition_count) as i32;
        let event_type = EventType::from(&data);
        let event_type_str = serde_json::to_value(event_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let data_json = serde_json::to_value(&data).map_err(|e| EventBusError::Serialization(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO execution_events (execution_id, index, event_type, event_data, worker_id, partition_id)
            VALUES ($1, COALESCE((SELECT MAX(index) + 1 FROM execution_events WHERE execution_id = $1), 0), $2, $3, $4, $5)
            RETURNING index, timestamp
            "#,
        )
        .bind(execution_id)
        .bind(event_type_str)
        .bind(data_json)
        .bind(worker_id)
        .bind(partition)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EventBusError::Database(e.to_string()))?;

        Ok(ExecutionEvent {
            execution_id,
            index: row.get::<i64, _>("index") as u64,
            event_type,
            timestamp: row.get("timestamp"),
            data,
            worker_id: worker_id.to_string(),
        })
    }

    async fn subscribe_to_events(
        &self,
        execution_id: Uuid,
        from_index: u64,
        options: SubscribeOptions,
    ) -> Result<EventSubscription, EventBusError> {
        let pool = self.pool.clone();
        let (tx, rx) = mpsc::channel(16);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let early_skipped = Arc::new(AtomicU64::new(0));

        tokio::spawn(async move {
            let mut last_seen = from_index.saturating_sub(1);
            let mut idle_since = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }

                if idle_since.elapsed() > options.idle_timeout {
                    return;
                }

                let rows = sqlx::query(
                    r#"
                    SELECT index, event_type, event_data, worker_id, timestamp
                    FROM execution_events
                    WHERE execution_id = $1 AND index > $2
                    ORDER BY index
                    LIMIT $3
                    "#,
                )
                .bind(execution_id)
                .bind(last_seen as i64)
                .bind(options.batch.max_events as i64)
                .fetch_all(&pool)
                .await;

                let rows = match rows {
                    Ok(rows) => rows,
                    Err(_) => continue,
                };

                if rows.is_empty() {
                    continue;
                }

                let mut events = Vec::with_capacity(rows.len());
                for row in rows {
                    let index: i64 = row.get("index");
                    let event_type_str: String = row.get("event_type");
                    let Ok(event_type_value) = serde_json::from_value::<EventType>(serde_json::Value::String(event_type_str)) else {
                        continue;
                    };
                    let data_json: serde_json::Value = row.get("event_data");
                    let Ok(data) = serde_json::from_value::<EventData>(data_json) else { continue };
                    last_seen = index as u64;
                    events.push(ExecutionEvent {
                        execution_id,
                        index: index as u64,
                        event_type: event_type_value,
                        timestamp: row.get("timestamp"),
                        data,
                        worker_id: row.get("worker_id"),
                    });
                }

                idle_since = tokio::time::Instant::now();
                if tx.send(EventBatch { events }).await.is_err() {
                    return;
                }
            }
        });

        Ok(EventSubscription::new(rx, cancel_tx, early_skipped))
    }
}
