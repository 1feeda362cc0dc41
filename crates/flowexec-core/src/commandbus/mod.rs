//! Command Bus (C3): low-latency fan-out of control commands.
//!
//! Durability matters far less here than latency — a short retention
//! window is fine, since a command a worker misses because it wasn't yet
//! subscribed is, by definition, not actionable anyway (the worker re-reads
//! its own claim before acting on anything it does receive).

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::command::ExecutionCommand;

#[derive(Debug, thiserror::Error)]
pub enum CommandBusError {
    #[error("command bus is closed")]
    Closed,
}

#[async_trait]
pub trait CommandBus: Send + Sync + 'static {
    async fn publish_command(&self, command: ExecutionCommand) -> Result<(), CommandBusError>;

    /// Subscribe to every command published from here on. Callers filter to
    /// the `execution_id`s they currently claim themselves.
    fn subscribe(&self) -> broadcast::Receiver<ExecutionCommand>;
}

/// In-process command bus backed by a broadcast channel — every subscriber
/// sees every command, same fan-out semantics the real deployment's
/// pub/sub transport provides.
pub struct InMemoryCommandBus {
    sender: broadcast::Sender<ExecutionCommand>,
}

impl InMemoryCommandBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for InMemoryCommandBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl CommandBus for InMemoryCommandBus {
    async fn publish_command(&self, command: ExecutionCommand) -> Result<(), CommandBusError> {
        // No active subscribers is not an error: a command with nobody
        // claiming its execution right now is simply a no-op delivery.
        let _ = self.sender.send(command);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ExecutionCommand> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use uuid::Uuid;

    #[tokio::test]
    async fn every_subscriber_sees_every_command() {
        let bus = InMemoryCommandBus::default();
        let mut sub_a = bus.subscribe();
        let mut sub_b = bus.subscribe();

        let command = ExecutionCommand::new(Uuid::now_v7(), CommandKind::Stop, "test");
        bus.publish_command(command.clone()).await.unwrap();

        assert_eq!(sub_a.recv().await.unwrap().id, command.id);
        assert_eq!(sub_b.recv().await.unwrap().id, command.id);
    }

    #[tokio::test]
    async fn publishing_with_no_subscribers_does_not_error() {
        let bus = InMemoryCommandBus::default();
        let command = ExecutionCommand::new(Uuid::now_v7(), CommandKind::Pause, "test");
        assert!(bus.publish_command(command).await.is_ok());
    }
}
