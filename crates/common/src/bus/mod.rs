//! Message bus abstraction.
//!
//! Workers and clients never talk directly; every interaction is a publish,
//! a subscription, or a request/reply on one of three topics under a shared
//! root:
//!
//! | Topic | Pattern |
//! |-------|---------|
//! | `<root>.report` | heartbeats, fan-out |
//! | `<root>.<workerId>.commands` | request/reply |
//! | `<root>.<workerId>.events` | live events, fan-out |
//!
//! Delivery is at most once. Anything that needs more (ordering, recovery)
//! is built on top with sequence numbers and replay queries.

mod memory;
mod nats;

pub use memory::MemoryBus;
pub use nats::NatsBus;

use crate::error::BusError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

/// A message received on a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Inbox to publish the reply to, for request/reply traffic.
    pub reply: Option<String>,
}

/// Stream of messages for one topic. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    #[must_use]
    pub fn new(receiver: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { receiver }
    }

    /// Next message, or `None` once the bus side has gone away.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

/// Publish/subscribe plus request/reply over a shared message bus.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Fire-and-forget publish.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to every message published on `topic` from now on.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;

    /// Publish with a private reply inbox and wait for the first reply.
    async fn request(
        &self,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError>;
}

/// Topic carrying worker heartbeats.
#[must_use]
pub fn report_topic(root: &str) -> String {
    format!("{root}.report")
}

/// Topic a worker receives commands on.
#[must_use]
pub fn commands_topic(root: &str, worker_id: &str) -> String {
    format!("{root}.{worker_id}.commands")
}

/// Topic a worker publishes live events on.
#[must_use]
pub fn events_topic(root: &str, worker_id: &str) -> String {
    format!("{root}.{worker_id}.events")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(report_topic("media-cluster"), "media-cluster.report");
        assert_eq!(
            commands_topic("media-cluster", "w1"),
            "media-cluster.w1.commands"
        );
        assert_eq!(events_topic("media-cluster", "w1"), "media-cluster.w1.events");
    }
}
