//! In-process bus.
//!
//! Fans each publish out to every live subscriber of the exact topic.
//! Requests subscribe a private inbox, publish with it as the reply address
//! and wait for the first message on it.

use super::{Bus, BusMessage, Subscription};
use crate::error::BusError;
use crate::types::new_id;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>;

/// Cloneable handle to a shared in-memory bus.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<Subscribers>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every subscriber of `topic`; returns how many received it.
    fn deliver(&self, topic: &str, payload: Bytes, reply: Option<String>) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };

        subscribers.retain(|tx| {
            tx.send(BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                reply: reply.clone(),
            })
            .is_ok()
        });
        let delivered = subscribers.len();
        if delivered == 0 {
            topics.remove(topic);
        }
        delivered
    }

    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        self.deliver(topic, payload, None);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn request(
        &self,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        let inbox = format!("_INBOX.{}", new_id());
        let mut replies = self.subscribe(&inbox).await?;

        let result = if self.deliver(topic, payload, Some(inbox.clone())) == 0 {
            Err(BusError::NoResponders)
        } else {
            match tokio::time::timeout(timeout, replies.recv()).await {
                Ok(Some(message)) => Ok(message.payload),
                Ok(None) => Err(BusError::Closed),
                Err(_) => Err(BusError::Timeout),
            }
        };

        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&inbox);
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_fans_out() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("root.report").await.unwrap();
        let mut b = bus.subscribe("root.report").await.unwrap();

        bus.publish("root.report", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(a.recv().await.unwrap().payload, Bytes::from_static(b"hello"));
        assert_eq!(b.recv().await.unwrap().payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        assert!(bus.publish("nobody", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("t").await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 1);

        drop(sub);
        bus.publish("t", Bytes::new()).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = MemoryBus::new();
        let mut server = bus.subscribe("root.w1.commands").await.unwrap();

        let responder = bus.clone();
        tokio::spawn(async move {
            let message = server.recv().await.unwrap();
            let reply = message.reply.unwrap();
            responder
                .publish(&reply, Bytes::from_static(b"pong"))
                .await
                .unwrap();
        });

        let reply = bus
            .request(
                "root.w1.commands",
                Bytes::from_static(b"ping"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_request_without_responders() {
        let bus = MemoryBus::new();
        let result = bus
            .request("root.w1.commands", Bytes::new(), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(BusError::NoResponders));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let bus = MemoryBus::new();
        let _silent = bus.subscribe("root.w1.commands").await.unwrap();

        let result = bus
            .request("root.w1.commands", Bytes::new(), Duration::from_secs(5))
            .await;
        assert_eq!(result, Err(BusError::Timeout));
    }
}
