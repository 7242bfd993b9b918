//! NATS adapter for the [`Bus`] trait.

use super::{Bus, BusMessage, Subscription};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::secret::ExposeSecret;
use async_nats::{ConnectOptions, RequestErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Maximum delay between reconnect attempts.
const MAX_RECONNECT_DELAY_MS: u64 = 5_000;

/// Bus backed by a NATS connection.
#[derive(Debug, Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to the configured NATS servers.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Transport` if the initial connection fails.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let servers = config.server_list();
        info!(target: "common.bus", servers = %servers, "Connecting to NATS");

        let options = match &config.token {
            Some(token) => ConnectOptions::with_token(token.expose_secret().to_string()),
            None => ConnectOptions::new(),
        };

        let client = options
            .name(&config.name)
            .reconnect_delay_callback(|attempts| {
                let attempts = u64::try_from(attempts).unwrap_or(u64::MAX);
                Duration::from_millis(attempts.saturating_mul(100).min(MAX_RECONNECT_DELAY_MS))
            })
            .connect(servers.as_str())
            .await
            .map_err(|e| BusError::Transport(format!("Failed to connect to NATS: {e}")))?;

        info!(target: "common.bus", "Connected to NATS");
        Ok(Self { client })
    }

    /// Wrap an already connected client.
    #[must_use]
    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = tx.closed() => break,
                    message = subscriber.next() => message,
                };
                let Some(message) = message else {
                    break;
                };
                let forwarded = BusMessage {
                    topic: message.subject.to_string(),
                    payload: message.payload,
                    reply: message.reply.map(|r| r.to_string()),
                };
                if tx.send(forwarded).is_err() {
                    break;
                }
            }
            // Unsubscribes on drop
            debug!(target: "common.bus", topic = %topic, "Subscription forwarder stopped");
        });

        Ok(Subscription::new(rx))
    }

    async fn request(
        &self,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        let request = self.client.request(topic.to_string(), payload);
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(message)) => Ok(message.payload),
            Ok(Err(e)) => Err(match e.kind() {
                RequestErrorKind::TimedOut => BusError::Timeout,
                RequestErrorKind::NoResponders => BusError::NoResponders,
                _ => BusError::Transport(e.to_string()),
            }),
            Err(_) => Err(BusError::Timeout),
        }
    }
}
