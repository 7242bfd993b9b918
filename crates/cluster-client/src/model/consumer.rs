use super::worker::{confirm_close, WorkerShared};
use super::Node;
use crate::errors::ClientError;
use common::types::SimpleMap;
use common::wire::media::{MediaKind, RtpParameters};
use common::wire::states::{ConsumerState, ConsumerType};
use std::fmt;
use std::sync::Arc;

/// Media of one producer flowing out through a transport.
#[derive(Clone)]
pub struct Consumer {
    node: Arc<Node<ConsumerState>>,
    producer_id: String,
    worker: Arc<WorkerShared>,
}

impl Consumer {
    pub(crate) fn new(
        node: Arc<Node<ConsumerState>>,
        producer_id: String,
        worker: Arc<WorkerShared>,
    ) -> Self {
        Self {
            node,
            producer_id,
            worker,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.node.id()
    }

    #[must_use]
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    #[must_use]
    pub fn closed(&self) -> bool {
        self.node.closed()
    }

    /// True when paused locally or when the producer is paused; always true
    /// once closed.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.node.read(|state| state.paused)
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.node.read(|state| state.kind)
    }

    #[must_use]
    pub fn consumer_type(&self) -> ConsumerType {
        self.node.read(|state| state.consumer_type)
    }

    #[must_use]
    pub fn rtp_parameters(&self) -> RtpParameters {
        self.node.read(|state| state.rtp_parameters.clone())
    }

    #[must_use]
    pub fn app_data(&self) -> SimpleMap {
        self.node.read(|state| state.app_data.clone())
    }

    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.node.read(Clone::clone)
    }

    /// No-op once closed.
    ///
    /// # Errors
    ///
    /// Returns the command error.
    pub async fn pause(&self) -> Result<(), ClientError> {
        if self.closed() {
            return Ok(());
        }
        let state = self.worker.api.pause_consumer(self.id()).await?;
        self.worker.model().apply_consumer(state);
        Ok(())
    }

    /// No-op once closed.
    ///
    /// # Errors
    ///
    /// Returns the command error.
    pub async fn resume(&self) -> Result<(), ClientError> {
        if self.closed() {
            return Ok(());
        }
        let state = self.worker.api.resume_consumer(self.id()).await?;
        self.worker.model().apply_consumer(state);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the command error. `None` once closed.
    pub async fn get_stats(&self) -> Result<Option<serde_json::Value>, ClientError> {
        if self.closed() {
            return Ok(None);
        }
        self.worker.api.get_stats(self.id()).await
    }

    pub fn close(&self) {
        let Some(superseded) = self.worker.model().close_consumer(self.id()) else {
            return;
        };
        confirm_close(
            &self.worker,
            "consume-close",
            self.id(),
            superseded,
            |api, id| async move { api.close_consumer(&id).await },
        );
    }
}

impl PartialEq for Consumer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id())
            .field("producer_id", &self.producer_id)
            .field("closed", &self.closed())
            .finish_non_exhaustive()
    }
}
