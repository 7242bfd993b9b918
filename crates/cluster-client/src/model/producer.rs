use super::worker::{confirm_close, WorkerShared};
use super::Node;
use crate::errors::ClientError;
use common::types::SimpleMap;
use common::wire::media::{MediaKind, RtpParameters};
use common::wire::states::{ProducerState, ProducerType};
use std::fmt;
use std::sync::Arc;

/// Media flowing into a router through a transport.
#[derive(Clone)]
pub struct Producer {
    node: Arc<Node<ProducerState>>,
    worker: Arc<WorkerShared>,
}

impl Producer {
    pub(crate) fn new(node: Arc<Node<ProducerState>>, worker: Arc<WorkerShared>) -> Self {
        Self { node, worker }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.node.id()
    }

    #[must_use]
    pub fn closed(&self) -> bool {
        self.node.closed()
    }

    /// Always true once closed.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.node.read(|state| state.paused)
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.node.read(|state| state.kind)
    }

    #[must_use]
    pub fn producer_type(&self) -> ProducerType {
        self.node.read(|state| state.producer_type)
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
    pub fn state(&self) -> ProducerState {
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
        let state = self.worker.api.pause_producer(self.id()).await?;
        self.worker.model().apply_producer(state);
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
        let state = self.worker.api.resume_producer(self.id()).await?;
        self.worker.model().apply_producer(state);
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
        let Some(superseded) = self.worker.model().close_producer(self.id()) else {
            return;
        };
        confirm_close(
            &self.worker,
            "produce-close",
            self.id(),
            superseded,
            |api, id| async move { api.close_producer(&id).await },
        );
    }
}

impl PartialEq for Producer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id())
            .field("closed", &self.closed())
            .field("paused", &self.paused())
            .finish_non_exhaustive()
    }
}
