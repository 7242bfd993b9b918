use super::worker::{confirm_close, WorkerShared};
use super::{AnyTransport, Node, PipeTransport, PlainTransport, Transport, WebRtcTransport};
use crate::errors::ClientError;
use common::types::SimpleMap;
use common::wire::commands::{
    PipeTransportCreateArgs, PlainTransportCreateArgs, WebRtcTransportCreateArgs,
};
use common::wire::states::RouterState;
use std::fmt;
use std::sync::Arc;

/// A router on a worker.
#[derive(Clone)]
pub struct Router {
    node: Arc<Node<RouterState>>,
    worker: Arc<WorkerShared>,
}

impl Router {
    pub(crate) fn new(node: Arc<Node<RouterState>>, worker: Arc<WorkerShared>) -> Self {
        Self { node, worker }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.node.id()
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        self.worker.api.worker_id()
    }

    #[must_use]
    pub fn closed(&self) -> bool {
        self.node.closed()
    }

    #[must_use]
    pub fn app_data(&self) -> SimpleMap {
        self.node.read(|state| state.app_data.clone())
    }

    /// Latest mirrored snapshot.
    #[must_use]
    pub fn state(&self) -> RouterState {
        self.node.read(Clone::clone)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        self.worker.ensure_alive()?;
        if self.closed() {
            return Err(ClientError::AlreadyClosed("Router"));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// `AlreadyClosed` or `WorkerDead` locally, otherwise the command error.
    pub async fn create_webrtc_transport(
        &self,
        args: WebRtcTransportCreateArgs,
        repeat_key: &str,
    ) -> Result<WebRtcTransport, ClientError> {
        self.ensure_open()?;
        let state = self
            .worker
            .api
            .create_webrtc_transport(self.id(), args, repeat_key)
            .await?;
        let node = self.worker.model().register_transport(self.id(), state)?;
        Ok(WebRtcTransport::new(node, Arc::clone(&self.worker)))
    }

    /// # Errors
    ///
    /// `AlreadyClosed` or `WorkerDead` locally, otherwise the command error.
    pub async fn create_plain_transport(
        &self,
        args: PlainTransportCreateArgs,
        repeat_key: &str,
    ) -> Result<PlainTransport, ClientError> {
        self.ensure_open()?;
        let state = self
            .worker
            .api
            .create_plain_transport(self.id(), args, repeat_key)
            .await?;
        let node = self.worker.model().register_transport(self.id(), state)?;
        Ok(PlainTransport::new(node, Arc::clone(&self.worker)))
    }

    /// # Errors
    ///
    /// `AlreadyClosed` or `WorkerDead` locally, otherwise the command error.
    pub async fn create_pipe_transport(
        &self,
        args: PipeTransportCreateArgs,
        repeat_key: &str,
    ) -> Result<PipeTransport, ClientError> {
        self.ensure_open()?;
        let state = self
            .worker
            .api
            .create_pipe_transport(self.id(), args, repeat_key)
            .await?;
        let node = self.worker.model().register_transport(self.id(), state)?;
        Ok(PipeTransport::new(node, Arc::clone(&self.worker)))
    }

    /// Transports created on this router, in creation order.
    #[must_use]
    pub fn transports(&self) -> Vec<Box<dyn Transport>> {
        self.worker
            .model()
            .transports_of(self.id())
            .into_iter()
            .map(|node| -> Box<dyn Transport> {
                let worker = Arc::clone(&self.worker);
                match node {
                    AnyTransport::WebRtc(node) => Box::new(WebRtcTransport::new(node, worker)),
                    AnyTransport::Plain(node) => Box::new(PlainTransport::new(node, worker)),
                    AnyTransport::Pipe(node) => Box::new(PipeTransport::new(node, worker)),
                }
            })
            .collect()
    }

    /// Close the router and everything on it.
    ///
    /// Takes effect locally at once; the worker is told in the background.
    pub fn close(&self) {
        let Some(superseded) = self.worker.model().close_router(self.id()) else {
            return;
        };
        confirm_close(
            &self.worker,
            "router-close",
            self.id(),
            superseded,
            |api, id| async move { api.close_router(&id).await },
        );
    }
}

impl PartialEq for Router {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.id())
            .field("closed", &self.closed())
            .finish_non_exhaustive()
    }
}
