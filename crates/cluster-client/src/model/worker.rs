//! Worker handle and its status transitions.

use super::{settled, Router, WorkerModel};
use crate::api::WorkerApi;
use crate::errors::ClientError;
use crate::reconciler::run_reconciler;
use common::backoff;
use common::bus::Subscription;
use common::types::SimpleMap;
use common::wire::commands::RouterCreateArgs;
use common::wire::{Event, EventBox};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health of a worker as seen by this client.
///
/// `Healthy` and `Unhealthy` alternate with heartbeats; `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerStatus {
    #[default]
    Healthy,
    Unhealthy,
    Dead,
}

pub(crate) struct WorkerShared {
    pub(crate) api: WorkerApi,
    app_data: SimpleMap,
    model: Mutex<WorkerModel>,
    /// Close and kill confirmations.
    cancel_token: CancellationToken,
    /// The event reconciler; cancelled when the worker dies.
    events_token: CancellationToken,
    dead_reported: Arc<AtomicBool>,
    status_tx: broadcast::Sender<Worker>,
}

impl WorkerShared {
    pub(crate) fn model(&self) -> MutexGuard<'_, WorkerModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ensure_alive(&self) -> Result<(), ClientError> {
        if self.model().status() == WorkerStatus::Dead {
            return Err(ClientError::WorkerDead(self.api.worker_id().to_string()));
        }
        Ok(())
    }

    /// Confirm a local close or kill with the worker in the background,
    /// retrying until it succeeds, `superseded` is set, or the cluster
    /// closes.
    pub(crate) fn confirm<F, Fut>(
        &self,
        operation: &'static str,
        superseded: Arc<AtomicBool>,
        attempt: F,
    ) where
        F: Fn(WorkerApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        let api = self.api.clone();
        let cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            let worker_id = api.worker_id().to_string();
            let confirmed =
                backoff::retry(operation, &cancel, Some(&*superseded), || attempt(api.clone()))
                    .await;
            if confirmed.is_some() {
                debug!(target: "client.model", worker_id = %worker_id, operation, "Confirmed");
            }
        });
    }

    fn apply_event(&self, event_box: EventBox) {
        let model = self.model();
        if model.status() == WorkerStatus::Dead {
            return;
        }
        match event_box.event {
            Event::Router { state, .. } => model.apply_router(state),
            Event::WebRtcTransport { state, .. } => model.apply_transport(state),
            Event::PlainTransport { state, .. } => model.apply_transport(state),
            Event::PipeTransport { state, .. } => model.apply_transport(state),
            Event::Producer { state, .. } => model.apply_producer(state),
            Event::Consumer { state, .. } => model.apply_consumer(state),
        }
    }
}

/// A worker known to the cluster. Cheap to clone.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl Worker {
    pub(crate) fn new(
        api: WorkerApi,
        app_data: SimpleMap,
        cancel_token: CancellationToken,
        status_tx: broadcast::Sender<Worker>,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                api,
                app_data,
                model: Mutex::new(WorkerModel::default()),
                events_token: cancel_token.child_token(),
                cancel_token,
                dead_reported: Arc::new(AtomicBool::new(false)),
                status_tx,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.shared.api.worker_id()
    }

    /// Application metadata from the worker's first heartbeat.
    #[must_use]
    pub fn app_data(&self) -> &SimpleMap {
        &self.shared.app_data
    }

    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        self.shared.model().status()
    }

    /// Raw command access to the worker.
    #[must_use]
    pub fn api(&self) -> &WorkerApi {
        &self.shared.api
    }

    /// Create a router. Repeating a call with the same non-empty
    /// `repeat_key` returns the same router; an empty key always creates a
    /// new one.
    ///
    /// # Errors
    ///
    /// `WorkerDead` if the worker is dead, otherwise the command error.
    pub async fn create_router(
        &self,
        args: RouterCreateArgs,
        repeat_key: &str,
    ) -> Result<Router, ClientError> {
        self.shared.ensure_alive()?;
        let state = self.shared.api.create_router(args, repeat_key).await?;
        let node = self.shared.model().register_router(state);
        Ok(Router::new(node, Arc::clone(&self.shared)))
    }

    /// Routers created through this client, in creation order.
    #[must_use]
    pub fn routers(&self) -> Vec<Router> {
        self.shared
            .model()
            .routers()
            .into_iter()
            .map(|node| Router::new(node, Arc::clone(&self.shared)))
            .collect()
    }

    #[must_use]
    pub fn router(&self, id: &str) -> Option<Router> {
        let node = self.shared.model().router(id)?;
        Some(Router::new(node, Arc::clone(&self.shared)))
    }

    /// Kill the worker.
    ///
    /// The worker becomes dead locally right away and every resource is
    /// closed; the kill command is then retried in the background until it
    /// succeeds or a dead report arrives.
    pub fn kill(&self) {
        if !self.go_dead() {
            return;
        }
        info!(target: "client.cluster", worker_id = %self.id(), "Killing worker");
        self.shared.confirm(
            "worker-kill",
            Arc::clone(&self.shared.dead_reported),
            |api| async move { api.kill_worker().await },
        );
    }

    /// Start delivering the worker's events into the model.
    pub(crate) fn start_events(&self, subscription: Subscription, batch_size: u64) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_reconciler(
            self.shared.api.clone(),
            subscription,
            batch_size,
            self.shared.events_token.clone(),
            move |event_box| shared.apply_event(event_box),
        ));
    }

    /// A fresh heartbeat arrived.
    pub(crate) fn on_report(&self) {
        let recovered = {
            let mut model = self.shared.model();
            if model.status() == WorkerStatus::Unhealthy {
                model.set_status(WorkerStatus::Healthy);
                true
            } else {
                false
            }
        };
        if recovered {
            info!(target: "client.cluster", worker_id = %self.id(), "Worker healthy again");
            self.notify();
        }
    }

    /// No heartbeat within the timeout.
    pub(crate) fn on_report_timeout(&self) {
        let demoted = {
            let mut model = self.shared.model();
            if model.status() == WorkerStatus::Healthy {
                model.set_status(WorkerStatus::Unhealthy);
                true
            } else {
                false
            }
        };
        if demoted {
            warn!(target: "client.cluster", worker_id = %self.id(), "Worker missed heartbeats");
            self.notify();
        }
    }

    /// The worker reported itself dead.
    pub(crate) fn on_dead_report(&self) {
        self.shared.dead_reported.store(true, Ordering::Release);
        if self.go_dead() {
            info!(target: "client.cluster", worker_id = %self.id(), "Worker reported dead");
        }
    }

    /// Move to dead, close every resource and stop event delivery. Returns
    /// false if the worker was already dead.
    pub(crate) fn go_dead(&self) -> bool {
        {
            let mut model = self.shared.model();
            if model.status() == WorkerStatus::Dead {
                return false;
            }
            model.set_status(WorkerStatus::Dead);
            model.close_all();
        }
        self.shared.events_token.cancel();
        self.notify();
        true
    }

    fn notify(&self) {
        // No receivers is fine.
        let _ = self.shared.status_tx.send(self.clone());
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Worker {}

/// Close confirmation for a resource. `close` is the API call that closes
/// it.
pub(crate) fn confirm_close<F, Fut, T>(
    shared: &WorkerShared,
    operation: &'static str,
    id: &str,
    superseded: Arc<AtomicBool>,
    close: F,
) where
    F: Fn(WorkerApi, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
    T: Send + 'static,
{
    let id = id.to_string();
    shared.confirm(operation, superseded, move |api| {
        let attempt = close(api, id.clone());
        async move { settled(attempt.await) }
    });
}
