//! One media worker: a media engine plus everything that exposes it on the
//! bus.
//!
//! A started worker runs four tasks, all stopped by its cancellation token:
//!
//! - command loop: one spawned task per inbound command, reply published
//!   only while the worker is alive
//! - event publisher: forwards appended events to `<root>.<id>.events` in
//!   seq order
//! - engine watcher: applies engine notifications, closes the worker when
//!   the engine dies
//! - heartbeat: `alive` reports on `<root>.report`
//!
//! Closing publishes a final `dead` report so clients do not have to wait
//! for a heartbeat timeout.

use crate::commands::CommandLayer;
use crate::engine::{EngineNotification, MediaEngine};
use crate::executor::WorkerExecutor;
use crate::heartbeat::{publish_report, run_heartbeat};
use crate::observability::metrics;
use bytes::Bytes;
use common::bus::{commands_topic, events_topic, Bus, BusMessage, Subscription};
use common::error::BusError;
use common::types::{new_id, SimpleMap};
use common::wire::{EventBox, ReportState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Settings shared by every worker of a pool.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub root_topic: String,
    pub app_data: SimpleMap,
    pub report_interval: Duration,
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A `worker-kill` command.
    Killed,
    /// The media engine went away.
    EngineDied,
    /// Process shutdown.
    Shutdown,
}

impl ExitReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Killed => "killed",
            Self::EngineDied => "engine_died",
            Self::Shutdown => "shutdown",
        }
    }
}

struct WorkerInner {
    id: String,
    bus: Arc<dyn Bus>,
    engine: Arc<dyn MediaEngine>,
    options: WorkerOptions,
    executor: Arc<WorkerExecutor>,
    commands: CommandLayer,
    alive: AtomicBool,
    exit_reason: OnceLock<ExitReason>,
    /// Stops the background tasks.
    cancel_token: CancellationToken,
    /// Fires once `close` has fully finished.
    done: CancellationToken,
}

/// Handle to a running worker. Cheap to clone.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Start a worker over `engine` and announce it on the bus.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the command subscription cannot be set up.
    pub async fn start(
        bus: Arc<dyn Bus>,
        engine: Arc<dyn MediaEngine>,
        options: WorkerOptions,
    ) -> Result<Self, BusError> {
        let id = new_id();
        let (executor, events) = WorkerExecutor::new(&id, Arc::clone(&engine));
        let executor = Arc::new(executor);

        // Subscribe before the first heartbeat so no command can arrive
        // unheard.
        let subscription = bus.subscribe(&commands_topic(&options.root_topic, &id)).await?;
        let notifications = engine.subscribe();

        let worker = Self {
            inner: Arc::new(WorkerInner {
                id: id.clone(),
                bus: Arc::clone(&bus),
                engine,
                commands: CommandLayer::new(Arc::clone(&executor)),
                executor,
                options: options.clone(),
                alive: AtomicBool::new(true),
                exit_reason: OnceLock::new(),
                cancel_token: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
        };

        tokio::spawn(run_commands(worker.clone(), subscription));
        tokio::spawn(run_event_publisher(worker.clone(), events));
        tokio::spawn(run_engine_watcher(worker.clone(), notifications));
        tokio::spawn(run_heartbeat(
            bus,
            options.root_topic,
            id.clone(),
            options.app_data,
            options.report_interval,
            worker.inner.cancel_token.child_token(),
        ));

        info!(target: "worker.worker", worker_id = %id, "Worker started");
        Ok(worker)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Why the worker stopped, once it has.
    #[must_use]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.inner.exit_reason.get().copied()
    }

    /// Current seq of the worker's event log.
    #[must_use]
    pub fn current_seq(&self) -> u64 {
        self.inner.executor.current_seq()
    }

    /// Stop the worker. Only the first call has an effect; later calls
    /// return immediately.
    pub async fn close(&self, reason: ExitReason) {
        if self.inner.alive.swap(false, Ordering::AcqRel) {
            let _ = self.inner.exit_reason.set(reason);
        } else {
            return;
        }

        info!(
            target: "worker.worker",
            worker_id = %self.inner.id,
            reason = reason.as_str(),
            "Worker closing"
        );
        self.inner.cancel_token.cancel();

        if let Err(e) = publish_report(
            self.inner.bus.as_ref(),
            &self.inner.options.root_topic,
            &self.inner.id,
            ReportState::Dead,
            &self.inner.options.app_data,
        )
        .await
        {
            warn!(target: "worker.worker", worker_id = %self.inner.id, error = %e, "Failed to publish dead report");
        }

        self.inner.engine.close().await;
        self.inner.done.cancel();
    }

    /// Wait until the worker has fully closed.
    pub async fn closed(&self) {
        self.inner.done.cancelled().await;
    }
}

#[instrument(skip_all, name = "worker.commands", fields(worker_id = %worker.inner.id))]
async fn run_commands(worker: Worker, mut subscription: Subscription) {
    let cancel_token = worker.inner.cancel_token.clone();
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            message = subscription.recv() => {
                let Some(message) = message else {
                    warn!(target: "worker.commands", "Command subscription ended");
                    break;
                };
                tokio::spawn(handle_message(worker.clone(), message));
            }
        }
    }
    debug!(target: "worker.commands", "Command loop stopped");
}

async fn handle_message(worker: Worker, message: BusMessage) {
    let handled = worker.inner.commands.handle(&message.payload).await;

    if !worker.is_alive() {
        debug!(
            target: "worker.commands",
            worker_id = %worker.inner.id,
            "Worker closed while handling command, reply dropped"
        );
        return;
    }

    match message.reply {
        Some(reply) => match serde_json::to_vec(&handled.reply) {
            Ok(payload) => {
                if let Err(e) = worker.inner.bus.publish(&reply, Bytes::from(payload)).await {
                    warn!(
                        target: "worker.commands",
                        worker_id = %worker.inner.id,
                        error = %e,
                        "Failed to publish reply"
                    );
                }
            }
            Err(e) => {
                error!(target: "worker.commands", worker_id = %worker.inner.id, error = %e, "Failed to encode reply");
            }
        },
        None => {
            debug!(target: "worker.commands", worker_id = %worker.inner.id, "Command without reply address");
        }
    }

    if handled.kill {
        worker.close(ExitReason::Killed).await;
    }
}

#[instrument(skip_all, name = "worker.events", fields(worker_id = %worker.inner.id))]
async fn run_event_publisher(worker: Worker, mut events: mpsc::UnboundedReceiver<EventBox>) {
    let topic = events_topic(&worker.inner.options.root_topic, &worker.inner.id);
    let cancel_token = worker.inner.cancel_token.clone();
    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(target: "worker.events", seq = event.seq, error = %e, "Failed to encode event");
                metrics::record_event_publish_failure();
                continue;
            }
        };
        if let Err(e) = worker.inner.bus.publish(&topic, Bytes::from(payload)).await {
            // Clients recover the event from the log.
            warn!(target: "worker.events", seq = event.seq, error = %e, "Failed to publish event");
            metrics::record_event_publish_failure();
        }
    }
}

#[instrument(skip_all, name = "worker.engine", fields(worker_id = %worker.inner.id))]
async fn run_engine_watcher(
    worker: Worker,
    mut notifications: broadcast::Receiver<EngineNotification>,
) {
    let cancel_token = worker.inner.cancel_token.clone();
    loop {
        let notification = tokio::select! {
            () = cancel_token.cancelled() => break,
            notification = notifications.recv() => notification,
        };

        match notification {
            Ok(EngineNotification::Died { reason }) => {
                error!(target: "worker.engine", reason = %reason, "Media engine died");
                worker.close(ExitReason::EngineDied).await;
                break;
            }
            Ok(notification) => worker.inner.executor.handle_notification(&notification),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(target: "worker.engine", missed, "Engine notifications lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!(target: "worker.engine", "Engine notification channel closed");
                worker.close(ExitReason::EngineDied).await;
                break;
            }
        }
    }
}
