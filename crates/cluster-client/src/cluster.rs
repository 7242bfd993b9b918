//! Cluster membership from worker heartbeats.
//!
//! The first alive report of an unknown worker adds it as healthy. Every
//! newer report restarts its heartbeat timer; a timer that fires demotes
//! the worker to unhealthy and, with [`HealthPolicy::dead_after_unhealthy`]
//! set, later to dead. A dead report (or [`Worker::kill`]) makes it dead,
//! which is terminal and closes all of its resources.
//!
//! Timers carry the epoch they were armed in. A report bumps the epoch, so
//! a timer that raced with a report does nothing.
//!
//! [`HealthPolicy::dead_after_unhealthy`]: crate::config::HealthPolicy

use crate::api::WorkerApi;
use crate::config::ClusterConfig;
use crate::errors::ClientError;
use crate::model::{Worker, WorkerStatus};
use common::bus::{events_topic, report_topic, Bus, Subscription};
use common::wire::{Report, ReportState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Capacity of the status notification channel. Slow receivers observe
/// `RecvError::Lagged` rather than blocking transitions.
const STATUS_CHANNEL_CAPACITY: usize = 256;

struct Member {
    worker: Worker,
    last_seen: u64,
    epoch: u64,
    timer: Option<AbortHandle>,
}

struct ClusterInner {
    bus: Arc<dyn Bus>,
    config: ClusterConfig,
    members: Mutex<HashMap<String, Member>>,
    population: watch::Sender<usize>,
    status_tx: broadcast::Sender<Worker>,
    cancel_token: CancellationToken,
}

impl ClusterInner {
    fn members(&self) -> MutexGuard<'_, HashMap<String, Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client view of every worker publishing on one root topic.
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Subscribe to worker heartbeats and start tracking membership.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the report topic cannot be subscribed.
    pub async fn connect(bus: Arc<dyn Bus>, config: ClusterConfig) -> Result<Self, ClientError> {
        let subscription = bus.subscribe(&report_topic(&config.root_topic)).await?;
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (population, _) = watch::channel(0);

        info!(
            target: "client.cluster",
            root_topic = %config.root_topic,
            heartbeat_timeout_ms = u64::try_from(config.health.heartbeat_timeout.as_millis())
                .unwrap_or(u64::MAX),
            "Cluster client connected"
        );

        let inner = Arc::new(ClusterInner {
            bus,
            config,
            members: Mutex::new(HashMap::new()),
            population,
            status_tx,
            cancel_token: CancellationToken::new(),
        });
        tokio::spawn(run_reports(Arc::clone(&inner), subscription));

        Ok(Self { inner })
    }

    /// Every worker seen so far, dead ones included.
    #[must_use]
    pub fn workers(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self
            .inner
            .members()
            .values()
            .map(|member| member.worker.clone())
            .collect();
        workers.sort_by(|a, b| a.id().cmp(b.id()));
        workers
    }

    #[must_use]
    pub fn worker(&self, id: &str) -> Option<Worker> {
        self.inner
            .members()
            .get(id)
            .map(|member| member.worker.clone())
    }

    /// Receive every worker whose status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<Worker> {
        self.inner.status_tx.subscribe()
    }

    /// Wait until at least `count` workers have been seen, then return
    /// the workers that are not dead.
    ///
    /// # Errors
    ///
    /// `Timeout` if fewer workers showed up within `timeout`.
    pub async fn wait_for_workers(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Worker>, ClientError> {
        let mut population = self.inner.population.subscribe();
        tokio::time::timeout(timeout, population.wait_for(|seen| *seen >= count))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::Bus("cluster closed".to_string()))?;

        Ok(self
            .workers()
            .into_iter()
            .filter(|worker| worker.status() != WorkerStatus::Dead)
            .collect())
    }

    /// Stop all background work: report handling, event delivery, timers
    /// and pending close or kill confirmations. Mirrored state is kept as
    /// it is.
    pub fn close(&self) {
        if self.inner.cancel_token.is_cancelled() {
            return;
        }
        self.inner.cancel_token.cancel();
        for member in self.inner.members().values_mut() {
            if let Some(timer) = member.timer.take() {
                timer.abort();
            }
        }
        info!(target: "client.cluster", "Cluster client closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}

#[instrument(skip_all, name = "client.cluster.reports")]
async fn run_reports(inner: Arc<ClusterInner>, mut subscription: Subscription) {
    loop {
        let message = tokio::select! {
            () = inner.cancel_token.cancelled() => break,
            message = subscription.recv() => message,
        };
        let Some(message) = message else {
            warn!(target: "client.cluster", "Report subscription ended");
            break;
        };

        match serde_json::from_slice::<Report>(&message.payload) {
            Ok(report) => handle_report(&inner, report).await,
            Err(e) => {
                debug!(target: "client.cluster", error = %e, "Discarding undecodable report");
            }
        }
    }
}

async fn handle_report(inner: &Arc<ClusterInner>, report: Report) {
    match report.state {
        ReportState::Alive => {
            let known = inner.members().contains_key(&report.worker_id);
            if known {
                refresh(inner, &report);
            } else {
                join(inner, report).await;
            }
        }
        ReportState::Dead => {
            let worker = {
                let mut members = inner.members();
                let Some(member) = members.get_mut(&report.worker_id) else {
                    return;
                };
                if let Some(timer) = member.timer.take() {
                    timer.abort();
                }
                member.worker.clone()
            };
            worker.on_dead_report();
        }
    }
}

/// Add a worker on its first alive report.
async fn join(inner: &Arc<ClusterInner>, report: Report) {
    let root = &inner.config.root_topic;

    // Subscribe before the reconciler fetches its baseline so no event
    // falls between the two.
    let subscription = match inner
        .bus
        .subscribe(&events_topic(root, &report.worker_id))
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(
                target: "client.cluster",
                worker_id = %report.worker_id,
                error = %e,
                "Failed to subscribe to worker events, will retry on next report"
            );
            return;
        }
    };

    let api = WorkerApi::new(
        Arc::clone(&inner.bus),
        root,
        &report.worker_id,
        inner.config.request_timeout,
    );
    let worker = Worker::new(
        api,
        report.app_data,
        inner.cancel_token.child_token(),
        inner.status_tx.clone(),
    );
    worker.start_events(subscription, inner.config.events_batch);

    let mut member = Member {
        worker,
        last_seen: report.time,
        epoch: 0,
        timer: None,
    };
    arm_timer(inner, &mut member);

    let mut members = inner.members();
    members.insert(report.worker_id.clone(), member);
    inner.population.send_replace(members.len());

    info!(
        target: "client.cluster",
        worker_id = %report.worker_id,
        workers = members.len(),
        "Worker joined"
    );
}

/// Apply an alive report of a known worker.
fn refresh(inner: &Arc<ClusterInner>, report: &Report) {
    let mut members = inner.members();
    let Some(member) = members.get_mut(&report.worker_id) else {
        return;
    };
    if report.time <= member.last_seen || member.worker.status() == WorkerStatus::Dead {
        return;
    }

    member.last_seen = report.time;
    member.worker.on_report();
    arm_timer(inner, member);
}

fn arm_timer(inner: &Arc<ClusterInner>, member: &mut Member) {
    if let Some(timer) = member.timer.take() {
        timer.abort();
    }
    member.epoch += 1;
    let task = tokio::spawn(run_health_timer(
        Arc::clone(inner),
        member.worker.clone(),
        member.epoch,
    ));
    member.timer = Some(task.abort_handle());
}

/// Sleep for `duration`. Returns false if the cluster closed first.
async fn sleep_or_cancel(cancel_token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = cancel_token.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

async fn run_health_timer(inner: Arc<ClusterInner>, worker: Worker, epoch: u64) {
    let policy = inner.config.health;

    if !sleep_or_cancel(&inner.cancel_token, policy.heartbeat_timeout).await {
        return;
    }
    {
        let members = inner.members();
        if !is_current(&members, worker.id(), epoch) {
            return;
        }
        worker.on_report_timeout();
    }

    let Some(dead_after) = policy.dead_after_unhealthy else {
        return;
    };
    if !sleep_or_cancel(&inner.cancel_token, dead_after).await {
        return;
    }

    let members = inner.members();
    if is_current(&members, worker.id(), epoch) && worker.status() == WorkerStatus::Unhealthy {
        warn!(
            target: "client.cluster",
            worker_id = %worker.id(),
            "Worker unhealthy for too long, treating as dead"
        );
        worker.go_dead();
    }
}

fn is_current(members: &HashMap<String, Member>, worker_id: &str, epoch: u64) -> bool {
    members
        .get(worker_id)
        .is_some_and(|member| member.epoch == epoch)
}
