//! Worker pool.
//!
//! Runs a fixed number of workers, one supervisor task per slot. When a
//! worker stops for any reason other than pool shutdown (killed by a client,
//! engine died) the supervisor starts a replacement with a fresh id and a
//! fresh engine, retrying with backoff if the bus refuses.

use crate::engine::MediaEngine;
use crate::observability::{metrics, HealthState};
use crate::worker::{ExitReason, Worker, WorkerOptions};
use common::backoff;
use common::bus::Bus;
use common::error::BusError;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Builds a fresh engine for each (re)started worker.
pub type EngineFactory = Arc<dyn Fn() -> Arc<dyn MediaEngine> + Send + Sync>;

struct PoolInner {
    bus: Arc<dyn Bus>,
    options: WorkerOptions,
    factory: EngineFactory,
    health: Arc<HealthState>,
    slots: Mutex<Vec<Option<Worker>>>,
    cancel_token: CancellationToken,
}

impl PoolInner {
    fn set_slot(&self, slot: usize, worker: Option<Worker>) {
        let alive = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = slots.get_mut(slot) {
                *entry = worker;
            }
            slots.iter().flatten().filter(|w| w.is_alive()).count()
        };
        metrics::set_pool_alive(alive);
        self.health.set_workers_alive(alive);
    }

    async fn start_worker(&self) -> Result<Worker, BusError> {
        Worker::start(
            Arc::clone(&self.bus),
            (self.factory)(),
            self.options.clone(),
        )
        .await
    }
}

/// A supervised set of workers.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Start `size` workers.
    ///
    /// # Errors
    ///
    /// Returns the bus error if any of the initial workers cannot start.
    /// Workers already started are closed again.
    pub async fn start(
        bus: Arc<dyn Bus>,
        factory: EngineFactory,
        options: WorkerOptions,
        size: usize,
        health: Arc<HealthState>,
    ) -> Result<Self, BusError> {
        let inner = Arc::new(PoolInner {
            bus,
            options,
            factory,
            health,
            slots: Mutex::new(vec![None; size]),
            cancel_token: CancellationToken::new(),
        });

        let mut started = Vec::with_capacity(size);
        for _ in 0..size {
            match inner.start_worker().await {
                Ok(worker) => started.push(worker),
                Err(e) => {
                    for worker in &started {
                        worker.close(ExitReason::Shutdown).await;
                    }
                    return Err(e);
                }
            }
        }

        let mut supervisors = Vec::with_capacity(size);
        for (slot, worker) in started.into_iter().enumerate() {
            inner.set_slot(slot, Some(worker.clone()));
            supervisors.push(tokio::spawn(supervise(Arc::clone(&inner), slot, worker)));
        }

        info!(target: "worker.pool", size, "Worker pool started");
        Ok(Self {
            inner,
            supervisors: Mutex::new(supervisors),
        })
    }

    /// Workers currently alive.
    #[must_use]
    pub fn workers(&self) -> Vec<Worker> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .filter(|w| w.is_alive())
            .cloned()
            .collect()
    }

    /// Close every worker and stop respawning.
    pub async fn close(&self) {
        self.inner.cancel_token.cancel();
        let supervisors: Vec<_> = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for supervisor in supervisors {
            if let Err(e) = supervisor.await {
                warn!(target: "worker.pool", error = %e, "Supervisor task failed");
            }
        }
        info!(target: "worker.pool", "Worker pool closed");
    }
}

#[instrument(skip_all, name = "worker.pool", fields(slot = slot))]
async fn supervise(pool: Arc<PoolInner>, slot: usize, mut worker: Worker) {
    loop {
        tokio::select! {
            () = pool.cancel_token.cancelled() => {
                worker.close(ExitReason::Shutdown).await;
                pool.set_slot(slot, None);
                return;
            }
            () = worker.closed() => {}
        }

        pool.set_slot(slot, None);
        let reason = worker.exit_reason().unwrap_or(ExitReason::EngineDied);
        if pool.cancel_token.is_cancelled() {
            return;
        }

        warn!(
            target: "worker.pool",
            worker_id = %worker.id(),
            reason = reason.as_str(),
            "Worker stopped, starting replacement"
        );
        metrics::record_worker_respawn(reason.as_str());

        let replacement =
            backoff::retry("worker respawn", &pool.cancel_token, None, || pool.start_worker())
                .await;
        let Some(replacement) = replacement else {
            return;
        };

        info!(
            target: "worker.pool",
            old_worker_id = %worker.id(),
            worker_id = %replacement.id(),
            "Replacement worker started"
        );
        pool.set_slot(slot, Some(replacement.clone()));
        worker = replacement;
    }
}
