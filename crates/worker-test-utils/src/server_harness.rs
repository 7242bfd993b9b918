//! Test server harness for in-process worker clusters.
//!
//! Spawns a real [`WorkerPool`] of loopback engines on a shared bus, so
//! client tests exercise the full command, event and heartbeat paths without
//! NATS.

use common::bus::{Bus, MemoryBus};
use common::types::SimpleMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use worker_service::engine::{LoopbackConfig, LoopbackEngine, MediaEngine};
use worker_service::observability::HealthState;
use worker_service::pool::{EngineFactory, WorkerPool};
use worker_service::worker::{Worker, WorkerOptions};

/// Root topic every harness cluster runs under.
pub const TEST_ROOT_TOPIC: &str = "test";

/// Heartbeat interval of harness workers. Short so tests converge quickly.
pub const TEST_REPORT_INTERVAL: Duration = Duration::from_millis(50);

/// An in-process worker cluster for tests.
///
/// # Example
/// ```rust,ignore
/// let cluster = TestCluster::spawn(1).await;
/// let worker_id = cluster.workers()[0].id().to_string();
/// // ... drive commands over cluster.bus() ...
/// cluster.close().await;
/// ```
pub struct TestCluster {
    bus: Arc<dyn Bus>,
    pool: WorkerPool,
    engines: Arc<Mutex<Vec<Arc<LoopbackEngine>>>>,
    health: Arc<HealthState>,
}

impl TestCluster {
    /// Spawn `workers` workers on a fresh in-memory bus.
    pub async fn spawn(workers: usize) -> Self {
        Self::spawn_on(Arc::new(MemoryBus::new()), workers).await
    }

    /// Spawn `workers` workers on `bus`, e.g. a [`crate::LossyBus`].
    pub async fn spawn_on(bus: Arc<dyn Bus>, workers: usize) -> Self {
        let engines: Arc<Mutex<Vec<Arc<LoopbackEngine>>>> = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::clone(&engines);
        let factory: EngineFactory = Arc::new(move || {
            let engine = Arc::new(LoopbackEngine::new(LoopbackConfig::default()));
            created.lock().unwrap().push(Arc::clone(&engine));
            engine as Arc<dyn MediaEngine>
        });

        let options = WorkerOptions {
            root_topic: TEST_ROOT_TOPIC.to_string(),
            app_data: SimpleMap::new(),
            report_interval: TEST_REPORT_INTERVAL,
        };

        let health = Arc::new(HealthState::new());
        let pool = WorkerPool::start(
            Arc::clone(&bus),
            factory,
            options,
            workers,
            Arc::clone(&health),
        )
        .await
        .expect("Failed to start test worker pool");

        Self {
            bus,
            pool,
            engines,
            health,
        }
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        Arc::clone(&self.bus)
    }

    pub fn root_topic(&self) -> &'static str {
        TEST_ROOT_TOPIC
    }

    /// Workers currently alive.
    pub fn workers(&self) -> Vec<Worker> {
        self.pool.workers()
    }

    /// Every engine the pool has created so far, in creation order.
    ///
    /// Initial workers are started in order, so right after `spawn` engine
    /// `i` belongs to worker `i`.
    pub fn engines(&self) -> Vec<Arc<LoopbackEngine>> {
        self.engines.lock().unwrap().clone()
    }

    pub fn health(&self) -> Arc<HealthState> {
        Arc::clone(&self.health)
    }

    /// Close every worker; each publishes a dead report.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_starts_workers_and_engines() {
        let cluster = TestCluster::spawn(2).await;
        assert_eq!(cluster.workers().len(), 2);
        assert_eq!(cluster.engines().len(), 2);
        assert_eq!(cluster.health().workers_alive(), 2);

        cluster.close().await;
        assert!(cluster.workers().is_empty());
    }
}
