//! Cluster client tests against a real worker pool on the in-memory bus.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::sync::Arc;
use std::time::Duration;

use cluster_client::{
    ClientError, Cluster, ClusterConfig, HealthPolicy, Transport, Worker, WorkerStatus,
};
use common::bus::{Bus, MemoryBus};
use common::wire::commands::{
    PipeTransportCreateArgs, PlainTransportConnectArgs, PlainTransportCreateArgs,
    WebRtcTransportCreateArgs,
};
use common::wire::media::{DtlsFingerprint, DtlsParameters, DtlsRole, IceState};
use common::wire::Event;
use worker_test_utils::server_harness::TEST_ROOT_TOPIC;
use worker_test_utils::{assert_eventually, fixtures, LossyBus, TestCluster};

const TIMEOUT: Duration = Duration::from_secs(3);

fn config() -> ClusterConfig {
    ClusterConfig {
        root_topic: TEST_ROOT_TOPIC.to_string(),
        request_timeout: Duration::from_secs(1),
        health: HealthPolicy {
            heartbeat_timeout: Duration::from_millis(500),
            dead_after_unhealthy: None,
        },
        ..ClusterConfig::default()
    }
}

async fn connect(servers: &TestCluster, workers: usize) -> (Cluster, Vec<Worker>) {
    let cluster = Cluster::connect(servers.bus(), config()).await.unwrap();
    let found = cluster.wait_for_workers(workers, TIMEOUT).await.unwrap();
    assert_eq!(found.len(), workers);
    (cluster, found)
}

/// Wait until the worker's event log holds a closed router `router_id`.
async fn wait_for_router_closed_event(worker: &Worker, router_id: &str) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let events = worker.api().get_events(0, 500).await.unwrap().events;
        let closed = events.iter().any(|event| {
            matches!(event, Event::Router { state, .. } if state.id == router_id && state.closed)
        });
        if closed {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "router {router_id} never closed on the worker"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn remote_dtls() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AA:BB:CC:DD".to_string(),
        }],
    }
}

#[tokio::test]
async fn test_workers_are_discovered_healthy() {
    let servers = TestCluster::spawn(2).await;
    let (cluster, workers) = connect(&servers, 2).await;

    let mut expected: Vec<String> = servers.workers().iter().map(|w| w.id().to_string()).collect();
    expected.sort();
    let found: Vec<String> = workers.iter().map(|w| w.id().to_string()).collect();
    assert_eq!(found, expected);
    assert!(workers.iter().all(|w| w.status() == WorkerStatus::Healthy));

    cluster.close();
    servers.close().await;
}

#[tokio::test]
async fn test_create_router_is_idempotent_per_repeat_key() {
    let servers = TestCluster::spawn(1).await;
    let (cluster, workers) = connect(&servers, 1).await;
    let worker = &workers[0];

    let first = worker.create_router(fixtures::router_args(), "r1").await.unwrap();
    let again = worker.create_router(fixtures::router_args(), "r1").await.unwrap();
    assert_eq!(first.id(), again.id());
    assert_eq!(first, again);
    assert!(!again.closed());
    assert_eq!(worker.routers().len(), 1);

    let other = worker.create_router(fixtures::router_args(), "").await.unwrap();
    assert_ne!(other.id(), first.id());
    assert_eq!(worker.routers().len(), 2);

    // An empty repeat key never deduplicates.
    let another = worker.create_router(fixtures::router_args(), "").await.unwrap();
    assert_ne!(another.id(), other.id());
    let x = other
        .create_plain_transport(PlainTransportCreateArgs::default(), "")
        .await
        .unwrap();
    let y = other
        .create_plain_transport(PlainTransportCreateArgs::default(), "")
        .await
        .unwrap();
    assert_ne!(x.id(), y.id());
    assert_eq!(other.transports().len(), 2);

    // Closing is idempotent on the worker as well.
    let closed = worker.api().close_router(first.id()).await.unwrap();
    assert!(closed.closed);
    let closed = worker.api().close_router(first.id()).await.unwrap();
    assert!(closed.closed);

    cluster.close();
    servers.close().await;
}

#[tokio::test]
async fn test_router_close_cascades_locally_then_confirms() {
    let servers = TestCluster::spawn(1).await;
    let (cluster, workers) = connect(&servers, 1).await;
    let worker = &workers[0];

    let router = worker.create_router(fixtures::router_args(), "").await.unwrap();
    let send = router
        .create_webrtc_transport(WebRtcTransportCreateArgs::default(), "")
        .await
        .unwrap();
    let recv = router
        .create_webrtc_transport(WebRtcTransportCreateArgs::default(), "")
        .await
        .unwrap();
    let producer = send
        .produce(fixtures::audio_produce_args(), "")
        .await
        .unwrap();
    let consumer = recv
        .consume(producer.id(), fixtures::consume_args(), "")
        .await
        .unwrap();
    assert_eq!(consumer.producer_id(), producer.id());
    assert_eq!(router.transports().len(), 2);

    router.close();

    // No round trip needed for any of this.
    assert!(router.closed());
    assert!(send.closed() && recv.closed());
    assert_eq!(send.ice_state(), IceState::Closed);
    assert!(producer.closed() && producer.paused());
    assert!(consumer.closed() && consumer.paused());

    wait_for_router_closed_event(worker, router.id()).await;

    cluster.close();
    servers.close().await;
}

#[tokio::test]
async fn test_closed_transport_refuses_operations() {
    let servers = TestCluster::spawn(1).await;
    let (cluster, workers) = connect(&servers, 1).await;
    let router = workers[0]
        .create_router(fixtures::router_args(), "")
        .await
        .unwrap();
    let transport = router
        .create_webrtc_transport(WebRtcTransportCreateArgs::default(), "")
        .await
        .unwrap();
    let producer = transport
        .produce(fixtures::audio_produce_args(), "")
        .await
        .unwrap();
    assert!(producer.get_stats().await.unwrap().is_some());

    transport.close();

    assert_eq!(
        transport.connect(remote_dtls()).await.unwrap_err(),
        ClientError::AlreadyClosed("Transport")
    );
    assert_eq!(
        transport.restart_ice().await.unwrap_err(),
        ClientError::AlreadyClosed("Transport")
    );
    assert!(matches!(
        transport.produce(fixtures::audio_produce_args(), "").await,
        Err(ClientError::AlreadyClosed("Transport"))
    ));
    assert!(transport.get_stats().await.unwrap().is_none());

    // Closed producers ignore pause and report no stats.
    producer.pause().await.unwrap();
    producer.resume().await.unwrap();
    assert!(producer.paused());
    assert!(producer.get_stats().await.unwrap().is_none());

    // The router itself is still usable.
    assert!(router
        .create_plain_transport(PlainTransportCreateArgs::default(), "")
        .await
        .is_ok());

    cluster.close();
    servers.close().await;
}

#[tokio::test]
async fn test_webrtc_connect_and_restart_ice() {
    let servers = TestCluster::spawn(1).await;
    let (cluster, workers) = connect(&servers, 1).await;
    let router = workers[0]
        .create_router(fixtures::router_args(), "")
        .await
        .unwrap();
    let transport = router
        .create_webrtc_transport(WebRtcTransportCreateArgs::default(), "")
        .await
        .unwrap();

    let before = transport.ice_parameters();
    transport.connect(remote_dtls()).await.unwrap();
    let restarted = transport.restart_ice().await.unwrap();
    assert_ne!(restarted, before);
    assert_eq!(transport.ice_parameters(), restarted);

    cluster.close();
    servers.close().await;
}

#[tokio::test]
async fn test_plain_and_pipe_connect_symmetry() {
    let servers = TestCluster::spawn(1).await;
    let (cluster, workers) = connect(&servers, 1).await;
    let router = workers[0]
        .create_router(fixtures::router_args(), "")
        .await
        .unwrap();

    let a = router
        .create_plain_transport(PlainTransportCreateArgs::default(), "")
        .await
        .unwrap();
    let b = router
        .create_plain_transport(PlainTransportCreateArgs::default(), "")
        .await
        .unwrap();
    assert_ne!(a.id(), b.id());
    assert_ne!(a.tuple().local_port, b.tuple().local_port);
    for (from, to) in [(&a, &b), (&b, &a)] {
        let target = to.tuple();
        from.connect(PlainTransportConnectArgs {
            ip: Some(target.local_ip.clone()),
            port: Some(target.local_port),
            ..PlainTransportConnectArgs::default()
        })
        .await
        .unwrap();
    }
    assert_eq!(a.tuple().remote_ip.as_deref(), Some(b.tuple().local_ip.as_str()));
    assert_eq!(a.tuple().remote_port, Some(b.tuple().local_port));
    assert_eq!(b.tuple().remote_ip.as_deref(), Some(a.tuple().local_ip.as_str()));
    assert_eq!(b.tuple().remote_port, Some(a.tuple().local_port));

    let c = router
        .create_pipe_transport(PipeTransportCreateArgs::default(), "")
        .await
        .unwrap();
    let d = router
        .create_pipe_transport(PipeTransportCreateArgs::default(), "")
        .await
        .unwrap();
    assert_ne!(c.id(), d.id());
    let (c_tuple, d_tuple) = (c.tuple(), d.tuple());
    c.connect(&d_tuple.local_ip, d_tuple.local_port, None)
        .await
        .unwrap();
    d.connect(&c_tuple.local_ip, c_tuple.local_port, None)
        .await
        .unwrap();
    assert_eq!(c.tuple().remote_port, Some(d_tuple.local_port));
    assert_eq!(d.tuple().remote_port, Some(c_tuple.local_port));

    cluster.close();
    servers.close().await;
}

#[tokio::test]
async fn test_events_update_the_mirror() {
    let servers = TestCluster::spawn(1).await;
    let (cluster, workers) = connect(&servers, 1).await;
    let router = workers[0]
        .create_router(fixtures::router_args(), "")
        .await
        .unwrap();
    let send = router
        .create_webrtc_transport(WebRtcTransportCreateArgs::default(), "")
        .await
        .unwrap();
    let recv = router
        .create_webrtc_transport(WebRtcTransportCreateArgs::default(), "")
        .await
        .unwrap();
    let producer = send
        .produce(fixtures::audio_produce_args(), "")
        .await
        .unwrap();
    let consumer = recv
        .consume(producer.id(), fixtures::consume_args(), "")
        .await
        .unwrap();
    assert!(!consumer.paused());

    // Pausing the producer pauses the consumer on the worker; the client
    // only learns that from the event stream.
    producer.pause().await.unwrap();
    assert!(producer.paused());
    assert_eventually(TIMEOUT, || consumer.paused(), "consumer paused by event").await;

    // Engine-side changes arrive the same way.
    servers.engines()[0].simulate_ice_disconnect(send.id());
    assert_eventually(
        TIMEOUT,
        || send.ice_state() == IceState::Disconnected,
        "ice state from event",
    )
    .await;

    // A close made directly on the worker reaches the mirror too.
    workers[0].api().close_router(router.id()).await.unwrap();
    assert_eventually(TIMEOUT, || recv.closed(), "transport closed by event").await;
    assert!(consumer.closed());

    cluster.close();
    servers.close().await;
}

#[tokio::test]
async fn test_kill_closes_locally_and_worker_is_replaced() {
    let servers = TestCluster::spawn(1).await;
    let (cluster, workers) = connect(&servers, 1).await;
    let worker = workers[0].clone();
    let mut status = cluster.subscribe_status();

    let router = worker.create_router(fixtures::router_args(), "").await.unwrap();
    let transport = router
        .create_plain_transport(PlainTransportCreateArgs::default(), "")
        .await
        .unwrap();

    worker.kill();
    assert_eq!(worker.status(), WorkerStatus::Dead);
    assert!(router.closed());
    assert!(transport.closed());
    let notified = tokio::time::timeout(TIMEOUT, status.recv()).await.unwrap().unwrap();
    assert_eq!(notified, worker);

    assert!(matches!(
        worker.create_router(fixtures::router_args(), "").await,
        Err(ClientError::WorkerDead(_))
    ));
    assert!(matches!(
        router
            .create_plain_transport(PlainTransportCreateArgs::default(), "")
            .await,
        Err(ClientError::WorkerDead(_))
    ));

    // The pool replaces the killed worker and the client picks it up.
    assert_eventually(
        TIMEOUT,
        || {
            cluster
                .workers()
                .iter()
                .any(|w| w.id() != worker.id() && w.status() == WorkerStatus::Healthy)
        },
        "replacement worker discovered",
    )
    .await;
    assert_eventually(
        TIMEOUT,
        || servers.workers().iter().all(|w| w.id() != worker.id()),
        "killed worker gone from the pool",
    )
    .await;

    cluster.close();
    servers.close().await;
}

#[tokio::test]
async fn test_dead_report_cascades() {
    let servers = TestCluster::spawn(1).await;
    let (cluster, workers) = connect(&servers, 1).await;
    let worker = &workers[0];
    let router = worker.create_router(fixtures::router_args(), "").await.unwrap();
    let transport = router
        .create_webrtc_transport(WebRtcTransportCreateArgs::default(), "")
        .await
        .unwrap();
    let producer = transport
        .produce(fixtures::audio_produce_args(), "")
        .await
        .unwrap();

    servers.engines()[0].simulate_death("test");

    assert_eventually(
        TIMEOUT,
        || worker.status() == WorkerStatus::Dead,
        "worker dead after its dead report",
    )
    .await;
    assert!(router.closed());
    assert!(transport.closed());
    assert!(producer.closed() && producer.paused());

    cluster.close();
    servers.close().await;
}

#[tokio::test]
async fn test_cluster_close_stops_tracking() {
    let servers = TestCluster::spawn(1).await;
    let (cluster, _) = connect(&servers, 1).await;

    cluster.close();
    assert!(cluster.is_closed());

    // New workers are no longer noticed.
    let before = cluster.workers().len();
    servers.engines()[0].simulate_death("test");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.workers().len(), before);

    servers.close().await;
}

#[tokio::test]
async fn test_mirror_converges_over_lossy_event_stream() {
    let lossy = Arc::new(
        LossyBus::new(Arc::new(MemoryBus::new()))
            .topics_containing(".events")
            .drop_rate(0.2)
            .duplicate_rate(0.2)
            .reorder_rate(0.2)
            .seed(7),
    );
    let bus: Arc<dyn Bus> = lossy.clone();
    let servers = TestCluster::spawn_on(Arc::clone(&bus), 1).await;
    let cluster = Cluster::connect(bus, config()).await.unwrap();
    let workers = cluster.wait_for_workers(1, TIMEOUT).await.unwrap();
    let worker = &workers[0];

    let router = worker.create_router(fixtures::router_args(), "").await.unwrap();
    let mut transports = Vec::new();
    for _ in 0..10 {
        transports.push(
            router
                .create_plain_transport(PlainTransportCreateArgs::default(), "")
                .await
                .unwrap(),
        );
    }

    let mut ids: Vec<&str> = transports.iter().map(|t| t.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10);
    assert_eq!(router.transports().len(), 10);

    // Close every other transport behind the client's back.
    for transport in transports.iter().step_by(2) {
        worker.api().close_plain_transport(transport.id()).await.unwrap();
    }

    // A lost event is only noticed once a later one arrives, so keep the
    // stream moving until every close has been observed.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !transports.iter().step_by(2).all(|t| t.closed()) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "mirror never converged"
        );
        worker
            .create_router(fixtures::router_args(), "")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(transports.iter().skip(1).step_by(2).all(|t| !t.closed()));

    let (dropped, duplicated, reordered) = lossy.fault_counts();
    assert!(dropped + duplicated + reordered > 0);

    cluster.close();
    servers.close().await;
}
