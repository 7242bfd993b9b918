//! Worker tests over the bus.
//!
//! Drives a real worker pool through request/reply on the commands topic and
//! observes the events and report topics, the way a cluster client does.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::bus::{commands_topic, events_topic, report_topic, Subscription};
use common::types::new_id;
use common::wire::commands::{GetEventsResponse, GetStateResponse, IdArgs};
use common::wire::{
    Command, CommandBox, CommandReply, Event, EventBox, Report, ReportState, RouterState,
};
use worker_test_utils::fixtures;
use worker_test_utils::{assert_eventually, TestCluster};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn send_raw(cluster: &TestCluster, worker_id: &str, payload: Vec<u8>) -> CommandReply {
    let reply = cluster
        .bus()
        .request(
            &commands_topic(cluster.root_topic(), worker_id),
            Bytes::from(payload),
            TIMEOUT,
        )
        .await
        .expect("Worker did not reply");
    serde_json::from_slice(&reply).expect("Reply is not a CommandReply")
}

async fn send_keyed(
    cluster: &TestCluster,
    worker_id: &str,
    repeat_key: &str,
    command: Command,
) -> CommandReply {
    let command_box = CommandBox {
        command,
        repeat_key: repeat_key.to_string(),
        time: 1,
    };
    send_raw(cluster, worker_id, serde_json::to_vec(&command_box).unwrap()).await
}

async fn send(cluster: &TestCluster, worker_id: &str, command: Command) -> serde_json::Value {
    match send_keyed(cluster, worker_id, &new_id(), command).await {
        CommandReply::Success { data } => data,
        CommandReply::Error { message } => panic!("Command failed: {message}"),
    }
}

async fn next_event(subscription: &mut Subscription) -> EventBox {
    let message = tokio::time::timeout(TIMEOUT, subscription.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Event subscription closed");
    serde_json::from_slice(&message.payload).unwrap()
}

async fn first_worker(cluster: &TestCluster) -> String {
    cluster.workers().first().unwrap().id().to_string()
}

#[tokio::test]
async fn test_fresh_worker_reports_seq_zero_and_no_events() {
    let cluster = TestCluster::spawn(1).await;
    let worker_id = first_worker(&cluster).await;

    let state: GetStateResponse =
        serde_json::from_value(send(&cluster, &worker_id, Command::WorkerState).await).unwrap();
    assert_eq!(state.seq, 0);

    let events: GetEventsResponse = serde_json::from_value(
        send(
            &cluster,
            &worker_id,
            Command::WorkerEvents {
                seq: 0,
                batch_size: 500,
            },
        )
        .await,
    )
    .unwrap();
    assert!(!events.has_more);
    assert_eq!(events.seq, 0);
    assert!(events.events.is_empty());

    cluster.close().await;
}

#[tokio::test]
async fn test_repeated_create_returns_same_router() {
    let cluster = TestCluster::spawn(1).await;
    let worker_id = first_worker(&cluster).await;

    let create = || Command::RouterCreate {
        args: fixtures::router_args(),
    };
    let first = send_keyed(&cluster, &worker_id, "key-1", create()).await;
    let second = send_keyed(&cluster, &worker_id, "key-1", create()).await;
    assert_eq!(first, second);

    let state: GetStateResponse =
        serde_json::from_value(send(&cluster, &worker_id, Command::WorkerState).await).unwrap();
    assert_eq!(state.seq, 1);

    let CommandReply::Success { data } = first else {
        panic!("create failed");
    };
    let router: RouterState = serde_json::from_value(data).unwrap();
    assert!(!router.closed);

    cluster.close().await;
}

#[tokio::test]
async fn test_concurrent_duplicate_creates_execute_once() {
    let cluster = Arc::new(TestCluster::spawn(1).await);
    let worker_id = first_worker(&cluster).await;

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let cluster = Arc::clone(&cluster);
        let worker_id = worker_id.clone();
        tasks.push(tokio::spawn(async move {
            send_keyed(
                &cluster,
                &worker_id,
                "same-key",
                Command::RouterCreate {
                    args: fixtures::router_args(),
                },
            )
            .await
        }));
    }

    let mut replies = Vec::new();
    for task in tasks {
        replies.push(task.await.unwrap());
    }
    assert!(replies.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(cluster.workers()[0].current_seq(), 1);

    cluster.close().await;
}

#[tokio::test]
async fn test_router_close_cascades_events_in_order() {
    let cluster = TestCluster::spawn(1).await;
    let worker_id = first_worker(&cluster).await;
    let bus = cluster.bus();
    let mut events = bus
        .subscribe(&events_topic(cluster.root_topic(), &worker_id))
        .await
        .unwrap();

    let router: RouterState = serde_json::from_value(
        send(
            &cluster,
            &worker_id,
            Command::RouterCreate {
                args: fixtures::router_args(),
            },
        )
        .await,
    )
    .unwrap();
    let transport = send(
        &cluster,
        &worker_id,
        Command::WebRtcTransportCreate {
            router_id: router.id.clone(),
            args: Default::default(),
        },
    )
    .await;
    let transport_id = transport["id"].as_str().unwrap().to_string();
    let producer = send(
        &cluster,
        &worker_id,
        Command::ProduceCreate {
            transport_id: transport_id.clone(),
            args: fixtures::audio_produce_args(),
        },
    )
    .await;
    let producer_id = producer["id"].as_str().unwrap().to_string();
    send(
        &cluster,
        &worker_id,
        Command::ConsumeCreate {
            transport_id: transport_id.clone(),
            producer_id,
            args: fixtures::consume_args(),
        },
    )
    .await;

    for expected in 1..=4 {
        assert_eq!(next_event(&mut events).await.seq, expected);
    }

    send(
        &cluster,
        &worker_id,
        Command::RouterClose {
            args: IdArgs::new(&router.id),
        },
    )
    .await;

    let mut closing = Vec::new();
    for expected in 5..=8 {
        let event = next_event(&mut events).await;
        assert_eq!(event.seq, expected);
        closing.push(event.event.kind());
    }
    assert_eq!(
        closing,
        vec![
            "state-consumer",
            "state-producer",
            "state-webrtc-transport",
            "state-router",
        ]
    );

    // A second close is a no-op that still succeeds
    send(
        &cluster,
        &worker_id,
        Command::RouterClose {
            args: IdArgs::new(&router.id),
        },
    )
    .await;
    assert_eq!(cluster.workers()[0].current_seq(), 8);

    cluster.close().await;
}

#[tokio::test]
async fn test_replay_returns_logged_events() {
    let cluster = TestCluster::spawn(1).await;
    let worker_id = first_worker(&cluster).await;

    for _ in 0..3 {
        send(
            &cluster,
            &worker_id,
            Command::RouterCreate {
                args: fixtures::router_args(),
            },
        )
        .await;
    }

    let batch: GetEventsResponse = serde_json::from_value(
        send(
            &cluster,
            &worker_id,
            Command::WorkerEvents {
                seq: 1,
                batch_size: 1,
            },
        )
        .await,
    )
    .unwrap();
    assert!(batch.has_more);
    assert_eq!(batch.seq, 2);
    assert_eq!(batch.events.len(), 1);
    assert!(matches!(batch.events[0], Event::Router { .. }));

    let rest: GetEventsResponse = serde_json::from_value(
        send(
            &cluster,
            &worker_id,
            Command::WorkerEvents {
                seq: 2,
                batch_size: 500,
            },
        )
        .await,
    )
    .unwrap();
    assert!(!rest.has_more);
    assert_eq!(rest.seq, 3);
    assert_eq!(rest.events.len(), 1);

    cluster.close().await;
}

#[tokio::test]
async fn test_unknown_and_malformed_commands_get_error_replies() {
    let cluster = TestCluster::spawn(1).await;
    let worker_id = first_worker(&cluster).await;

    let unknown = serde_json::json!({
        "command": {"type": "router-explode"},
        "repeatKey": "k",
        "time": 1,
    });
    let reply = send_raw(&cluster, &worker_id, serde_json::to_vec(&unknown).unwrap()).await;
    assert_eq!(
        reply,
        CommandReply::Error {
            message: "Unknown command: router-explode".to_string()
        }
    );

    let reply = send_raw(&cluster, &worker_id, b"not json".to_vec()).await;
    let CommandReply::Error { message } = reply else {
        panic!("expected error reply");
    };
    assert!(message.starts_with("Malformed command: "));

    let reply = send_keyed(
        &cluster,
        &worker_id,
        "k2",
        Command::ProducePause {
            args: IdArgs::new("missing"),
        },
    )
    .await;
    assert_eq!(
        reply,
        CommandReply::Error {
            message: "Unable to find producer".to_string()
        }
    );

    cluster.close().await;
}

#[tokio::test]
async fn test_kill_replies_then_publishes_dead_report() {
    let cluster = TestCluster::spawn(1).await;
    let worker_id = first_worker(&cluster).await;
    let bus = cluster.bus();
    let mut reports = bus.subscribe(&report_topic(cluster.root_topic())).await.unwrap();

    let reply = send_keyed(&cluster, &worker_id, "kill", Command::WorkerKill).await;
    assert!(matches!(reply, CommandReply::Success { .. }));

    let dead = tokio::time::timeout(TIMEOUT, async {
        loop {
            let message = reports.recv().await.unwrap();
            let report: Report = serde_json::from_slice(&message.payload).unwrap();
            if report.worker_id == worker_id && report.state == ReportState::Dead {
                return report;
            }
        }
    })
    .await
    .expect("No dead report");
    assert_eq!(dead.worker_id, worker_id);

    // The pool starts a replacement with a fresh id
    assert_eventually(
        TIMEOUT,
        || {
            cluster
                .workers()
                .iter()
                .any(|w| w.id() != worker_id && w.is_alive())
        },
        "replacement worker started",
    )
    .await;

    // The killed worker no longer answers
    let result = bus
        .request(
            &commands_topic(cluster.root_topic(), &worker_id),
            Bytes::from(
                serde_json::to_vec(&CommandBox {
                    command: Command::WorkerState,
                    repeat_key: "late".to_string(),
                    time: 2,
                })
                .unwrap(),
            ),
            Duration::from_millis(200),
        )
        .await;
    assert!(result.is_err());

    cluster.close().await;
}

#[tokio::test]
async fn test_workers_heartbeat_alive_reports() {
    let cluster = TestCluster::spawn(2).await;
    let bus = cluster.bus();
    let mut reports = bus.subscribe(&report_topic(cluster.root_topic())).await.unwrap();
    let ids: Vec<String> = cluster.workers().iter().map(|w| w.id().to_string()).collect();

    let mut seen = std::collections::HashSet::new();
    tokio::time::timeout(TIMEOUT, async {
        while seen.len() < ids.len() {
            let message = reports.recv().await.unwrap();
            let report: Report = serde_json::from_slice(&message.payload).unwrap();
            if report.state == ReportState::Alive && ids.contains(&report.worker_id) {
                seen.insert(report.worker_id);
            }
        }
    })
    .await
    .expect("Not every worker reported alive");

    cluster.close().await;
}
