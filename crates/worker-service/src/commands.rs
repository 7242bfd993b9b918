//! Idempotent command layer.
//!
//! Decodes inbound [`CommandBox`] payloads, dispatches them to the
//! [`WorkerExecutor`] and produces exactly one [`CommandReply`] per payload.
//!
//! Creates are serialised on the keyed lock `"<command-type>:<repeatKey>"`.
//! Inside the lock the executor's repeat-key registry is consulted first, so
//! a resend of the same logical create (even a concurrent one) returns the
//! resource created by the first instead of a duplicate. Every other command
//! is idempotent on its own: the handlers re-read current state and return
//! it rather than asserting that a transition happened.

use crate::errors::CommandError;
use crate::executor::WorkerExecutor;
use crate::observability::metrics;
use common::lock::AsyncLockMap;
use common::wire::commands::{EmptyResponse, GetStateResponse};
use common::wire::{Command, CommandBox, CommandReply};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Metric label for payloads that never decoded into a command.
const UNDECODED_COMMAND: &str = "undecoded";

/// Outcome of handling one inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    pub reply: CommandReply,
    /// The command was a successful `worker-kill`: the worker must close
    /// once the reply is out.
    pub kill: bool,
}

/// Decodes and dispatches commands for one worker.
#[derive(Debug)]
pub struct CommandLayer {
    executor: Arc<WorkerExecutor>,
    locks: AsyncLockMap,
}

fn to_data<T: Serialize>(value: &T) -> Result<serde_json::Value, CommandError> {
    serde_json::to_value(value).map_err(|e| CommandError::Unknown(e.to_string()))
}

impl CommandLayer {
    #[must_use]
    pub fn new(executor: Arc<WorkerExecutor>) -> Self {
        Self {
            executor,
            locks: AsyncLockMap::new(),
        }
    }

    /// Handle one raw payload. Never fails: every error becomes an error
    /// reply.
    pub async fn handle(&self, payload: &[u8]) -> Handled {
        let start = Instant::now();

        let boxed = match CommandBox::decode(payload) {
            Ok(boxed) => boxed,
            Err(e) => {
                let err = CommandError::from(e);
                warn!(
                    target: "worker.commands",
                    worker_id = %self.executor.worker_id(),
                    error = %err,
                    "Rejected inbound command"
                );
                metrics::record_command(UNDECODED_COMMAND, err.status_label(), start.elapsed());
                return Handled {
                    reply: CommandReply::Error {
                        message: err.wire_message(),
                    },
                    kill: false,
                };
            }
        };

        let tag = boxed.command.tag();
        let is_kill = matches!(boxed.command, Command::WorkerKill);
        let result = self.execute(boxed).await;

        match result {
            Ok(data) => {
                metrics::record_command(tag, "success", start.elapsed());
                debug!(
                    target: "worker.commands",
                    worker_id = %self.executor.worker_id(),
                    command = tag,
                    "Command succeeded"
                );
                Handled {
                    reply: CommandReply::Success { data },
                    kill: is_kill,
                }
            }
            Err(err) => {
                metrics::record_command(tag, err.status_label(), start.elapsed());
                warn!(
                    target: "worker.commands",
                    worker_id = %self.executor.worker_id(),
                    command = tag,
                    error = %err,
                    "Command failed"
                );
                Handled {
                    reply: CommandReply::Error {
                        message: err.wire_message(),
                    },
                    kill: false,
                }
            }
        }
    }

    /// Run a decoded command, taking the keyed lock for creates.
    ///
    /// # Errors
    ///
    /// Any [`CommandError`] raised by the executor.
    pub async fn execute(&self, boxed: CommandBox) -> Result<serde_json::Value, CommandError> {
        if !boxed.command.is_create() {
            return self.dispatch("", boxed.command).await;
        }

        let tag = boxed.command.tag();
        let key = format!("{tag}:{}", boxed.repeat_key);
        let _guard = self.locks.lock(&key).await;
        if self.executor.is_replay(&key) {
            metrics::record_replay(tag);
            debug!(
                target: "worker.commands",
                worker_id = %self.executor.worker_id(),
                key = %key,
                "Create replayed from repeat key"
            );
        }
        self.dispatch(&key, boxed.command).await
    }

    async fn dispatch(&self, key: &str, command: Command) -> Result<serde_json::Value, CommandError> {
        let executor = &self.executor;
        match command {
            Command::WorkerKill => to_data(&EmptyResponse {}),
            Command::WorkerState => to_data(&GetStateResponse {
                seq: executor.current_seq(),
            }),
            Command::WorkerEvents { seq, batch_size } => {
                to_data(&executor.events_since(seq, batch_size))
            }

            Command::RouterCreate { args } => to_data(&executor.create_router(key, args).await?),
            Command::RouterClose { args } => to_data(&executor.close_router(&args.id).await?),

            Command::WebRtcTransportCreate { router_id, args } => to_data(
                &executor
                    .create_webrtc_transport(key, &router_id, args)
                    .await?,
            ),
            Command::WebRtcTransportConnect { args } => {
                to_data(&executor.connect_webrtc_transport(args).await?)
            }
            Command::WebRtcTransportRestart { args } => {
                to_data(&executor.restart_ice(&args.id).await?)
            }
            Command::WebRtcTransportClose { args } => {
                to_data(&executor.close_webrtc_transport(&args.id).await?)
            }

            Command::PlainTransportCreate { router_id, args } => to_data(
                &executor
                    .create_plain_transport(key, &router_id, args)
                    .await?,
            ),
            Command::PlainTransportConnect { args } => {
                to_data(&executor.connect_plain_transport(args).await?)
            }
            Command::PlainTransportClose { args } => {
                to_data(&executor.close_plain_transport(&args.id).await?)
            }

            Command::PipeTransportCreate { router_id, args } => to_data(
                &executor
                    .create_pipe_transport(key, &router_id, args)
                    .await?,
            ),
            Command::PipeTransportConnect { args } => {
                to_data(&executor.connect_pipe_transport(args).await?)
            }
            Command::PipeTransportClose { args } => {
                to_data(&executor.close_pipe_transport(&args.id).await?)
            }

            Command::ProduceCreate { transport_id, args } => {
                to_data(&executor.produce(key, &transport_id, args).await?)
            }
            Command::ProducePause { args } => to_data(&executor.pause_producer(&args.id).await?),
            Command::ProduceResume { args } => to_data(&executor.resume_producer(&args.id).await?),
            Command::ProduceClose { args } => to_data(&executor.close_producer(&args.id).await?),

            Command::ConsumeCreate {
                transport_id,
                producer_id,
                args,
            } => to_data(
                &executor
                    .consume(key, &transport_id, &producer_id, args)
                    .await?,
            ),
            Command::ConsumePause { args } => to_data(&executor.pause_consumer(&args.id).await?),
            Command::ConsumeResume { args } => to_data(&executor.resume_consumer(&args.id).await?),
            Command::ConsumeClose { args } => to_data(&executor.close_consumer(&args.id).await?),

            Command::GetStats { args } => to_data(&executor.get_stats(&args.id).await?),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::engine::{LoopbackConfig, LoopbackEngine};
    use serde_json::json;

    fn layer() -> CommandLayer {
        let engine = Arc::new(LoopbackEngine::new(LoopbackConfig::default()));
        let (executor, _events) = WorkerExecutor::new("w1", engine);
        CommandLayer::new(Arc::new(executor))
    }

    fn payload(command: serde_json::Value, repeat_key: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "command": command,
            "repeatKey": repeat_key,
            "time": 1,
        }))
        .unwrap()
    }

    fn router_create() -> serde_json::Value {
        json!({
            "type": "router-create",
            "args": {
                "mediaCodecs": [
                    {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2}
                ]
            }
        })
    }

    fn success(handled: Handled) -> serde_json::Value {
        match handled.reply {
            CommandReply::Success { data } => data,
            CommandReply::Error { message } => panic!("unexpected error reply: {message}"),
        }
    }

    fn error(handled: Handled) -> String {
        match handled.reply {
            CommandReply::Error { message } => message,
            CommandReply::Success { data } => panic!("unexpected success reply: {data}"),
        }
    }

    #[tokio::test]
    async fn test_worker_events_on_empty_log() {
        let layer = layer();
        let data = success(
            layer
                .handle(&payload(
                    json!({"type": "worker-events", "seq": 0, "batchSize": 500}),
                    "k",
                ))
                .await,
        );
        assert_eq!(data, json!({"hasMore": false, "seq": 0, "events": []}));
    }

    #[tokio::test]
    async fn test_router_create_replayed_by_repeat_key() {
        let layer = layer();

        let first = success(layer.handle(&payload(router_create(), "r1")).await);
        let second = success(layer.handle(&payload(router_create(), "r1")).await);
        let other = success(layer.handle(&payload(router_create(), "r2")).await);

        assert_eq!(first["id"], second["id"]);
        assert_eq!(second["closed"], false);
        assert_ne!(first["id"], other["id"]);

        let state = success(layer.handle(&payload(json!({"type": "worker-state"}), "s")).await);
        assert_eq!(state["seq"], 2, "one event per distinct router");
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_creates_yield_one_router() {
        let layer = Arc::new(layer());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let layer = Arc::clone(&layer);
            handles.push(tokio::spawn(async move {
                success(layer.handle(&payload(router_create(), "same")).await)["id"].clone()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let state = success(layer.handle(&payload(json!({"type": "worker-state"}), "s")).await);
        assert_eq!(state["seq"], 1);
    }

    #[tokio::test]
    async fn test_close_returns_closed_state_twice() {
        let layer = layer();
        let router = success(layer.handle(&payload(router_create(), "r1")).await);
        let close = json!({"type": "router-close", "args": {"id": router["id"]}});

        let first = success(layer.handle(&payload(close.clone(), "c1")).await);
        let second = success(layer.handle(&payload(close, "c2")).await);
        assert_eq!(first["closed"], true);
        assert_eq!(second["closed"], true);
    }

    #[tokio::test]
    async fn test_error_replies() {
        let layer = layer();

        let message = error(
            layer
                .handle(&payload(
                    json!({"type": "router-close", "args": {"id": "missing"}}),
                    "k",
                ))
                .await,
        );
        assert_eq!(message, "Unable to find router");

        let message = error(layer.handle(&payload(json!({"type": "router-explode"}), "k")).await);
        assert_eq!(message, "Unknown command: router-explode");

        let message = error(layer.handle(b"{not json").await);
        assert!(message.starts_with("Malformed command: "), "{message}");
    }

    #[tokio::test]
    async fn test_engine_failure_forwards_message() {
        let layer = layer();
        let router = success(layer.handle(&payload(router_create(), "r1")).await);
        let transport = success(
            layer
                .handle(&payload(
                    json!({"type": "transport-pipe-create", "routerId": router["id"], "args": {}}),
                    "t1",
                ))
                .await,
        );

        // No codecs: the engine refuses
        let message = error(
            layer
                .handle(&payload(
                    json!({
                        "type": "produce-create",
                        "transportId": transport["id"],
                        "args": {"kind": "audio", "rtpParameters": {"codecs": []}}
                    }),
                    "p1",
                ))
                .await,
        );
        assert_eq!(message, "Invalid rtpParameters: no codecs");
    }

    #[tokio::test]
    async fn test_kill_is_flagged() {
        let layer = layer();
        let handled = layer.handle(&payload(json!({"type": "worker-kill"}), "k")).await;
        assert!(handled.kill);
        assert_eq!(success(handled), json!({}));

        let handled = layer.handle(&payload(json!({"type": "worker-state"}), "k")).await;
        assert!(!handled.kill);
    }
}
