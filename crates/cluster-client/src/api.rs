//! Typed request/reply calls to one worker.
//!
//! Every call wraps its command in a `CommandBox`, sends it on
//! `<root>.<workerId>.commands` and decodes the reply envelope:
//!
//! - `success` with data of the expected shape: `Ok(data)`
//! - `error`: `ClientError::Remote(message)`
//! - anything else, including an undecodable reply: `ClientError::Unknown`
//!
//! Only creates carry a repeat key; every other command is idempotent on the
//! worker and sends an empty one. A create called with an empty repeat key
//! gets a fresh random one, so it always makes a new resource.

use crate::errors::ClientError;
use bytes::Bytes;
use common::bus::{commands_topic, Bus};
use common::clock;
use common::types::new_id;
use common::wire::commands::{
    ConsumeArgs, EmptyResponse, GetEventsResponse, GetStateResponse, IdArgs,
    PipeTransportConnectArgs, PipeTransportCreateArgs, PlainTransportConnectArgs,
    PlainTransportCreateArgs, ProduceArgs, RouterCreateArgs, StatsResponse,
    WebRtcTransportConnectArgs, WebRtcTransportCreateArgs,
};
use common::wire::{
    Command, CommandBox, CommandReply, ConsumerState, PipeTransportState, PlainTransportState,
    ProducerState, RouterState, WebRtcTransportState,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Command client for a single worker. Cheap to clone.
#[derive(Clone)]
pub struct WorkerApi {
    bus: Arc<dyn Bus>,
    worker_id: String,
    topic: String,
    timeout: Duration,
}

impl std::fmt::Debug for WorkerApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerApi")
            .field("worker_id", &self.worker_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl WorkerApi {
    pub fn new(bus: Arc<dyn Bus>, root_topic: &str, worker_id: &str, timeout: Duration) -> Self {
        Self {
            bus,
            worker_id: worker_id.to_string(),
            topic: commands_topic(root_topic, worker_id),
            timeout,
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn call<T: DeserializeOwned>(
        &self,
        command: Command,
        repeat_key: &str,
    ) -> Result<T, ClientError> {
        let tag = command.tag();
        let repeat_key = if command.is_create() && repeat_key.is_empty() {
            new_id()
        } else {
            repeat_key.to_string()
        };
        let command_box = CommandBox {
            command,
            repeat_key,
            time: clock::now(),
        };
        let payload = serde_json::to_vec(&command_box)
            .map_err(|e| ClientError::Serialization(e.to_string()))?;

        let reply = self
            .bus
            .request(&self.topic, Bytes::from(payload), self.timeout)
            .await
            .map_err(|e| {
                debug!(
                    target: "client.api",
                    worker_id = %self.worker_id,
                    command = tag,
                    error = %e,
                    "Command request failed"
                );
                ClientError::from(e)
            })?;

        match serde_json::from_slice::<CommandReply>(&reply) {
            Ok(CommandReply::Success { data }) => {
                serde_json::from_value(data).map_err(|_| ClientError::Unknown)
            }
            Ok(CommandReply::Error { message }) => Err(ClientError::Remote(message)),
            Err(_) => Err(ClientError::Unknown),
        }
    }

    // Worker

    /// Ask the worker to shut down.
    ///
    /// # Errors
    ///
    /// Fails like any other command; callers normally retry in the background.
    pub async fn kill_worker(&self) -> Result<(), ClientError> {
        self.call::<EmptyResponse>(Command::WorkerKill, "").await?;
        Ok(())
    }

    /// Current seq of the worker's event log.
    ///
    /// # Errors
    ///
    /// Returns the bus or reply error.
    pub async fn get_state(&self) -> Result<GetStateResponse, ClientError> {
        self.call(Command::WorkerState, "").await
    }

    /// Up to `batch_size` events after `seq`.
    ///
    /// # Errors
    ///
    /// Returns the bus or reply error.
    pub async fn get_events(
        &self,
        seq: u64,
        batch_size: u64,
    ) -> Result<GetEventsResponse, ClientError> {
        self.call(Command::WorkerEvents { seq, batch_size }, "").await
    }

    // Router

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn create_router(
        &self,
        args: RouterCreateArgs,
        repeat_key: &str,
    ) -> Result<RouterState, ClientError> {
        self.call(Command::RouterCreate { args }, repeat_key).await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn close_router(&self, id: &str) -> Result<RouterState, ClientError> {
        self.call(Command::RouterClose { args: IdArgs::new(id) }, "")
            .await
    }

    // WebRTC transport

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn create_webrtc_transport(
        &self,
        router_id: &str,
        args: WebRtcTransportCreateArgs,
        repeat_key: &str,
    ) -> Result<WebRtcTransportState, ClientError> {
        self.call(
            Command::WebRtcTransportCreate {
                router_id: router_id.to_string(),
                args,
            },
            repeat_key,
        )
        .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn connect_webrtc_transport(
        &self,
        args: WebRtcTransportConnectArgs,
    ) -> Result<WebRtcTransportState, ClientError> {
        self.call(Command::WebRtcTransportConnect { args }, "").await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn restart_webrtc_transport(
        &self,
        id: &str,
    ) -> Result<WebRtcTransportState, ClientError> {
        self.call(
            Command::WebRtcTransportRestart {
                args: IdArgs::new(id),
            },
            "",
        )
        .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn close_webrtc_transport(
        &self,
        id: &str,
    ) -> Result<WebRtcTransportState, ClientError> {
        self.call(
            Command::WebRtcTransportClose {
                args: IdArgs::new(id),
            },
            "",
        )
        .await
    }

    // Plain transport

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn create_plain_transport(
        &self,
        router_id: &str,
        args: PlainTransportCreateArgs,
        repeat_key: &str,
    ) -> Result<PlainTransportState, ClientError> {
        self.call(
            Command::PlainTransportCreate {
                router_id: router_id.to_string(),
                args,
            },
            repeat_key,
        )
        .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn connect_plain_transport(
        &self,
        args: PlainTransportConnectArgs,
    ) -> Result<PlainTransportState, ClientError> {
        self.call(Command::PlainTransportConnect { args }, "").await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn close_plain_transport(&self, id: &str) -> Result<PlainTransportState, ClientError> {
        self.call(
            Command::PlainTransportClose {
                args: IdArgs::new(id),
            },
            "",
        )
        .await
    }

    // Pipe transport

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn create_pipe_transport(
        &self,
        router_id: &str,
        args: PipeTransportCreateArgs,
        repeat_key: &str,
    ) -> Result<PipeTransportState, ClientError> {
        self.call(
            Command::PipeTransportCreate {
                router_id: router_id.to_string(),
                args,
            },
            repeat_key,
        )
        .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn connect_pipe_transport(
        &self,
        args: PipeTransportConnectArgs,
    ) -> Result<PipeTransportState, ClientError> {
        self.call(Command::PipeTransportConnect { args }, "").await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn close_pipe_transport(&self, id: &str) -> Result<PipeTransportState, ClientError> {
        self.call(
            Command::PipeTransportClose {
                args: IdArgs::new(id),
            },
            "",
        )
        .await
    }

    // Producer

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn create_producer(
        &self,
        transport_id: &str,
        args: ProduceArgs,
        repeat_key: &str,
    ) -> Result<ProducerState, ClientError> {
        self.call(
            Command::ProduceCreate {
                transport_id: transport_id.to_string(),
                args,
            },
            repeat_key,
        )
        .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn pause_producer(&self, id: &str) -> Result<ProducerState, ClientError> {
        self.call(Command::ProducePause { args: IdArgs::new(id) }, "")
            .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn resume_producer(&self, id: &str) -> Result<ProducerState, ClientError> {
        self.call(Command::ProduceResume { args: IdArgs::new(id) }, "")
            .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn close_producer(&self, id: &str) -> Result<ProducerState, ClientError> {
        self.call(Command::ProduceClose { args: IdArgs::new(id) }, "")
            .await
    }

    // Consumer

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn create_consumer(
        &self,
        transport_id: &str,
        producer_id: &str,
        args: ConsumeArgs,
        repeat_key: &str,
    ) -> Result<ConsumerState, ClientError> {
        self.call(
            Command::ConsumeCreate {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                args,
            },
            repeat_key,
        )
        .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn pause_consumer(&self, id: &str) -> Result<ConsumerState, ClientError> {
        self.call(Command::ConsumePause { args: IdArgs::new(id) }, "")
            .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn resume_consumer(&self, id: &str) -> Result<ConsumerState, ClientError> {
        self.call(Command::ConsumeResume { args: IdArgs::new(id) }, "")
            .await
    }

    /// # Errors
    ///
    /// Returns the worker's error reply, or the bus error.
    pub async fn close_consumer(&self, id: &str) -> Result<ConsumerState, ClientError> {
        self.call(Command::ConsumeClose { args: IdArgs::new(id) }, "")
            .await
    }

    // Stats

    /// Engine statistics for any resource id, parsed from the opaque
    /// serialized form. `None` when the engine has nothing to report.
    ///
    /// # Errors
    ///
    /// Returns the worker's error reply, the bus error, or `Unknown` if the
    /// stats payload is not JSON.
    pub async fn get_stats(&self, id: &str) -> Result<Option<serde_json::Value>, ClientError> {
        let response: StatsResponse = self
            .call(Command::GetStats { args: IdArgs::new(id) }, "")
            .await?;
        response
            .data
            .map(|raw| serde_json::from_str(&raw).map_err(|_| ClientError::Unknown))
            .transpose()
    }
}
