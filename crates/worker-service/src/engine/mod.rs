//! Media engine boundary.
//!
//! The worker never touches media itself. Everything that allocates ports,
//! negotiates ICE/DTLS or moves RTP lives behind [`MediaEngine`]; the
//! executor only records what the engine reports and turns it into state
//! snapshots.
//!
//! Engines speak back through [`EngineNotification`]s for changes they
//! originate on their own (ICE connected, producer closed underneath a
//! consumer, engine crash).

mod loopback;

pub use loopback::{LoopbackConfig, LoopbackEngine};

use crate::errors::EngineError;
use async_trait::async_trait;
use common::wire::commands::{
    ConsumeArgs, PipeTransportConnectArgs, PipeTransportCreateArgs, PlainTransportConnectArgs,
    PlainTransportCreateArgs, ProduceArgs, WebRtcTransportCreateArgs,
};
use common::wire::{
    ConsumerType, DtlsParameters, DtlsState, IceCandidate, IceParameters, IceState, MediaKind,
    ProducerType, RtpCodecCapability, RtpParameters, SctpParameters, SctpState, SrtpParameters,
    TransportTuple,
};
use tokio::sync::broadcast;

/// Engine-side view of a WebRTC transport.
#[derive(Debug, Clone, PartialEq)]
pub struct WebRtcTransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub ice_state: IceState,
    pub dtls_parameters: DtlsParameters,
    pub dtls_state: DtlsState,
}

/// Engine-side view of a plain transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PlainTransportInfo {
    pub id: String,
    pub tuple: TransportTuple,
    pub rtcp_tuple: Option<TransportTuple>,
    pub sctp_parameters: Option<SctpParameters>,
    pub sctp_state: Option<SctpState>,
    pub srtp_parameters: Option<SrtpParameters>,
}

/// Engine-side view of a pipe transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeTransportInfo {
    pub id: String,
    pub tuple: TransportTuple,
    pub sctp_parameters: Option<SctpParameters>,
    pub sctp_state: Option<SctpState>,
    pub srtp_parameters: Option<SrtpParameters>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerInfo {
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub producer_type: ProducerType,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub consumer_type: ConsumerType,
    pub paused: bool,
    /// Whether the source producer is paused at creation time.
    pub producer_paused: bool,
}

/// Changes the engine originates on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotification {
    WebRtcTransportState {
        transport_id: String,
        ice_state: IceState,
        dtls_state: DtlsState,
    },
    ProducerClosed {
        producer_id: String,
    },
    ConsumerClosed {
        consumer_id: String,
    },
    ConsumerProducerPaused {
        consumer_id: String,
        producer_paused: bool,
    },
    /// The engine process is gone; the worker must shut down.
    Died {
        reason: String,
    },
}

/// Lifecycle operations a worker drives on its media engine.
///
/// Ids are allocated by the engine. Closing an id the engine no longer
/// knows is not an error: the executor may race an engine-originated close.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    async fn create_router(&self, media_codecs: &[RtpCodecCapability])
        -> Result<String, EngineError>;

    /// Close a router and everything under it.
    async fn close_router(&self, router_id: &str) -> Result<(), EngineError>;

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        args: &WebRtcTransportCreateArgs,
    ) -> Result<WebRtcTransportInfo, EngineError>;

    async fn connect_webrtc_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<WebRtcTransportInfo, EngineError>;

    async fn restart_ice(&self, transport_id: &str) -> Result<IceParameters, EngineError>;

    async fn create_plain_transport(
        &self,
        router_id: &str,
        args: &PlainTransportCreateArgs,
    ) -> Result<PlainTransportInfo, EngineError>;

    async fn connect_plain_transport(
        &self,
        args: &PlainTransportConnectArgs,
    ) -> Result<PlainTransportInfo, EngineError>;

    async fn create_pipe_transport(
        &self,
        router_id: &str,
        args: &PipeTransportCreateArgs,
    ) -> Result<PipeTransportInfo, EngineError>;

    async fn connect_pipe_transport(
        &self,
        args: &PipeTransportConnectArgs,
    ) -> Result<PipeTransportInfo, EngineError>;

    /// Close a transport of any kind and its producers/consumers.
    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: &str,
        args: &ProduceArgs,
    ) -> Result<ProducerInfo, EngineError>;

    async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        args: &ConsumeArgs,
    ) -> Result<ConsumerInfo, EngineError>;

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    /// Statistics for a transport, producer or consumer, `None` if unknown.
    async fn get_stats(&self, id: &str) -> Result<Option<serde_json::Value>, EngineError>;

    /// Subscribe to engine-originated changes.
    fn subscribe(&self) -> broadcast::Receiver<EngineNotification>;

    /// Release everything. Idempotent.
    async fn close(&self);
}
