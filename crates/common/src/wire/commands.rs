//! Commands sent from clients to workers and the replies they produce.
//!
//! Commands travel on `<root>.<workerId>.commands` as request/reply. Each is
//! wrapped in a [`CommandBox`] carrying the client's idempotency key.

use super::events::Event;
use super::media::{
    ConsumerLayers, DtlsParameters, MediaKind, NumSctpStreams, RtpCapabilities,
    RtpCodecCapability, RtpParameters, SrtpCryptoSuite, SrtpParameters,
};
use crate::types::SimpleMap;
use serde::{Deserialize, Serialize};

/// Arguments naming a single existing resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdArgs {
    pub id: String,
}

impl IdArgs {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCreateArgs {
    pub media_codecs: Vec<RtpCodecCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<SimpleMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportCreateArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_udp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_tcp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_udp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_tcp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_available_outgoing_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_sctp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_sctp_streams: Option<NumSctpStreams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sctp_message_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<SimpleMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportConnectArgs {
    pub id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportCreateArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp_mux: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comedia: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_sctp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_sctp_streams: Option<NumSctpStreams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sctp_message_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_srtp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srtp_crypto_suite: Option<SrtpCryptoSuite>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<SimpleMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportConnectArgs {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srtp_parameters: Option<SrtpParameters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeTransportCreateArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_sctp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_sctp_streams: Option<NumSctpStreams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sctp_message_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_rtx: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_srtp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<SimpleMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeTransportConnectArgs {
    pub id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srtp_parameters: Option<SrtpParameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceArgs {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_frame_request_delay: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<SimpleMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtp_capabilities: Option<RtpCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_layers: Option<ConsumerLayers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<SimpleMap>,
}

/// Every command a worker understands, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "worker-kill")]
    WorkerKill,
    #[serde(rename = "worker-state")]
    WorkerState,
    #[serde(rename = "worker-events", rename_all = "camelCase")]
    WorkerEvents { seq: u64, batch_size: u64 },

    #[serde(rename = "router-create")]
    RouterCreate { args: RouterCreateArgs },
    #[serde(rename = "router-close")]
    RouterClose { args: IdArgs },

    #[serde(rename = "transport-webrtc-create", rename_all = "camelCase")]
    WebRtcTransportCreate {
        router_id: String,
        args: WebRtcTransportCreateArgs,
    },
    #[serde(rename = "transport-webrtc-connect")]
    WebRtcTransportConnect { args: WebRtcTransportConnectArgs },
    #[serde(rename = "transport-webrtc-restart")]
    WebRtcTransportRestart { args: IdArgs },
    #[serde(rename = "transport-webrtc-close")]
    WebRtcTransportClose { args: IdArgs },

    #[serde(rename = "transport-plain-create", rename_all = "camelCase")]
    PlainTransportCreate {
        router_id: String,
        args: PlainTransportCreateArgs,
    },
    #[serde(rename = "transport-plain-connect")]
    PlainTransportConnect { args: PlainTransportConnectArgs },
    #[serde(rename = "transport-plain-close")]
    PlainTransportClose { args: IdArgs },

    #[serde(rename = "transport-pipe-create", rename_all = "camelCase")]
    PipeTransportCreate {
        router_id: String,
        args: PipeTransportCreateArgs,
    },
    #[serde(rename = "transport-pipe-connect")]
    PipeTransportConnect { args: PipeTransportConnectArgs },
    #[serde(rename = "transport-pipe-close")]
    PipeTransportClose { args: IdArgs },

    #[serde(rename = "produce-create", rename_all = "camelCase")]
    ProduceCreate {
        transport_id: String,
        args: ProduceArgs,
    },
    #[serde(rename = "produce-pause")]
    ProducePause { args: IdArgs },
    #[serde(rename = "produce-resume")]
    ProduceResume { args: IdArgs },
    #[serde(rename = "produce-close")]
    ProduceClose { args: IdArgs },

    #[serde(rename = "consume-create", rename_all = "camelCase")]
    ConsumeCreate {
        transport_id: String,
        producer_id: String,
        args: ConsumeArgs,
    },
    #[serde(rename = "consume-pause")]
    ConsumePause { args: IdArgs },
    #[serde(rename = "consume-resume")]
    ConsumeResume { args: IdArgs },
    #[serde(rename = "consume-close")]
    ConsumeClose { args: IdArgs },

    #[serde(rename = "get-stats")]
    GetStats { args: IdArgs },
}

impl Command {
    /// Every wire tag, in declaration order.
    pub const TAGS: &'static [&'static str] = &[
        "worker-kill",
        "worker-state",
        "worker-events",
        "router-create",
        "router-close",
        "transport-webrtc-create",
        "transport-webrtc-connect",
        "transport-webrtc-restart",
        "transport-webrtc-close",
        "transport-plain-create",
        "transport-plain-connect",
        "transport-plain-close",
        "transport-pipe-create",
        "transport-pipe-connect",
        "transport-pipe-close",
        "produce-create",
        "produce-pause",
        "produce-resume",
        "produce-close",
        "consume-create",
        "consume-pause",
        "consume-resume",
        "consume-close",
        "get-stats",
    ];

    /// The wire tag of this command.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::WorkerKill => "worker-kill",
            Self::WorkerState => "worker-state",
            Self::WorkerEvents { .. } => "worker-events",
            Self::RouterCreate { .. } => "router-create",
            Self::RouterClose { .. } => "router-close",
            Self::WebRtcTransportCreate { .. } => "transport-webrtc-create",
            Self::WebRtcTransportConnect { .. } => "transport-webrtc-connect",
            Self::WebRtcTransportRestart { .. } => "transport-webrtc-restart",
            Self::WebRtcTransportClose { .. } => "transport-webrtc-close",
            Self::PlainTransportCreate { .. } => "transport-plain-create",
            Self::PlainTransportConnect { .. } => "transport-plain-connect",
            Self::PlainTransportClose { .. } => "transport-plain-close",
            Self::PipeTransportCreate { .. } => "transport-pipe-create",
            Self::PipeTransportConnect { .. } => "transport-pipe-connect",
            Self::PipeTransportClose { .. } => "transport-pipe-close",
            Self::ProduceCreate { .. } => "produce-create",
            Self::ProducePause { .. } => "produce-pause",
            Self::ProduceResume { .. } => "produce-resume",
            Self::ProduceClose { .. } => "produce-close",
            Self::ConsumeCreate { .. } => "consume-create",
            Self::ConsumePause { .. } => "consume-pause",
            Self::ConsumeResume { .. } => "consume-resume",
            Self::ConsumeClose { .. } => "consume-close",
            Self::GetStats { .. } => "get-stats",
        }
    }

    /// Whether this command creates a resource and is therefore deduplicated
    /// by its repeat key.
    #[must_use]
    pub fn is_create(&self) -> bool {
        matches!(
            self,
            Self::RouterCreate { .. }
                | Self::WebRtcTransportCreate { .. }
                | Self::PlainTransportCreate { .. }
                | Self::PipeTransportCreate { .. }
                | Self::ProduceCreate { .. }
                | Self::ConsumeCreate { .. }
        )
    }
}

/// A command plus its idempotency key and client timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandBox {
    pub command: Command,
    pub repeat_key: String,
    pub time: u64,
}

/// Why an inbound payload could not be decoded into a [`CommandBox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Well-formed box naming a command type this worker does not know.
    UnknownCommand(String),
    /// Anything else that fails schema validation.
    Malformed(String),
}

impl CommandBox {
    /// Decode a command box, distinguishing unknown command types from
    /// otherwise malformed payloads.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the payload is not a valid command box.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let tag = value
            .get("command")
            .and_then(|c| c.get("type"))
            .and_then(serde_json::Value::as_str);
        if let Some(tag) = tag {
            if !Command::TAGS.contains(&tag) {
                return Err(DecodeError::UnknownCommand(tag.to_string()));
            }
        }

        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

/// Reply envelope for every command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "lowercase")]
pub enum CommandReply {
    Success { data: serde_json::Value },
    Error { message: String },
}

/// `worker-state` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStateResponse {
    pub seq: u64,
}

/// `worker-events` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEventsResponse {
    pub has_more: bool,
    pub seq: u64,
    pub events: Vec<Event>,
}

/// `get-stats` response: opaque serialized engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub data: Option<String>,
}

/// Empty object response (`worker-kill`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyResponse {}
