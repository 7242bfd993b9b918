//! Authoritative resource state snapshots.
//!
//! Every state carries `{id, closed, appData, time}` plus kind-specific
//! fields. `time` is an opaque, per-worker monotonic version counter: the
//! client mirror compares it only against the previous `time` for the same
//! resource.

use super::media::{
    DtlsParameters, DtlsState, IceCandidate, IceParameters, IceState, MediaKind, RtpParameters,
    SctpParameters, SctpState, SrtpParameters, TransportTuple,
};
use crate::types::SimpleMap;
use serde::{Deserialize, Serialize};

/// Common accessors over every resource state snapshot.
pub trait ResourceState: Clone + PartialEq {
    fn id(&self) -> &str;
    fn closed(&self) -> bool;
    fn time(&self) -> u64;
    fn set_time(&mut self, time: u64);

    /// Whether two snapshots differ in anything other than `time`.
    fn differs_from(&self, other: &Self) -> bool {
        let mut normalized = other.clone();
        normalized.set_time(self.time());
        *self != normalized
    }
}

macro_rules! impl_resource_state {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl ResourceState for $ty {
                fn id(&self) -> &str {
                    &self.id
                }

                fn closed(&self) -> bool {
                    self.closed
                }

                fn time(&self) -> u64 {
                    self.time
                }

                fn set_time(&mut self, time: u64) {
                    self.time = time;
                }
            }
        )+
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterState {
    pub id: String,
    pub closed: bool,
    pub app_data: SimpleMap,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportState {
    pub id: String,
    pub closed: bool,
    pub app_data: SimpleMap,
    pub dtls_parameters: DtlsParameters,
    pub dtls_state: DtlsState,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub ice_state: IceState,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportState {
    pub id: String,
    pub closed: bool,
    pub app_data: SimpleMap,
    pub tuple: TransportTuple,
    pub rtcp_tuple: Option<TransportTuple>,
    pub sctp_parameters: Option<SctpParameters>,
    pub sctp_state: Option<SctpState>,
    pub srtp_parameters: Option<SrtpParameters>,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeTransportState {
    pub id: String,
    pub closed: bool,
    pub app_data: SimpleMap,
    pub tuple: TransportTuple,
    pub sctp_parameters: Option<SctpParameters>,
    pub sctp_state: Option<SctpState>,
    pub srtp_parameters: Option<SrtpParameters>,
    pub time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    Simple,
    Simulcast,
    Svc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
    Pipe,
}

/// Producer snapshot. A closed producer always reports `paused = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerState {
    pub id: String,
    pub closed: bool,
    pub app_data: SimpleMap,
    pub paused: bool,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub producer_type: ProducerType,
    pub kind: MediaKind,
    pub time: u64,
}

/// Consumer snapshot. A closed consumer always reports `paused = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerState {
    pub id: String,
    pub closed: bool,
    pub app_data: SimpleMap,
    pub paused: bool,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub kind: MediaKind,
    pub time: u64,
}

impl_resource_state!(
    RouterState,
    WebRtcTransportState,
    PlainTransportState,
    PipeTransportState,
    ProducerState,
    ConsumerState,
);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn router(time: u64, closed: bool) -> RouterState {
        RouterState {
            id: "r1".to_string(),
            closed,
            app_data: SimpleMap::new(),
            time,
        }
    }

    #[test]
    fn test_differs_from_ignores_time() {
        assert!(!router(1, false).differs_from(&router(99, false)));
        assert!(router(1, false).differs_from(&router(1, true)));
    }

    #[test]
    fn test_plain_transport_null_fields_round_trip_as_null() {
        let json = r#"{
            "id": "t1",
            "closed": false,
            "appData": {},
            "tuple": {"localIp": "127.0.0.1", "localPort": 10000, "protocol": "udp"},
            "rtcpTuple": null,
            "sctpParameters": null,
            "sctpState": null,
            "srtpParameters": null,
            "time": 7
        }"#;
        let state: PlainTransportState = serde_json::from_str(json).unwrap();
        assert_eq!(state.rtcp_tuple, None);

        let value = serde_json::to_value(&state).unwrap();
        assert!(value["rtcpTuple"].is_null());
        assert_eq!(value["time"], 7);
    }

    #[test]
    fn test_consumer_type_uses_type_field() {
        let json = r#"{
            "id": "c1",
            "closed": true,
            "appData": {},
            "paused": true,
            "rtpParameters": {"codecs": []},
            "type": "pipe",
            "kind": "video",
            "time": 3
        }"#;
        let state: ConsumerState = serde_json::from_str(json).unwrap();
        assert_eq!(state.consumer_type, ConsumerType::Pipe);
        assert_eq!(state.kind, MediaKind::Video);
    }
}
