//! Events published by workers.
//!
//! State-change events travel on `<root>.<workerId>.events` wrapped in an
//! [`EventBox`]; heartbeats travel on `<root>.report` as a [`Report`].

use super::states::{
    ConsumerState, PipeTransportState, PlainTransportState, ProducerState, RouterState,
    WebRtcTransportState,
};
use crate::types::SimpleMap;
use serde::{Deserialize, Serialize};

/// A resource state change together with its position in the owning tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "state-router", rename_all = "camelCase")]
    Router {
        state: RouterState,
        router_id: String,
        worker_id: String,
        time: u64,
    },

    #[serde(rename = "state-webrtc-transport", rename_all = "camelCase")]
    WebRtcTransport {
        state: WebRtcTransportState,
        transport_id: String,
        router_id: String,
        worker_id: String,
        time: u64,
    },

    #[serde(rename = "state-plain-transport", rename_all = "camelCase")]
    PlainTransport {
        state: PlainTransportState,
        transport_id: String,
        router_id: String,
        worker_id: String,
        time: u64,
    },

    #[serde(rename = "state-pipe-transport", rename_all = "camelCase")]
    PipeTransport {
        state: PipeTransportState,
        transport_id: String,
        router_id: String,
        worker_id: String,
        time: u64,
    },

    #[serde(rename = "state-producer", rename_all = "camelCase")]
    Producer {
        state: ProducerState,
        producer_id: String,
        transport_id: String,
        router_id: String,
        worker_id: String,
        time: u64,
    },

    #[serde(rename = "state-consumer", rename_all = "camelCase")]
    Consumer {
        state: ConsumerState,
        consumer_id: String,
        producer_id: String,
        transport_id: String,
        router_id: String,
        worker_id: String,
        time: u64,
    },
}

impl Event {
    #[must_use]
    pub fn worker_id(&self) -> &str {
        match self {
            Self::Router { worker_id, .. }
            | Self::WebRtcTransport { worker_id, .. }
            | Self::PlainTransport { worker_id, .. }
            | Self::PipeTransport { worker_id, .. }
            | Self::Producer { worker_id, .. }
            | Self::Consumer { worker_id, .. } => worker_id,
        }
    }

    /// Wire tag, used for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Router { .. } => "state-router",
            Self::WebRtcTransport { .. } => "state-webrtc-transport",
            Self::PlainTransport { .. } => "state-plain-transport",
            Self::PipeTransport { .. } => "state-pipe-transport",
            Self::Producer { .. } => "state-producer",
            Self::Consumer { .. } => "state-consumer",
        }
    }
}

/// An event with its 1-based, gapless sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBox {
    pub seq: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportState {
    Alive,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReportType {
    #[default]
    #[serde(rename = "report")]
    Report,
}

/// Worker heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(rename = "type")]
    pub report_type: ReportType,
    pub worker_id: String,
    pub state: ReportState,
    pub app_data: SimpleMap,
    pub time: u64,
}

impl Report {
    #[must_use]
    pub fn new(worker_id: &str, state: ReportState, app_data: SimpleMap, time: u64) -> Self {
        Self {
            report_type: ReportType::Report,
            worker_id: worker_id.to_string(),
            state,
            app_data,
            time,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_box_wire_shape() {
        let event = EventBox {
            seq: 4,
            event: Event::Router {
                state: RouterState {
                    id: "r1".to_string(),
                    closed: true,
                    app_data: SimpleMap::new(),
                    time: 10,
                },
                router_id: "r1".to_string(),
                worker_id: "w1".to_string(),
                time: 10,
            },
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["seq"], 4);
        assert_eq!(json["event"]["type"], "state-router");
        assert_eq!(json["event"]["routerId"], "r1");
        assert_eq!(json["event"]["workerId"], "w1");
        assert_eq!(json["event"]["state"]["closed"], true);
    }

    #[test]
    fn test_report_wire_shape() {
        let report = Report::new("w1", ReportState::Dead, SimpleMap::new(), 42);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["type"], "report");
        assert_eq!(json["workerId"], "w1");
        assert_eq!(json["state"], "dead");
        assert_eq!(json["time"], 42);
    }

    #[test]
    fn test_report_rejects_other_type_tags() {
        let json = r#"{"type": "ping", "workerId": "w1", "state": "alive", "appData": {}, "time": 1}"#;
        assert!(serde_json::from_str::<Report>(json).is_err());
    }
}
