//! In-memory reference engine.
//!
//! Allocates real port numbers from the configured range and generates
//! plausible ICE, DTLS, SCTP and SRTP parameters, but moves no media. DTLS
//! completes as soon as a transport is connected since there is no remote
//! peer to wait for.
//!
//! Closing a parent through the engine API removes its descendants without
//! notifications; the executor cascades those itself. Notifications are only
//! sent for changes the caller did not ask for directly (consumers seeing
//! their producer paused, ICE loss, engine death).

use super::{
    ConsumerInfo, EngineNotification, MediaEngine, PipeTransportInfo, PlainTransportInfo,
    ProducerInfo, WebRtcTransportInfo,
};
use crate::errors::EngineError;
use async_trait::async_trait;
use base64::Engine as _;
use common::clock;
use common::types::new_id;
use common::wire::commands::{
    ConsumeArgs, PipeTransportConnectArgs, PipeTransportCreateArgs, PlainTransportConnectArgs,
    PlainTransportCreateArgs, ProduceArgs, WebRtcTransportCreateArgs,
};
use common::wire::{
    ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate,
    IceCandidateTcpType, IceCandidateType, IceParameters, IceState, NumSctpStreams,
    ProducerType, RtpCodecCapability, RtpEncoding, RtpParameters, SctpParameters, SctpState,
    SrtpCryptoSuite, SrtpParameters, TransportProtocol, TransportTuple,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// SCTP port announced for data channels.
const SCTP_PORT: u16 = 5000;

/// Default SCTP max message size.
const DEFAULT_MAX_SCTP_MESSAGE_SIZE: u32 = 262_144;

/// SRTP master key + salt length for the AES-CM-128 suites.
const SRTP_KEY_LENGTH: usize = 30;

const UDP_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const TCP_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

/// Buffer for engine notifications. Lagging receivers miss the oldest.
const NOTIFICATION_BUFFER: usize = 1024;

/// Network settings for the loopback engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackConfig {
    pub listen_ip: String,
    pub announce_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announce_ip: "127.0.0.1".to_string(),
            min_port: 10_000,
            max_port: 59_999,
        }
    }
}

struct RouterEntry {
    transports: HashSet<String>,
}

enum TransportKind {
    WebRtc(WebRtcTransportInfo),
    Plain(PlainTransportInfo),
    Pipe(PipeTransportInfo),
}

impl TransportKind {
    fn stats_type(&self) -> &'static str {
        match self {
            Self::WebRtc(_) => "webrtc-transport",
            Self::Plain(_) => "plain-rtp-transport",
            Self::Pipe(_) => "pipe-transport",
        }
    }
}

struct TransportEntry {
    router_id: String,
    ports: Vec<u16>,
    producers: HashSet<String>,
    consumers: HashSet<String>,
    kind: TransportKind,
}

struct ProducerEntry {
    transport_id: String,
    info: ProducerInfo,
    consumers: HashSet<String>,
}

struct ConsumerEntry {
    transport_id: String,
    producer_id: String,
    info: ConsumerInfo,
}

#[derive(Default)]
struct Inner {
    closed: bool,
    used_ports: BTreeSet<u16>,
    routers: HashMap<String, RouterEntry>,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn allocate_port(&mut self, min: u16, max: u16) -> Result<u16, EngineError> {
        let port = (min..=max)
            .find(|p| !self.used_ports.contains(p))
            .ok_or(EngineError::PortsExhausted { min, max })?;
        self.used_ports.insert(port);
        Ok(port)
    }

    fn release_ports(&mut self, ports: &[u16]) {
        for port in ports {
            self.used_ports.remove(port);
        }
    }

    fn transport_mut(&mut self, id: &str) -> Result<&mut TransportEntry, EngineError> {
        self.transports
            .get_mut(id)
            .ok_or_else(|| EngineError::Failed(format!("Transport not found: {id}")))
    }

    fn remove_consumer(&mut self, consumer_id: &str) -> bool {
        let Some(consumer) = self.consumers.remove(consumer_id) else {
            return false;
        };
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(consumer_id);
        }
        true
    }

    fn remove_producer(&mut self, producer_id: &str) -> bool {
        let Some(producer) = self.producers.remove(producer_id) else {
            return false;
        };
        for consumer_id in &producer.consumers {
            self.remove_consumer(consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(producer_id);
        }
        true
    }

    fn remove_transport(&mut self, transport_id: &str) -> bool {
        let Some(transport) = self.transports.remove(transport_id) else {
            return false;
        };
        for producer_id in &transport.producers {
            self.remove_producer(producer_id);
        }
        for consumer_id in &transport.consumers {
            self.remove_consumer(consumer_id);
        }
        self.release_ports(&transport.ports);
        if let Some(router) = self.routers.get_mut(&transport.router_id) {
            router.transports.remove(transport_id);
        }
        true
    }

    fn remove_router(&mut self, router_id: &str) -> bool {
        let Some(router) = self.routers.remove(router_id) else {
            return false;
        };
        for transport_id in &router.transports {
            self.remove_transport(transport_id);
        }
        true
    }

    fn ensure_router(&self, router_id: &str) -> Result<(), EngineError> {
        if self.routers.contains_key(router_id) {
            Ok(())
        } else {
            Err(EngineError::Failed(format!("Router not found: {router_id}")))
        }
    }

    fn register_transport(&mut self, router_id: &str, id: &str, entry: TransportEntry) {
        if let Some(router) = self.routers.get_mut(router_id) {
            router.transports.insert(id.to_string());
        }
        self.transports.insert(id.to_string(), entry);
    }
}

/// Reference [`MediaEngine`] that keeps everything in process memory.
pub struct LoopbackEngine {
    config: LoopbackConfig,
    inner: Mutex<Inner>,
    notifications: broadcast::Sender<EngineNotification>,
}

impl std::fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(config: LoopbackConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            notifications,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notification: EngineNotification) {
        // No receivers is fine: the worker may not have subscribed yet.
        let _ = self.notifications.send(notification);
    }

    fn local_tuple(&self, port: u16) -> TransportTuple {
        TransportTuple {
            local_ip: self.config.announce_ip.clone(),
            local_port: port,
            protocol: TransportProtocol::Udp,
            remote_ip: None,
            remote_port: None,
        }
    }

    /// Ports currently allocated.
    #[must_use]
    pub fn used_ports(&self) -> usize {
        self.inner().used_ports.len()
    }

    /// Simulate loss of ICE connectivity on a WebRTC transport.
    pub fn simulate_ice_disconnect(&self, transport_id: &str) {
        let notification = {
            let mut inner = self.inner();
            let Some(TransportEntry {
                kind: TransportKind::WebRtc(info),
                ..
            }) = inner.transports.get_mut(transport_id)
            else {
                return;
            };
            info.ice_state = IceState::Disconnected;
            EngineNotification::WebRtcTransportState {
                transport_id: transport_id.to_string(),
                ice_state: info.ice_state,
                dtls_state: info.dtls_state,
            }
        };
        self.notify(notification);
    }

    /// Simulate the engine process crashing.
    pub fn simulate_death(&self, reason: &str) {
        {
            let mut inner = self.inner();
            *inner = Inner {
                closed: true,
                ..Inner::default()
            };
        }
        warn!(target: "worker.engine", reason = %reason, "Loopback engine died");
        self.notify(EngineNotification::Died {
            reason: reason.to_string(),
        });
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn ice_parameters() -> IceParameters {
    IceParameters {
        username_fragment: random_string(16),
        password: random_string(32),
        ice_lite: Some(true),
    }
}

fn dtls_parameters() -> DtlsParameters {
    let mut rng = rand::thread_rng();
    let value = (0..32)
        .map(|_| format!("{:02X}", rng.gen::<u8>()))
        .collect::<Vec<_>>()
        .join(":");
    DtlsParameters {
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value,
        }],
        role: Some(DtlsRole::Auto),
    }
}

fn srtp_parameters(crypto_suite: SrtpCryptoSuite) -> SrtpParameters {
    let mut key = [0u8; SRTP_KEY_LENGTH];
    rand::thread_rng().fill(&mut key);
    SrtpParameters {
        crypto_suite,
        key_base64: base64::engine::general_purpose::STANDARD.encode(key),
    }
}

fn sctp_parameters(
    enable: Option<bool>,
    streams: Option<NumSctpStreams>,
    max_message_size: Option<u32>,
) -> (Option<SctpParameters>, Option<SctpState>) {
    if !enable.unwrap_or(false) {
        return (None, None);
    }
    let streams = streams.unwrap_or_default();
    (
        Some(SctpParameters {
            port: SCTP_PORT,
            os: streams.os,
            mis: streams.mis,
            max_message_size: max_message_size.unwrap_or(DEFAULT_MAX_SCTP_MESSAGE_SIZE),
        }),
        Some(SctpState::New),
    )
}

fn producer_type(rtp_parameters: &RtpParameters) -> ProducerType {
    match rtp_parameters.encodings.as_deref() {
        Some([_, _, ..]) => ProducerType::Simulcast,
        Some([single]) if single.scalability_mode.is_some() => ProducerType::Svc,
        _ => ProducerType::Simple,
    }
}

/// Codecs of the producer the consumer side can receive.
fn consumable_parameters(
    producer: &RtpParameters,
    capabilities: Option<&[RtpCodecCapability]>,
) -> Result<RtpParameters, EngineError> {
    let codecs: Vec<_> = match capabilities {
        Some(caps) => producer
            .codecs
            .iter()
            .filter(|codec| {
                caps.iter()
                    .any(|cap| cap.mime_type.eq_ignore_ascii_case(&codec.mime_type))
            })
            .cloned()
            .collect(),
        None => producer.codecs.clone(),
    };
    if codecs.is_empty() {
        return Err(EngineError::Failed(
            "Cannot consume: no compatible codecs".to_string(),
        ));
    }

    Ok(RtpParameters {
        codecs,
        mid: None,
        header_extensions: producer.header_extensions.clone(),
        encodings: Some(vec![RtpEncoding {
            ssrc: Some(rand::thread_rng().gen()),
            rid: None,
            codec_payload_type: None,
            rtx: None,
            dtx: None,
            scalability_mode: None,
        }]),
        rtcp: producer.rtcp.clone(),
    })
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<String, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;

        let id = new_id();
        inner.routers.insert(
            id.clone(),
            RouterEntry {
                transports: HashSet::new(),
            },
        );
        debug!(
            target: "worker.engine",
            router_id = %id,
            codecs = media_codecs.len(),
            "Router created"
        );
        Ok(id)
    }

    async fn close_router(&self, router_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.remove_router(router_id);
        Ok(())
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        args: &WebRtcTransportCreateArgs,
    ) -> Result<WebRtcTransportInfo, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.ensure_router(router_id)?;

        let enable_udp = args.enable_udp.unwrap_or(true);
        let enable_tcp = args.enable_tcp.unwrap_or(false);
        if !enable_udp && !enable_tcp {
            return Err(EngineError::Failed(
                "At least one of enableUdp or enableTcp must be true".to_string(),
            ));
        }

        let (udp_priority, tcp_priority) = if args.prefer_tcp.unwrap_or(false) {
            (TCP_CANDIDATE_PRIORITY, UDP_CANDIDATE_PRIORITY)
        } else {
            (UDP_CANDIDATE_PRIORITY, TCP_CANDIDATE_PRIORITY)
        };

        let mut ports = Vec::new();
        let mut ice_candidates = Vec::new();
        for (enabled, protocol, priority) in [
            (enable_udp, TransportProtocol::Udp, udp_priority),
            (enable_tcp, TransportProtocol::Tcp, tcp_priority),
        ] {
            if !enabled {
                continue;
            }
            let port = match inner.allocate_port(self.config.min_port, self.config.max_port) {
                Ok(port) => port,
                Err(e) => {
                    inner.release_ports(&ports);
                    return Err(e);
                }
            };
            ports.push(port);
            ice_candidates.push(IceCandidate {
                foundation: match protocol {
                    TransportProtocol::Udp => "udpcandidate".to_string(),
                    TransportProtocol::Tcp => "tcpcandidate".to_string(),
                },
                priority,
                ip: self.config.announce_ip.clone(),
                protocol,
                port,
                candidate_type: IceCandidateType::Host,
                tcp_type: (protocol == TransportProtocol::Tcp)
                    .then_some(IceCandidateTcpType::Passive),
            });
        }

        let info = WebRtcTransportInfo {
            id: new_id(),
            ice_parameters: ice_parameters(),
            ice_candidates,
            ice_state: IceState::New,
            dtls_parameters: dtls_parameters(),
            dtls_state: DtlsState::New,
        };
        inner.register_transport(
            router_id,
            &info.id,
            TransportEntry {
                router_id: router_id.to_string(),
                ports,
                producers: HashSet::new(),
                consumers: HashSet::new(),
                kind: TransportKind::WebRtc(info.clone()),
            },
        );
        Ok(info)
    }

    async fn connect_webrtc_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<WebRtcTransportInfo, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        let entry = inner.transport_mut(transport_id)?;
        let TransportKind::WebRtc(info) = &mut entry.kind else {
            return Err(EngineError::Failed(
                "Not a WebRTC transport".to_string(),
            ));
        };
        if info.dtls_state != DtlsState::New {
            return Err(EngineError::Failed("connect() already called".to_string()));
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Failed(
                "Invalid dtlsParameters: no fingerprints".to_string(),
            ));
        }

        info.ice_state = IceState::Connected;
        info.dtls_state = DtlsState::Connected;
        Ok(info.clone())
    }

    async fn restart_ice(&self, transport_id: &str) -> Result<IceParameters, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        let entry = inner.transport_mut(transport_id)?;
        let TransportKind::WebRtc(info) = &mut entry.kind else {
            return Err(EngineError::Failed(
                "Not a WebRTC transport".to_string(),
            ));
        };
        info.ice_parameters = ice_parameters();
        Ok(info.ice_parameters.clone())
    }

    async fn create_plain_transport(
        &self,
        router_id: &str,
        args: &PlainTransportCreateArgs,
    ) -> Result<PlainTransportInfo, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.ensure_router(router_id)?;

        let mut ports = vec![inner.allocate_port(self.config.min_port, self.config.max_port)?];
        let rtcp_tuple = if args.rtcp_mux.unwrap_or(true) {
            None
        } else {
            match inner.allocate_port(self.config.min_port, self.config.max_port) {
                Ok(port) => {
                    ports.push(port);
                    Some(self.local_tuple(port))
                }
                Err(e) => {
                    inner.release_ports(&ports);
                    return Err(e);
                }
            }
        };
        let (sctp_parameters, sctp_state) = sctp_parameters(
            args.enable_sctp,
            args.num_sctp_streams,
            args.max_sctp_message_size,
        );

        let info = PlainTransportInfo {
            id: new_id(),
            tuple: self.local_tuple(ports.first().copied().unwrap_or_default()),
            rtcp_tuple,
            sctp_parameters,
            sctp_state,
            srtp_parameters: args.enable_srtp.unwrap_or(false).then(|| {
                srtp_parameters(
                    args.srtp_crypto_suite
                        .unwrap_or(SrtpCryptoSuite::AesCm128HmacSha1_80),
                )
            }),
        };
        inner.register_transport(
            router_id,
            &info.id,
            TransportEntry {
                router_id: router_id.to_string(),
                ports,
                producers: HashSet::new(),
                consumers: HashSet::new(),
                kind: TransportKind::Plain(info.clone()),
            },
        );
        Ok(info)
    }

    async fn connect_plain_transport(
        &self,
        args: &PlainTransportConnectArgs,
    ) -> Result<PlainTransportInfo, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        let entry = inner.transport_mut(&args.id)?;
        let TransportKind::Plain(info) = &mut entry.kind else {
            return Err(EngineError::Failed("Not a plain transport".to_string()));
        };
        if args.srtp_parameters.is_some() && info.srtp_parameters.is_none() {
            return Err(EngineError::Failed(
                "SRTP not enabled on this transport".to_string(),
            ));
        }

        if let Some(ip) = &args.ip {
            info.tuple.remote_ip = Some(ip.clone());
        }
        if let Some(port) = args.port {
            info.tuple.remote_port = Some(port);
        }
        if let (Some(rtcp_tuple), Some(rtcp_port)) = (info.rtcp_tuple.as_mut(), args.rtcp_port) {
            rtcp_tuple.remote_ip.clone_from(&info.tuple.remote_ip);
            rtcp_tuple.remote_port = Some(rtcp_port);
        }
        if let Some(state) = info.sctp_state.as_mut() {
            *state = SctpState::Connecting;
        }
        Ok(info.clone())
    }

    async fn create_pipe_transport(
        &self,
        router_id: &str,
        args: &PipeTransportCreateArgs,
    ) -> Result<PipeTransportInfo, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.ensure_router(router_id)?;

        let port = inner.allocate_port(self.config.min_port, self.config.max_port)?;
        let (sctp_parameters, sctp_state) = sctp_parameters(
            args.enable_sctp,
            args.num_sctp_streams,
            args.max_sctp_message_size,
        );
        let info = PipeTransportInfo {
            id: new_id(),
            tuple: self.local_tuple(port),
            sctp_parameters,
            sctp_state,
            srtp_parameters: args
                .enable_srtp
                .unwrap_or(false)
                .then(|| srtp_parameters(SrtpCryptoSuite::AesCm128HmacSha1_80)),
        };
        inner.register_transport(
            router_id,
            &info.id,
            TransportEntry {
                router_id: router_id.to_string(),
                ports: vec![port],
                producers: HashSet::new(),
                consumers: HashSet::new(),
                kind: TransportKind::Pipe(info.clone()),
            },
        );
        Ok(info)
    }

    async fn connect_pipe_transport(
        &self,
        args: &PipeTransportConnectArgs,
    ) -> Result<PipeTransportInfo, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        let entry = inner.transport_mut(&args.id)?;
        let TransportKind::Pipe(info) = &mut entry.kind else {
            return Err(EngineError::Failed("Not a pipe transport".to_string()));
        };
        if args.srtp_parameters.is_some() && info.srtp_parameters.is_none() {
            return Err(EngineError::Failed(
                "SRTP not enabled on this transport".to_string(),
            ));
        }

        info.tuple.remote_ip = Some(args.ip.clone());
        info.tuple.remote_port = Some(args.port);
        if let Some(state) = info.sctp_state.as_mut() {
            *state = SctpState::Connecting;
        }
        Ok(info.clone())
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.remove_transport(transport_id);
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        args: &ProduceArgs,
    ) -> Result<ProducerInfo, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.transport_mut(transport_id)?;
        if args.rtp_parameters.codecs.is_empty() {
            return Err(EngineError::Failed(
                "Invalid rtpParameters: no codecs".to_string(),
            ));
        }

        let info = ProducerInfo {
            id: new_id(),
            kind: args.kind,
            rtp_parameters: args.rtp_parameters.clone(),
            producer_type: producer_type(&args.rtp_parameters),
            paused: args.paused.unwrap_or(false),
        };
        inner.transport_mut(transport_id)?.producers.insert(info.id.clone());
        inner.producers.insert(
            info.id.clone(),
            ProducerEntry {
                transport_id: transport_id.to_string(),
                info: info.clone(),
                consumers: HashSet::new(),
            },
        );
        Ok(info)
    }

    async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.set_producer_paused(producer_id, true)
    }

    async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.set_producer_paused(producer_id, false)
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.remove_producer(producer_id);
        Ok(())
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        args: &ConsumeArgs,
    ) -> Result<ConsumerInfo, EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        let pipe = matches!(inner.transport_mut(transport_id)?.kind, TransportKind::Pipe(_));
        let producer = inner
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::Failed(format!("Producer not found: {producer_id}")))?;

        let capabilities = args
            .rtp_capabilities
            .as_ref()
            .and_then(|caps| caps.codecs.as_deref());
        let rtp_parameters = consumable_parameters(&producer.info.rtp_parameters, capabilities)?;
        let consumer_type = if pipe {
            ConsumerType::Pipe
        } else {
            match producer.info.producer_type {
                ProducerType::Simple => ConsumerType::Simple,
                ProducerType::Simulcast => ConsumerType::Simulcast,
                ProducerType::Svc => ConsumerType::Svc,
            }
        };

        let info = ConsumerInfo {
            id: new_id(),
            kind: producer.info.kind,
            rtp_parameters,
            consumer_type,
            paused: args.paused.unwrap_or(false),
            producer_paused: producer.info.paused,
        };

        if let Some(producer) = inner.producers.get_mut(producer_id) {
            producer.consumers.insert(info.id.clone());
        }
        inner.transport_mut(transport_id)?.consumers.insert(info.id.clone());
        inner.consumers.insert(
            info.id.clone(),
            ConsumerEntry {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                info: info.clone(),
            },
        );
        Ok(info)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.set_consumer_paused(consumer_id, true)
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.set_consumer_paused(consumer_id, false)
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        inner.remove_consumer(consumer_id);
        Ok(())
    }

    async fn get_stats(&self, id: &str) -> Result<Option<serde_json::Value>, EngineError> {
        let inner = self.inner();
        inner.ensure_open()?;
        let timestamp = clock::now();

        if let Some(transport) = inner.transports.get(id) {
            return Ok(Some(json!([{
                "type": transport.kind.stats_type(),
                "transportId": id,
                "timestamp": timestamp,
                "bytesReceived": 0,
                "bytesSent": 0,
                "recvBitrate": 0,
                "sendBitrate": 0,
            }])));
        }
        if let Some(producer) = inner.producers.get(id) {
            return Ok(Some(json!([{
                "type": "inbound-rtp",
                "kind": producer.info.kind,
                "timestamp": timestamp,
                "packetCount": 0,
                "byteCount": 0,
                "score": 10,
            }])));
        }
        if let Some(consumer) = inner.consumers.get(id) {
            return Ok(Some(json!([{
                "type": "outbound-rtp",
                "kind": consumer.info.kind,
                "timestamp": timestamp,
                "packetCount": 0,
                "byteCount": 0,
                "score": 10,
            }])));
        }
        Ok(None)
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineNotification> {
        self.notifications.subscribe()
    }

    async fn close(&self) {
        let mut inner = self.inner();
        if inner.closed {
            return;
        }
        *inner = Inner {
            closed: true,
            ..Inner::default()
        };
        info!(target: "worker.engine", "Loopback engine closed");
    }
}

impl LoopbackEngine {
    fn set_producer_paused(&self, producer_id: &str, paused: bool) -> Result<(), EngineError> {
        let consumers = {
            let mut inner = self.inner();
            inner.ensure_open()?;
            let producer = inner
                .producers
                .get_mut(producer_id)
                .ok_or_else(|| EngineError::Failed(format!("Producer not found: {producer_id}")))?;
            if producer.info.paused == paused {
                return Ok(());
            }
            producer.info.paused = paused;
            let consumers: Vec<String> = producer.consumers.iter().cloned().collect();
            for consumer_id in &consumers {
                if let Some(consumer) = inner.consumers.get_mut(consumer_id) {
                    consumer.info.producer_paused = paused;
                }
            }
            consumers
        };

        for consumer_id in consumers {
            self.notify(EngineNotification::ConsumerProducerPaused {
                consumer_id,
                producer_paused: paused,
            });
        }
        Ok(())
    }

    fn set_consumer_paused(&self, consumer_id: &str, paused: bool) -> Result<(), EngineError> {
        let mut inner = self.inner();
        inner.ensure_open()?;
        let consumer = inner
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::Failed(format!("Consumer not found: {consumer_id}")))?;
        consumer.info.paused = paused;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::wire::{MediaKind, RtpCodecParameters};

    fn engine(min_port: u16, max_port: u16) -> LoopbackEngine {
        LoopbackEngine::new(LoopbackConfig {
            min_port,
            max_port,
            ..LoopbackConfig::default()
        })
    }

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 100,
                clock_rate: 48_000,
                channels: Some(2),
                parameters: None,
                rtcp_feedback: None,
            }],
            mid: None,
            header_extensions: None,
            encodings: None,
            rtcp: None,
        }
    }

    fn produce_args() -> ProduceArgs {
        ProduceArgs {
            kind: MediaKind::Audio,
            rtp_parameters: opus_parameters(),
            paused: None,
            key_frame_request_delay: None,
            app_data: None,
        }
    }

    #[tokio::test]
    async fn test_ports_are_allocated_and_released() {
        let engine = engine(20_000, 20_001);
        let router = engine.create_router(&[]).await.unwrap();

        let a = engine
            .create_plain_transport(&router, &PlainTransportCreateArgs::default())
            .await
            .unwrap();
        let b = engine
            .create_plain_transport(&router, &PlainTransportCreateArgs::default())
            .await
            .unwrap();
        assert_eq!(a.tuple.local_port, 20_000);
        assert_eq!(b.tuple.local_port, 20_001);

        let exhausted = engine
            .create_plain_transport(&router, &PlainTransportCreateArgs::default())
            .await;
        assert_eq!(
            exhausted,
            Err(EngineError::PortsExhausted {
                min: 20_000,
                max: 20_001
            })
        );

        engine.close_router(&router).await.unwrap();
        assert_eq!(engine.used_ports(), 0);
    }

    #[tokio::test]
    async fn test_webrtc_transport_candidates() {
        let engine = engine(30_000, 30_010);
        let router = engine.create_router(&[]).await.unwrap();
        let info = engine
            .create_webrtc_transport(
                &router,
                &WebRtcTransportCreateArgs {
                    enable_tcp: Some(true),
                    ..WebRtcTransportCreateArgs::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(info.ice_candidates.len(), 2);
        assert_eq!(info.ice_state, IceState::New);
        assert_eq!(info.dtls_state, DtlsState::New);
        assert_eq!(info.dtls_parameters.fingerprints.len(), 1);
        assert!(info
            .ice_candidates
            .iter()
            .all(|c| c.ip == "127.0.0.1"));
    }

    #[tokio::test]
    async fn test_webrtc_connect_only_once() {
        let engine = engine(30_000, 30_010);
        let router = engine.create_router(&[]).await.unwrap();
        let info = engine
            .create_webrtc_transport(&router, &WebRtcTransportCreateArgs::default())
            .await
            .unwrap();

        let remote = dtls_parameters();
        let connected = engine
            .connect_webrtc_transport(&info.id, &remote)
            .await
            .unwrap();
        assert_eq!(connected.dtls_state, DtlsState::Connected);

        assert!(engine
            .connect_webrtc_transport(&info.id, &remote)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_plain_transports_connect_to_each_other() {
        let engine = engine(40_000, 40_010);
        let router = engine.create_router(&[]).await.unwrap();
        let args = PlainTransportCreateArgs {
            enable_srtp: Some(true),
            ..PlainTransportCreateArgs::default()
        };
        let a = engine.create_plain_transport(&router, &args).await.unwrap();
        let b = engine.create_plain_transport(&router, &args).await.unwrap();

        let a = engine
            .connect_plain_transport(&PlainTransportConnectArgs {
                id: a.id.clone(),
                ip: Some(b.tuple.local_ip.clone()),
                port: Some(b.tuple.local_port),
                rtcp_port: None,
                srtp_parameters: b.srtp_parameters.clone(),
            })
            .await
            .unwrap();

        assert_eq!(a.tuple.remote_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(a.tuple.remote_port, Some(b.tuple.local_port));
        assert_eq!(
            a.srtp_parameters.map(|p| p.key_base64.len()),
            Some(40),
            "30 key bytes encode to 40 base64 chars"
        );
    }

    #[tokio::test]
    async fn test_producer_pause_notifies_consumers() {
        let engine = engine(40_000, 40_010);
        let mut notifications = engine.subscribe();
        let router = engine.create_router(&[]).await.unwrap();
        let transport = engine
            .create_pipe_transport(&router, &PipeTransportCreateArgs::default())
            .await
            .unwrap();
        let producer = engine.produce(&transport.id, &produce_args()).await.unwrap();
        let consumer = engine
            .consume(&transport.id, &producer.id, &ConsumeArgs::default())
            .await
            .unwrap();
        assert_eq!(consumer.consumer_type, ConsumerType::Pipe);

        engine.pause_producer(&producer.id).await.unwrap();
        // Second pause is not a change
        engine.pause_producer(&producer.id).await.unwrap();

        assert_eq!(
            notifications.recv().await.unwrap(),
            EngineNotification::ConsumerProducerPaused {
                consumer_id: consumer.id,
                producer_paused: true,
            }
        );
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_consume_rejects_incompatible_capabilities() {
        let engine = engine(40_000, 40_010);
        let router = engine.create_router(&[]).await.unwrap();
        let transport = engine
            .create_pipe_transport(&router, &PipeTransportCreateArgs::default())
            .await
            .unwrap();
        let producer = engine.produce(&transport.id, &produce_args()).await.unwrap();

        let args = ConsumeArgs {
            rtp_capabilities: Some(common::wire::RtpCapabilities {
                codecs: Some(vec![RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90_000,
                    channels: None,
                    parameters: None,
                    rtcp_feedback: None,
                    preferred_payload_type: None,
                }]),
                header_extensions: None,
                fec_mechanisms: None,
            }),
            ..ConsumeArgs::default()
        };
        let result = engine.consume(&transport.id, &producer.id, &args).await;
        assert!(matches!(result, Err(EngineError::Failed(_))));
    }

    #[tokio::test]
    async fn test_closing_transport_removes_children() {
        let engine = engine(40_000, 40_010);
        let router = engine.create_router(&[]).await.unwrap();
        let transport = engine
            .create_pipe_transport(&router, &PipeTransportCreateArgs::default())
            .await
            .unwrap();
        let producer = engine.produce(&transport.id, &produce_args()).await.unwrap();

        engine.close_transport(&transport.id).await.unwrap();

        assert_eq!(engine.get_stats(&producer.id).await.unwrap(), None);
        assert!(engine.pause_producer(&producer.id).await.is_err());
    }

    #[tokio::test]
    async fn test_death_notifies_and_rejects_calls() {
        let engine = engine(40_000, 40_010);
        let mut notifications = engine.subscribe();

        engine.simulate_death("segfault");

        assert_eq!(
            notifications.recv().await.unwrap(),
            EngineNotification::Died {
                reason: "segfault".to_string()
            }
        );
        assert_eq!(engine.create_router(&[]).await, Err(EngineError::Closed));
    }
}
