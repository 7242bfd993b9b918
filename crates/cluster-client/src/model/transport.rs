//! WebRTC, plain and pipe transports.
//!
//! The three kinds share the [`Transport`] trait (produce, consume, close,
//! stats, children) and add their own `connect`. A transport closed
//! locally refuses `connect` and `restart_ice`, both before sending and
//! after the reply.

use super::worker::{confirm_close, WorkerShared};
use super::{Consumer, Node, Producer, TransportKind};
use crate::errors::ClientError;
use async_trait::async_trait;
use common::types::SimpleMap;
use common::wire::commands::{
    ConsumeArgs, PipeTransportConnectArgs, PlainTransportConnectArgs, ProduceArgs,
    WebRtcTransportConnectArgs,
};
use common::wire::media::{
    DtlsParameters, DtlsState, IceCandidate, IceParameters, IceState, SctpParameters, SctpState,
    SrtpParameters, TransportTuple,
};
use common::wire::states::{PipeTransportState, PlainTransportState, WebRtcTransportState};
use std::fmt;
use std::sync::Arc;

/// Operations every transport kind supports.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    fn closed(&self) -> bool;

    fn app_data(&self) -> SimpleMap;

    /// Start sending media into the router.
    ///
    /// # Errors
    ///
    /// `AlreadyClosed` or `WorkerDead` locally, otherwise the command error.
    async fn produce(&self, args: ProduceArgs, repeat_key: &str) -> Result<Producer, ClientError>;

    /// Receive media of `producer_id`.
    ///
    /// # Errors
    ///
    /// `AlreadyClosed` or `WorkerDead` locally, otherwise the command error.
    async fn consume(
        &self,
        producer_id: &str,
        args: ConsumeArgs,
        repeat_key: &str,
    ) -> Result<Consumer, ClientError>;

    /// Close the transport and its producers and consumers. Takes effect
    /// locally at once.
    fn close(&self);

    /// Engine statistics, `None` once closed.
    ///
    /// # Errors
    ///
    /// Returns the command error.
    async fn get_stats(&self) -> Result<Option<serde_json::Value>, ClientError>;

    fn producers(&self) -> Vec<Producer>;

    fn consumers(&self) -> Vec<Consumer>;
}

/// Fails if the transport is closed or its worker is dead.
fn ensure_open<S: TransportKind>(
    node: &Node<S>,
    worker: &WorkerShared,
) -> Result<(), ClientError> {
    worker.ensure_alive()?;
    if node.closed() {
        return Err(ClientError::AlreadyClosed("Transport"));
    }
    Ok(())
}

async fn produce<S: TransportKind>(
    node: &Node<S>,
    worker: &Arc<WorkerShared>,
    args: ProduceArgs,
    repeat_key: &str,
) -> Result<Producer, ClientError> {
    ensure_open(node, worker)?;
    let state = worker
        .api
        .create_producer(node.id(), args, repeat_key)
        .await?;
    let producer = worker.model().register_producer(node.id(), state);
    Ok(Producer::new(producer, Arc::clone(worker)))
}

async fn consume<S: TransportKind>(
    node: &Node<S>,
    worker: &Arc<WorkerShared>,
    producer_id: &str,
    args: ConsumeArgs,
    repeat_key: &str,
) -> Result<Consumer, ClientError> {
    ensure_open(node, worker)?;
    let state = worker
        .api
        .create_consumer(node.id(), producer_id, args, repeat_key)
        .await?;
    let consumer = worker
        .model()
        .register_consumer(node.id(), producer_id, state);
    Ok(Consumer::new(
        consumer,
        producer_id.to_string(),
        Arc::clone(worker),
    ))
}

async fn get_stats<S: TransportKind>(
    node: &Node<S>,
    worker: &WorkerShared,
) -> Result<Option<serde_json::Value>, ClientError> {
    if node.closed() {
        return Ok(None);
    }
    worker.api.get_stats(node.id()).await
}

fn producers<S: TransportKind>(node: &Node<S>, worker: &Arc<WorkerShared>) -> Vec<Producer> {
    worker
        .model()
        .producers_of(node.id())
        .into_iter()
        .map(|producer| Producer::new(producer, Arc::clone(worker)))
        .collect()
}

fn consumers<S: TransportKind>(node: &Node<S>, worker: &Arc<WorkerShared>) -> Vec<Consumer> {
    worker
        .model()
        .consumers_of(node.id())
        .into_iter()
        .map(|(consumer, producer_id)| Consumer::new(consumer, producer_id, Arc::clone(worker)))
        .collect()
}

/// Applies a connect or restart reply unless the transport was closed
/// while the command was in flight.
fn apply_reply<S: TransportKind>(
    node: &Node<S>,
    worker: &WorkerShared,
    state: S,
) -> Result<(), ClientError> {
    let model = worker.model();
    if node.closed() {
        return Err(ClientError::AlreadyClosed("Transport"));
    }
    model.apply_transport(state);
    Ok(())
}

macro_rules! transport_handle {
    ($handle:ident, $state:ty, $close:ident, $operation:literal) => {
        #[derive(Clone)]
        pub struct $handle {
            node: Arc<Node<$state>>,
            worker: Arc<WorkerShared>,
        }

        impl $handle {
            pub(crate) fn new(node: Arc<Node<$state>>, worker: Arc<WorkerShared>) -> Self {
                Self { node, worker }
            }

            /// Latest mirrored snapshot.
            #[must_use]
            pub fn state(&self) -> $state {
                self.node.read(Clone::clone)
            }
        }

        #[async_trait]
        impl Transport for $handle {
            fn id(&self) -> &str {
                self.node.id()
            }

            fn closed(&self) -> bool {
                self.node.closed()
            }

            fn app_data(&self) -> SimpleMap {
                self.node.read(|state| state.app_data.clone())
            }

            async fn produce(
                &self,
                args: ProduceArgs,
                repeat_key: &str,
            ) -> Result<Producer, ClientError> {
                produce(&self.node, &self.worker, args, repeat_key).await
            }

            async fn consume(
                &self,
                producer_id: &str,
                args: ConsumeArgs,
                repeat_key: &str,
            ) -> Result<Consumer, ClientError> {
                consume(&self.node, &self.worker, producer_id, args, repeat_key).await
            }

            fn close(&self) {
                let Some(superseded) = self.worker.model().close_transport(self.node.id()) else {
                    return;
                };
                confirm_close(
                    &self.worker,
                    $operation,
                    self.node.id(),
                    superseded,
                    |api, id| async move { api.$close(&id).await },
                );
            }

            async fn get_stats(&self) -> Result<Option<serde_json::Value>, ClientError> {
                get_stats(&self.node, &self.worker).await
            }

            fn producers(&self) -> Vec<Producer> {
                producers(&self.node, &self.worker)
            }

            fn consumers(&self) -> Vec<Consumer> {
                consumers(&self.node, &self.worker)
            }
        }

        impl PartialEq for $handle {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.node, &other.node)
            }
        }

        impl fmt::Debug for $handle {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($handle))
                    .field("id", &self.node.id())
                    .field("closed", &self.node.closed())
                    .finish_non_exhaustive()
            }
        }
    };
}

transport_handle!(
    WebRtcTransport,
    WebRtcTransportState,
    close_webrtc_transport,
    "webrtc-transport-close"
);
transport_handle!(
    PlainTransport,
    PlainTransportState,
    close_plain_transport,
    "plain-transport-close"
);
transport_handle!(
    PipeTransport,
    PipeTransportState,
    close_pipe_transport,
    "pipe-transport-close"
);

impl WebRtcTransport {
    #[must_use]
    pub fn ice_parameters(&self) -> IceParameters {
        self.node.read(|state| state.ice_parameters.clone())
    }

    #[must_use]
    pub fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.node.read(|state| state.ice_candidates.clone())
    }

    #[must_use]
    pub fn ice_state(&self) -> IceState {
        self.node.read(|state| state.ice_state)
    }

    #[must_use]
    pub fn dtls_parameters(&self) -> DtlsParameters {
        self.node.read(|state| state.dtls_parameters.clone())
    }

    #[must_use]
    pub fn dtls_state(&self) -> DtlsState {
        self.node.read(|state| state.dtls_state)
    }

    /// Provide the remote DTLS parameters.
    ///
    /// # Errors
    ///
    /// `AlreadyClosed` if the transport is closed before or during the
    /// call, otherwise the command error.
    pub async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), ClientError> {
        ensure_open(&self.node, &self.worker)?;
        let state = self
            .worker
            .api
            .connect_webrtc_transport(WebRtcTransportConnectArgs {
                id: self.node.id().to_string(),
                dtls_parameters,
            })
            .await?;
        apply_reply(&self.node, &self.worker, state)
    }

    /// Restart ICE and return the new local ICE parameters.
    ///
    /// # Errors
    ///
    /// `AlreadyClosed` if the transport is closed before or during the
    /// call, otherwise the command error.
    pub async fn restart_ice(&self) -> Result<IceParameters, ClientError> {
        ensure_open(&self.node, &self.worker)?;
        let state = self
            .worker
            .api
            .restart_webrtc_transport(self.node.id())
            .await?;
        let ice_parameters = state.ice_parameters.clone();
        apply_reply(&self.node, &self.worker, state)?;
        Ok(ice_parameters)
    }
}

impl PlainTransport {
    #[must_use]
    pub fn tuple(&self) -> TransportTuple {
        self.node.read(|state| state.tuple.clone())
    }

    #[must_use]
    pub fn rtcp_tuple(&self) -> Option<TransportTuple> {
        self.node.read(|state| state.rtcp_tuple.clone())
    }

    #[must_use]
    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.node.read(|state| state.sctp_parameters)
    }

    #[must_use]
    pub fn sctp_state(&self) -> Option<SctpState> {
        self.node.read(|state| state.sctp_state)
    }

    #[must_use]
    pub fn srtp_parameters(&self) -> Option<SrtpParameters> {
        self.node.read(|state| state.srtp_parameters.clone())
    }

    /// Provide the remote endpoint. The `id` field of `args` is ignored.
    ///
    /// # Errors
    ///
    /// `AlreadyClosed` if the transport is closed before or during the
    /// call, otherwise the command error.
    pub async fn connect(&self, args: PlainTransportConnectArgs) -> Result<(), ClientError> {
        ensure_open(&self.node, &self.worker)?;
        let state = self
            .worker
            .api
            .connect_plain_transport(PlainTransportConnectArgs {
                id: self.node.id().to_string(),
                ..args
            })
            .await?;
        apply_reply(&self.node, &self.worker, state)
    }
}

impl PipeTransport {
    #[must_use]
    pub fn tuple(&self) -> TransportTuple {
        self.node.read(|state| state.tuple.clone())
    }

    #[must_use]
    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.node.read(|state| state.sctp_parameters)
    }

    #[must_use]
    pub fn sctp_state(&self) -> Option<SctpState> {
        self.node.read(|state| state.sctp_state)
    }

    #[must_use]
    pub fn srtp_parameters(&self) -> Option<SrtpParameters> {
        self.node.read(|state| state.srtp_parameters.clone())
    }

    /// Provide the remote pipe endpoint.
    ///
    /// # Errors
    ///
    /// `AlreadyClosed` if the transport is closed before or during the
    /// call, otherwise the command error.
    pub async fn connect(
        &self,
        ip: &str,
        port: u16,
        srtp_parameters: Option<SrtpParameters>,
    ) -> Result<(), ClientError> {
        ensure_open(&self.node, &self.worker)?;
        let state = self
            .worker
            .api
            .connect_pipe_transport(PipeTransportConnectArgs {
                id: self.node.id().to_string(),
                ip: ip.to_string(),
                port,
                srtp_parameters,
            })
            .await?;
        apply_reply(&self.node, &self.worker, state)
    }
}
