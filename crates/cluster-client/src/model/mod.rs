//! Client-side mirror of every worker's resources.
//!
//! Each worker owns a [`WorkerModel`] arena keyed by resource id. Children
//! name their parent by id, and the public handles ([`Router`],
//! [`WebRtcTransport`], [`Producer`], ...) are views over one arena node
//! plus the owning worker.
//!
//! # Update rules
//!
//! - A state with `time` not newer than the last one applied is ignored.
//! - Closed is terminal: once a node is closed nothing reopens it.
//! - Closing a node closes its whole subtree locally without any worker
//!   round trip. Children closed this way are marked as closed externally,
//!   so only the node the caller closed sends a close command.
//!
//! Lock order is always arena before node; handle getters take only the
//! node lock.

mod consumer;
mod producer;
mod router;
mod transport;
mod worker;

pub use consumer::Consumer;
pub use producer::Producer;
pub use router::Router;
pub use transport::{PipeTransport, PlainTransport, Transport, WebRtcTransport};
pub use worker::{Worker, WorkerStatus};

use crate::errors::ClientError;
use common::wire::media::{DtlsState, IceState, SctpState};
use common::wire::states::{
    ConsumerState, PipeTransportState, PlainTransportState, ProducerState, ResourceState,
    RouterState, WebRtcTransportState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A state snapshot that can be closed locally.
pub(crate) trait Mirrored: ResourceState + Send + 'static {
    /// Overwrite the fields a closed resource reports.
    fn mark_closed(&mut self);
}

impl Mirrored for RouterState {
    fn mark_closed(&mut self) {
        self.closed = true;
    }
}

impl Mirrored for WebRtcTransportState {
    fn mark_closed(&mut self) {
        self.closed = true;
        self.dtls_state = DtlsState::Closed;
        self.ice_state = IceState::Closed;
    }
}

impl Mirrored for PlainTransportState {
    fn mark_closed(&mut self) {
        self.closed = true;
        if self.sctp_state.is_some() {
            self.sctp_state = Some(SctpState::Closed);
        }
    }
}

impl Mirrored for PipeTransportState {
    fn mark_closed(&mut self) {
        self.closed = true;
        if self.sctp_state.is_some() {
            self.sctp_state = Some(SctpState::Closed);
        }
    }
}

impl Mirrored for ProducerState {
    fn mark_closed(&mut self) {
        self.closed = true;
        self.paused = true;
    }
}

impl Mirrored for ConsumerState {
    fn mark_closed(&mut self) {
        self.closed = true;
        self.paused = true;
    }
}

struct Mirror<S> {
    state: S,
    last_seen: u64,
    /// Set when the worker (or a cascade) closed the resource; stops any
    /// pending close confirmation.
    closed_externally: Arc<AtomicBool>,
}

/// One mirrored resource.
pub(crate) struct Node<S> {
    id: String,
    mirror: Mutex<Mirror<S>>,
}

impl<S: Mirrored> Node<S> {
    fn new(state: S) -> Arc<Self> {
        Arc::new(Self {
            id: state.id().to_string(),
            mirror: Mutex::new(Mirror {
                last_seen: state.time(),
                state,
                closed_externally: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    fn mirror(&self) -> MutexGuard<'_, Mirror<S>> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.mirror().state)
    }

    pub(crate) fn closed(&self) -> bool {
        self.mirror().state.closed()
    }

    /// Apply an authoritative snapshot. Returns true if it closed the node.
    fn apply(&self, incoming: S) -> bool {
        let mut mirror = self.mirror();
        if mirror.state.closed() {
            if incoming.closed() {
                mirror.closed_externally.store(true, Ordering::Release);
            }
            return false;
        }
        if incoming.time() <= mirror.last_seen {
            return false;
        }

        mirror.last_seen = incoming.time();
        let closing = incoming.closed();
        mirror.state = incoming;
        if closing {
            mirror.closed_externally.store(true, Ordering::Release);
        }
        closing
    }

    /// Close because the worker or an ancestor did.
    fn close_remote(&self) {
        let mut mirror = self.mirror();
        mirror.closed_externally.store(true, Ordering::Release);
        if !mirror.state.closed() {
            mirror.state.mark_closed();
        }
    }

    /// Close on the caller's behalf. Returns the superseded flag for the
    /// close confirmation, or `None` if the node was already closed.
    fn close_local(&self) -> Option<Arc<AtomicBool>> {
        let mut mirror = self.mirror();
        if mirror.state.closed() {
            return None;
        }
        mirror.state.mark_closed();
        Some(Arc::clone(&mirror.closed_externally))
    }
}

/// A transport node of any kind.
#[derive(Clone)]
pub(crate) enum AnyTransport {
    WebRtc(Arc<Node<WebRtcTransportState>>),
    Plain(Arc<Node<PlainTransportState>>),
    Pipe(Arc<Node<PipeTransportState>>),
}

impl AnyTransport {
    fn closed(&self) -> bool {
        match self {
            Self::WebRtc(node) => node.closed(),
            Self::Plain(node) => node.closed(),
            Self::Pipe(node) => node.closed(),
        }
    }

    fn close_remote(&self) {
        match self {
            Self::WebRtc(node) => node.close_remote(),
            Self::Plain(node) => node.close_remote(),
            Self::Pipe(node) => node.close_remote(),
        }
    }

    fn close_local(&self) -> Option<Arc<AtomicBool>> {
        match self {
            Self::WebRtc(node) => node.close_local(),
            Self::Plain(node) => node.close_local(),
            Self::Pipe(node) => node.close_local(),
        }
    }
}

/// Maps a transport state type to its [`AnyTransport`] variant.
pub(crate) trait TransportKind: Mirrored + Sized {
    fn wrap(node: Arc<Node<Self>>) -> AnyTransport;
    fn unwrap(any: &AnyTransport) -> Option<&Arc<Node<Self>>>;
}

macro_rules! impl_transport_kind {
    ($state:ty, $variant:ident) => {
        impl TransportKind for $state {
            fn wrap(node: Arc<Node<Self>>) -> AnyTransport {
                AnyTransport::$variant(node)
            }

            fn unwrap(any: &AnyTransport) -> Option<&Arc<Node<Self>>> {
                match any {
                    AnyTransport::$variant(node) => Some(node),
                    _ => None,
                }
            }
        }
    };
}

impl_transport_kind!(WebRtcTransportState, WebRtc);
impl_transport_kind!(PlainTransportState, Plain);
impl_transport_kind!(PipeTransportState, Pipe);

struct RouterSlot {
    node: Arc<Node<RouterState>>,
    transports: Vec<String>,
}

struct TransportSlot {
    node: AnyTransport,
    producers: Vec<String>,
    consumers: Vec<String>,
}

struct ProducerSlot {
    node: Arc<Node<ProducerState>>,
}

struct ConsumerSlot {
    node: Arc<Node<ConsumerState>>,
    producer_id: String,
}

/// Arena of one worker's mirrored resources. Closed nodes stay in the
/// arena so that handles keep reporting their final state.
#[derive(Default)]
pub(crate) struct WorkerModel {
    status: WorkerStatus,
    routers: HashMap<String, RouterSlot>,
    transports: HashMap<String, TransportSlot>,
    producers: HashMap<String, ProducerSlot>,
    consumers: HashMap<String, ConsumerSlot>,
    /// Router ids in creation order.
    router_order: Vec<String>,
}

impl WorkerModel {
    pub(crate) fn status(&self) -> WorkerStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: WorkerStatus) {
        self.status = status;
    }

    // Registration. An id that is already known (an idempotent repeat or
    // an event that arrived before the reply) is updated in place.

    pub(crate) fn register_router(&mut self, state: RouterState) -> Arc<Node<RouterState>> {
        if let Some(slot) = self.routers.get(&state.id) {
            let node = Arc::clone(&slot.node);
            self.apply_router(state);
            return node;
        }

        let node = Node::new(state);
        if self.status == WorkerStatus::Dead {
            node.close_remote();
        }
        self.router_order.push(node.id().to_string());
        self.routers.insert(
            node.id().to_string(),
            RouterSlot {
                node: Arc::clone(&node),
                transports: Vec::new(),
            },
        );
        node
    }

    pub(crate) fn register_transport<S: TransportKind>(
        &mut self,
        router_id: &str,
        state: S,
    ) -> Result<Arc<Node<S>>, ClientError> {
        if let Some(slot) = self.transports.get(state.id()) {
            let node = S::unwrap(&slot.node).cloned().ok_or(ClientError::Unknown)?;
            self.apply_transport(state);
            return Ok(node);
        }

        let node = Node::new(state);
        let parent_closed = match self.routers.get_mut(router_id) {
            Some(router) => {
                router.transports.push(node.id().to_string());
                router.node.closed()
            }
            None => false,
        };
        if parent_closed || self.status == WorkerStatus::Dead {
            node.close_remote();
        }
        self.transports.insert(
            node.id().to_string(),
            TransportSlot {
                node: S::wrap(Arc::clone(&node)),
                producers: Vec::new(),
                consumers: Vec::new(),
            },
        );
        Ok(node)
    }

    pub(crate) fn register_producer(
        &mut self,
        transport_id: &str,
        state: ProducerState,
    ) -> Arc<Node<ProducerState>> {
        if let Some(slot) = self.producers.get(&state.id) {
            let node = Arc::clone(&slot.node);
            self.apply_producer(state);
            return node;
        }

        let node = Node::new(state);
        let parent_closed = match self.transports.get_mut(transport_id) {
            Some(transport) => {
                transport.producers.push(node.id().to_string());
                transport.node.closed()
            }
            None => false,
        };
        if parent_closed || self.status == WorkerStatus::Dead {
            node.close_remote();
        }
        self.producers.insert(
            node.id().to_string(),
            ProducerSlot {
                node: Arc::clone(&node),
            },
        );
        node
    }

    pub(crate) fn register_consumer(
        &mut self,
        transport_id: &str,
        producer_id: &str,
        state: ConsumerState,
    ) -> Arc<Node<ConsumerState>> {
        if let Some(slot) = self.consumers.get(&state.id) {
            let node = Arc::clone(&slot.node);
            self.apply_consumer(state);
            return node;
        }

        let node = Node::new(state);
        let parent_closed = match self.transports.get_mut(transport_id) {
            Some(transport) => {
                transport.consumers.push(node.id().to_string());
                transport.node.closed()
            }
            None => false,
        };
        if parent_closed || self.status == WorkerStatus::Dead {
            node.close_remote();
        }
        self.consumers.insert(
            node.id().to_string(),
            ConsumerSlot {
                node: Arc::clone(&node),
                producer_id: producer_id.to_string(),
            },
        );
        node
    }

    // Authoritative updates. Unknown ids are ignored.

    pub(crate) fn apply_router(&self, state: RouterState) {
        let Some(slot) = self.routers.get(&state.id) else {
            return;
        };
        let id = state.id.clone();
        if slot.node.apply(state) {
            self.cascade_router(&id);
        }
    }

    pub(crate) fn apply_transport<S: TransportKind>(&self, state: S) {
        let Some(node) = self
            .transports
            .get(state.id())
            .and_then(|slot| S::unwrap(&slot.node))
        else {
            return;
        };
        let id = state.id().to_string();
        if node.apply(state) {
            self.cascade_transport(&id);
        }
    }

    pub(crate) fn apply_producer(&self, state: ProducerState) {
        if let Some(slot) = self.producers.get(&state.id) {
            slot.node.apply(state);
        }
    }

    pub(crate) fn apply_consumer(&self, state: ConsumerState) {
        if let Some(slot) = self.consumers.get(&state.id) {
            slot.node.apply(state);
        }
    }

    // Local closes. Each returns the superseded flag of the closed node
    // when it was open.

    pub(crate) fn close_router(&self, id: &str) -> Option<Arc<AtomicBool>> {
        let superseded = self.routers.get(id)?.node.close_local()?;
        self.cascade_router(id);
        Some(superseded)
    }

    pub(crate) fn close_transport(&self, id: &str) -> Option<Arc<AtomicBool>> {
        let superseded = self.transports.get(id)?.node.close_local()?;
        self.cascade_transport(id);
        Some(superseded)
    }

    pub(crate) fn close_producer(&self, id: &str) -> Option<Arc<AtomicBool>> {
        self.producers.get(id)?.node.close_local()
    }

    pub(crate) fn close_consumer(&self, id: &str) -> Option<Arc<AtomicBool>> {
        self.consumers.get(id)?.node.close_local()
    }

    /// Close everything, as when the worker dies.
    pub(crate) fn close_all(&self) {
        for id in &self.router_order {
            if let Some(slot) = self.routers.get(id) {
                slot.node.close_remote();
                self.cascade_router(id);
            }
        }
    }

    fn cascade_router(&self, id: &str) {
        let Some(router) = self.routers.get(id) else {
            return;
        };
        for transport_id in &router.transports {
            if let Some(slot) = self.transports.get(transport_id) {
                slot.node.close_remote();
                self.cascade_transport(transport_id);
            }
        }
    }

    fn cascade_transport(&self, id: &str) {
        let Some(transport) = self.transports.get(id) else {
            return;
        };
        for producer_id in &transport.producers {
            if let Some(slot) = self.producers.get(producer_id) {
                slot.node.close_remote();
            }
        }
        for consumer_id in &transport.consumers {
            if let Some(slot) = self.consumers.get(consumer_id) {
                slot.node.close_remote();
            }
        }
    }

    // Lookups, in creation order.

    pub(crate) fn routers(&self) -> Vec<Arc<Node<RouterState>>> {
        self.router_order
            .iter()
            .filter_map(|id| self.routers.get(id))
            .map(|slot| Arc::clone(&slot.node))
            .collect()
    }

    pub(crate) fn router(&self, id: &str) -> Option<Arc<Node<RouterState>>> {
        self.routers.get(id).map(|slot| Arc::clone(&slot.node))
    }

    pub(crate) fn transports_of(&self, router_id: &str) -> Vec<AnyTransport> {
        self.routers
            .get(router_id)
            .map(|router| {
                router
                    .transports
                    .iter()
                    .filter_map(|id| self.transports.get(id))
                    .map(|slot| slot.node.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn producers_of(&self, transport_id: &str) -> Vec<Arc<Node<ProducerState>>> {
        self.transports
            .get(transport_id)
            .map(|transport| {
                transport
                    .producers
                    .iter()
                    .filter_map(|id| self.producers.get(id))
                    .map(|slot| Arc::clone(&slot.node))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn consumers_of(
        &self,
        transport_id: &str,
    ) -> Vec<(Arc<Node<ConsumerState>>, String)> {
        self.transports
            .get(transport_id)
            .map(|transport| {
                transport
                    .consumers
                    .iter()
                    .filter_map(|id| self.consumers.get(id))
                    .map(|slot| (Arc::clone(&slot.node), slot.producer_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Treat an error reply to a close as settled: the worker no longer has
/// the resource. Only transport-level failures are retried.
pub(crate) fn settled<T>(result: Result<T, ClientError>) -> Result<(), ClientError> {
    match result {
        Ok(_) | Err(ClientError::Remote(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use common::types::SimpleMap;
    use common::wire::media::{MediaKind, RtpParameters};
    use common::wire::states::ProducerType;

    fn router(id: &str, time: u64) -> RouterState {
        RouterState {
            id: id.to_string(),
            closed: false,
            app_data: SimpleMap::new(),
            time,
        }
    }

    fn pipe(id: &str, time: u64) -> PipeTransportState {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "closed": false,
            "appData": {},
            "tuple": {"localIp": "127.0.0.1", "localPort": 10000, "protocol": "udp"},
            "time": time,
        }))
        .unwrap()
    }

    fn producer(id: &str, time: u64) -> ProducerState {
        ProducerState {
            id: id.to_string(),
            closed: false,
            app_data: SimpleMap::new(),
            paused: false,
            rtp_parameters: RtpParameters {
                codecs: Vec::new(),
                mid: None,
                header_extensions: None,
                encodings: None,
                rtcp: None,
            },
            producer_type: ProducerType::Simple,
            kind: MediaKind::Audio,
            time,
        }
    }

    fn tree() -> WorkerModel {
        let mut model = WorkerModel::default();
        model.register_router(router("r", 1));
        model.register_transport("r", pipe("t", 2)).unwrap();
        model.register_producer("t", producer("p", 3));
        model
    }

    #[test]
    fn test_stale_and_equal_times_are_ignored() {
        let model = tree();
        let mut update = router("r", 1);
        update.app_data.insert("k".to_string(), "v".into());
        model.apply_router(update.clone());
        assert!(model.router("r").unwrap().read(|s| s.app_data.is_empty()));

        update.time = 5;
        model.apply_router(update);
        assert!(!model.router("r").unwrap().read(|s| s.app_data.is_empty()));
    }

    #[test]
    fn test_closed_is_terminal() {
        let model = tree();
        let mut closed = producer("p", 10);
        closed.closed = true;
        closed.paused = true;
        model.apply_producer(closed);

        model.apply_producer(producer("p", 11));
        let node = model.producers_of("t").pop().unwrap();
        assert!(node.closed());
        assert!(node.read(|s| s.paused));
    }

    #[test]
    fn test_local_close_cascades_without_flagging_the_root() {
        let model = tree();
        let superseded = model.close_router("r").unwrap();
        assert!(!superseded.load(Ordering::Acquire));

        let transports = model.transports_of("r");
        assert_eq!(transports.len(), 1);
        assert!(transports[0].closed());
        let producer = model.producers_of("t").pop().unwrap();
        assert!(producer.closed());
        assert!(producer.read(|s| s.paused));

        // Already closed: no second confirmation.
        assert!(model.close_router("r").is_none());
        assert!(model.close_transport("t").is_none());
    }

    #[test]
    fn test_server_close_supersedes_pending_confirmation() {
        let model = tree();
        let superseded = model.close_transport("t").unwrap();

        let mut closed = pipe("t", 20);
        closed.closed = true;
        model.apply_transport(closed);
        assert!(superseded.load(Ordering::Acquire));
    }

    #[test]
    fn test_children_of_closed_parent_register_closed() {
        let mut model = tree();
        model.close_router("r");
        let late = model.register_transport("r", pipe("t2", 30)).unwrap();
        assert!(late.closed());
    }

    #[test]
    fn test_repeat_registration_returns_same_node() {
        let mut model = tree();
        let first = model.router("r").unwrap();
        let again = model.register_router(router("r", 1));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(model.routers().len(), 1);
    }

    #[test]
    fn test_close_all_closes_every_node() {
        let model = tree();
        model.close_all();
        assert!(model.routers().iter().all(|r| r.closed()));
        assert!(model.transports_of("r").iter().all(AnyTransport::closed));
        assert!(model.producers_of("t").iter().all(|p| p.closed()));
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let model = tree();
        model.apply_router(router("other", 9));
        model.apply_producer(producer("other", 9));
        assert!(model.router("other").is_none());
    }
}
