//! Worker command executor.
//!
//! Owns the authoritative resource maps of one worker. Every mutation goes
//! through a `sync_*` call that compares the resource's current state with
//! the last state it reported; when they differ an event is appended to the
//! log and handed to the publisher channel, both under the same mutex so
//! that live publication order equals seq order.
//!
//! Records are kept after close so that repeated closes and repeat-key
//! replays keep answering with the terminal state.
//!
//! The std mutex is never held across an engine call. Handlers read what
//! they need, release, await the engine, then re-acquire and re-check: a
//! parent may have closed in between.

use crate::engine::{
    EngineNotification, MediaEngine, PipeTransportInfo, PlainTransportInfo, WebRtcTransportInfo,
};
use crate::errors::CommandError;
use crate::event_log::EventLog;
use crate::observability::metrics;
use common::clock;
use common::types::SimpleMap;
use common::wire::commands::{
    ConsumeArgs, GetEventsResponse, PipeTransportConnectArgs, PipeTransportCreateArgs,
    PlainTransportConnectArgs, PlainTransportCreateArgs, ProduceArgs, RouterCreateArgs,
    StatsResponse, WebRtcTransportConnectArgs, WebRtcTransportCreateArgs,
};
use common::wire::{
    ConsumerState, DtlsState, Event, EventBox, IceState, PipeTransportState, PlainTransportState,
    ProducerState, ResourceState, RouterState, SctpState, WebRtcTransportState,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A state plus the last version of it that went out as an event.
#[derive(Debug)]
struct Tracked<S> {
    current: S,
    reported: Option<S>,
}

impl<S: ResourceState> Tracked<S> {
    fn new(state: S) -> Self {
        Self {
            current: state,
            reported: None,
        }
    }

    /// Stamp and return the current state if it differs from what was last
    /// reported.
    fn take_change(&mut self) -> Option<S> {
        if let Some(reported) = &self.reported {
            if !self.current.differs_from(reported) {
                return None;
            }
        }
        self.current.set_time(clock::now());
        self.reported = Some(self.current.clone());
        Some(self.current.clone())
    }

    /// Current state with a fresh version stamp, for replies.
    fn snapshot(&self) -> S {
        let mut state = self.current.clone();
        state.set_time(clock::now());
        state
    }
}

#[derive(Debug)]
struct RouterRecord {
    state: Tracked<RouterState>,
    transports: BTreeSet<String>,
}

#[derive(Debug)]
enum TransportState {
    WebRtc(Tracked<WebRtcTransportState>),
    Plain(Tracked<PlainTransportState>),
    Pipe(Tracked<PipeTransportState>),
}

#[derive(Debug)]
struct TransportRecord {
    router_id: String,
    state: TransportState,
    producers: BTreeSet<String>,
    consumers: BTreeSet<String>,
    /// WebRTC only: the engine connect has been issued.
    connect_called: bool,
}

impl TransportRecord {
    fn closed(&self) -> bool {
        match &self.state {
            TransportState::WebRtc(t) => t.current.closed,
            TransportState::Plain(t) => t.current.closed,
            TransportState::Pipe(t) => t.current.closed,
        }
    }

    fn mark_closed(&mut self) {
        match &mut self.state {
            TransportState::WebRtc(t) => {
                t.current.closed = true;
                t.current.ice_state = IceState::Closed;
                t.current.dtls_state = DtlsState::Closed;
            }
            TransportState::Plain(t) => {
                t.current.closed = true;
                if t.current.sctp_state.is_some() {
                    t.current.sctp_state = Some(SctpState::Closed);
                }
            }
            TransportState::Pipe(t) => {
                t.current.closed = true;
                if t.current.sctp_state.is_some() {
                    t.current.sctp_state = Some(SctpState::Closed);
                }
            }
        }
    }

    fn webrtc(&self) -> Option<&Tracked<WebRtcTransportState>> {
        match &self.state {
            TransportState::WebRtc(t) => Some(t),
            _ => None,
        }
    }

    fn webrtc_mut(&mut self) -> Option<&mut Tracked<WebRtcTransportState>> {
        match &mut self.state {
            TransportState::WebRtc(t) => Some(t),
            _ => None,
        }
    }

    fn plain(&self) -> Option<&Tracked<PlainTransportState>> {
        match &self.state {
            TransportState::Plain(t) => Some(t),
            _ => None,
        }
    }

    fn plain_mut(&mut self) -> Option<&mut Tracked<PlainTransportState>> {
        match &mut self.state {
            TransportState::Plain(t) => Some(t),
            _ => None,
        }
    }

    fn pipe(&self) -> Option<&Tracked<PipeTransportState>> {
        match &self.state {
            TransportState::Pipe(t) => Some(t),
            _ => None,
        }
    }

    fn pipe_mut(&mut self) -> Option<&mut Tracked<PipeTransportState>> {
        match &mut self.state {
            TransportState::Pipe(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct ProducerRecord {
    router_id: String,
    transport_id: String,
    state: Tracked<ProducerState>,
    /// Consumers of this producer on any transport.
    consumers: BTreeSet<String>,
}

#[derive(Debug)]
struct ConsumerRecord {
    router_id: String,
    transport_id: String,
    producer_id: String,
    state: Tracked<ConsumerState>,
    own_paused: bool,
    producer_paused: bool,
}

impl ConsumerRecord {
    fn refresh_paused(&mut self) {
        let state = &mut self.state.current;
        state.paused = state.closed || self.own_paused || self.producer_paused;
    }
}

/// Which transport family a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportFamily {
    WebRtc,
    Plain,
    Pipe,
}

#[derive(Debug)]
struct Resources {
    worker_id: String,
    log: EventLog,
    publisher: mpsc::UnboundedSender<EventBox>,
    routers: HashMap<String, RouterRecord>,
    transports: HashMap<String, TransportRecord>,
    producers: HashMap<String, ProducerRecord>,
    consumers: HashMap<String, ConsumerRecord>,
    // Repeat-key registries, keyed by "<command-type>:<repeatKey>".
    router_keys: HashMap<String, String>,
    transport_keys: HashMap<String, String>,
    producer_keys: HashMap<String, String>,
    consumer_keys: HashMap<String, String>,
}

impl Resources {
    fn emit(&mut self, event: Event) {
        let kind = event.kind();
        let boxed = self.log.append(event);
        metrics::record_event(kind);
        debug!(
            target: "worker.executor",
            worker_id = %self.worker_id,
            seq = boxed.seq,
            kind = kind,
            "Event appended"
        );
        // The publisher is gone once the worker is closing; the log still
        // serves replays.
        let _ = self.publisher.send(boxed);
    }

    fn sync_router(&mut self, id: &str) {
        let Some(record) = self.routers.get_mut(id) else {
            return;
        };
        if let Some(state) = record.state.take_change() {
            let event = Event::Router {
                time: state.time,
                state,
                router_id: id.to_string(),
                worker_id: self.worker_id.clone(),
            };
            self.emit(event);
        }
    }

    fn sync_transport(&mut self, id: &str) {
        let Some(record) = self.transports.get_mut(id) else {
            return;
        };
        let transport_id = id.to_string();
        let router_id = record.router_id.clone();
        let worker_id = self.worker_id.clone();
        let event = match &mut record.state {
            TransportState::WebRtc(t) => t.take_change().map(|state| Event::WebRtcTransport {
                time: state.time,
                state,
                transport_id,
                router_id,
                worker_id,
            }),
            TransportState::Plain(t) => t.take_change().map(|state| Event::PlainTransport {
                time: state.time,
                state,
                transport_id,
                router_id,
                worker_id,
            }),
            TransportState::Pipe(t) => t.take_change().map(|state| Event::PipeTransport {
                time: state.time,
                state,
                transport_id,
                router_id,
                worker_id,
            }),
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn sync_producer(&mut self, id: &str) {
        let Some(record) = self.producers.get_mut(id) else {
            return;
        };
        if let Some(state) = record.state.take_change() {
            let event = Event::Producer {
                time: state.time,
                state,
                producer_id: id.to_string(),
                transport_id: record.transport_id.clone(),
                router_id: record.router_id.clone(),
                worker_id: self.worker_id.clone(),
            };
            self.emit(event);
        }
    }

    fn sync_consumer(&mut self, id: &str) {
        let Some(record) = self.consumers.get_mut(id) else {
            return;
        };
        if let Some(state) = record.state.take_change() {
            let event = Event::Consumer {
                time: state.time,
                state,
                consumer_id: id.to_string(),
                producer_id: record.producer_id.clone(),
                transport_id: record.transport_id.clone(),
                router_id: record.router_id.clone(),
                worker_id: self.worker_id.clone(),
            };
            self.emit(event);
        }
    }

    // Cascading close. Children are reported before their parent.

    fn close_consumer(&mut self, id: &str) {
        let Some(record) = self.consumers.get_mut(id) else {
            return;
        };
        if record.state.current.closed {
            return;
        }
        record.state.current.closed = true;
        record.refresh_paused();
        self.sync_consumer(id);
    }

    fn close_producer(&mut self, id: &str) {
        let consumers = match self.producers.get(id) {
            Some(record) if !record.state.current.closed => record.consumers.clone(),
            _ => return,
        };
        for consumer_id in &consumers {
            self.close_consumer(consumer_id);
        }
        if let Some(record) = self.producers.get_mut(id) {
            record.state.current.closed = true;
            record.state.current.paused = true;
        }
        self.sync_producer(id);
    }

    fn close_transport(&mut self, id: &str) {
        let (producers, consumers) = match self.transports.get(id) {
            Some(record) if !record.closed() => {
                (record.producers.clone(), record.consumers.clone())
            }
            _ => return,
        };
        for producer_id in &producers {
            self.close_producer(producer_id);
        }
        for consumer_id in &consumers {
            self.close_consumer(consumer_id);
        }
        if let Some(record) = self.transports.get_mut(id) {
            record.mark_closed();
        }
        self.sync_transport(id);
    }

    fn close_router(&mut self, id: &str) {
        let transports = match self.routers.get(id) {
            Some(record) if !record.state.current.closed => record.transports.clone(),
            _ => return,
        };
        for transport_id in &transports {
            self.close_transport(transport_id);
        }
        if let Some(record) = self.routers.get_mut(id) {
            record.state.current.closed = true;
        }
        self.sync_router(id);
    }

    // Lookups

    fn router_snapshot(&self, id: &str) -> Result<RouterState, CommandError> {
        self.routers
            .get(id)
            .map(|r| r.state.snapshot())
            .ok_or_else(|| CommandError::not_found("router", id))
    }

    fn webrtc_snapshot(&self, id: &str) -> Result<WebRtcTransportState, CommandError> {
        self.transports
            .get(id)
            .and_then(TransportRecord::webrtc)
            .map(Tracked::snapshot)
            .ok_or_else(|| CommandError::not_found("transport", id))
    }

    fn plain_snapshot(&self, id: &str) -> Result<PlainTransportState, CommandError> {
        self.transports
            .get(id)
            .and_then(TransportRecord::plain)
            .map(Tracked::snapshot)
            .ok_or_else(|| CommandError::not_found("transport", id))
    }

    fn pipe_snapshot(&self, id: &str) -> Result<PipeTransportState, CommandError> {
        self.transports
            .get(id)
            .and_then(TransportRecord::pipe)
            .map(Tracked::snapshot)
            .ok_or_else(|| CommandError::not_found("transport", id))
    }

    fn producer_snapshot(&self, id: &str) -> Result<ProducerState, CommandError> {
        self.producers
            .get(id)
            .map(|p| p.state.snapshot())
            .ok_or_else(|| CommandError::not_found("producer", id))
    }

    fn consumer_snapshot(&self, id: &str) -> Result<ConsumerState, CommandError> {
        self.consumers
            .get(id)
            .map(|c| c.state.snapshot())
            .ok_or_else(|| CommandError::not_found("consumer", id))
    }

    /// Transport of the given family, or `NotFound`.
    fn transport(&self, id: &str, family: TransportFamily) -> Result<&TransportRecord, CommandError> {
        self.transports
            .get(id)
            .filter(|t| match family {
                TransportFamily::WebRtc => t.webrtc().is_some(),
                TransportFamily::Plain => t.plain().is_some(),
                TransportFamily::Pipe => t.pipe().is_some(),
            })
            .ok_or_else(|| CommandError::not_found("transport", id))
    }

    /// Router that exists and is open, for creating children.
    fn open_router(&self, id: &str) -> Result<(), CommandError> {
        match self.routers.get(id) {
            None => Err(CommandError::not_found("router", id)),
            Some(r) if r.state.current.closed => Err(CommandError::AlreadyClosed("Router")),
            Some(_) => Ok(()),
        }
    }

    fn open_transport(&self, id: &str) -> Result<(), CommandError> {
        match self.transports.get(id) {
            None => Err(CommandError::not_found("transport", id)),
            Some(t) if t.closed() => Err(CommandError::AlreadyClosed("Transport")),
            Some(_) => Ok(()),
        }
    }

    fn open_producer(&self, id: &str) -> Result<(), CommandError> {
        match self.producers.get(id) {
            None => Err(CommandError::not_found("producer", id)),
            Some(p) if p.state.current.closed => Err(CommandError::AlreadyClosed("Producer")),
            Some(_) => Ok(()),
        }
    }

    fn register_transport(&mut self, key: &str, router_id: &str, id: &str, state: TransportState) {
        if let Some(router) = self.routers.get_mut(router_id) {
            router.transports.insert(id.to_string());
        }
        self.transports.insert(
            id.to_string(),
            TransportRecord {
                router_id: router_id.to_string(),
                state,
                producers: BTreeSet::new(),
                consumers: BTreeSet::new(),
                connect_called: false,
            },
        );
        self.transport_keys.insert(key.to_string(), id.to_string());
        self.sync_transport(id);
    }
}

fn webrtc_state(info: WebRtcTransportInfo, app_data: SimpleMap) -> WebRtcTransportState {
    WebRtcTransportState {
        id: info.id,
        closed: false,
        app_data,
        dtls_parameters: info.dtls_parameters,
        dtls_state: info.dtls_state,
        ice_parameters: info.ice_parameters,
        ice_candidates: info.ice_candidates,
        ice_state: info.ice_state,
        time: 0,
    }
}

fn plain_state(info: PlainTransportInfo, app_data: SimpleMap) -> PlainTransportState {
    PlainTransportState {
        id: info.id,
        closed: false,
        app_data,
        tuple: info.tuple,
        rtcp_tuple: info.rtcp_tuple,
        sctp_parameters: info.sctp_parameters,
        sctp_state: info.sctp_state,
        srtp_parameters: info.srtp_parameters,
        time: 0,
    }
}

fn pipe_state(info: PipeTransportInfo, app_data: SimpleMap) -> PipeTransportState {
    PipeTransportState {
        id: info.id,
        closed: false,
        app_data,
        tuple: info.tuple,
        sctp_parameters: info.sctp_parameters,
        sctp_state: info.sctp_state,
        srtp_parameters: info.srtp_parameters,
        time: 0,
    }
}

/// Authoritative resource maps of one worker plus the engine they mirror.
pub struct WorkerExecutor {
    worker_id: String,
    engine: Arc<dyn MediaEngine>,
    resources: Mutex<Resources>,
}

impl std::fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl WorkerExecutor {
    /// Create an executor. Appended events are also sent, in seq order, on
    /// the returned channel for live publication.
    #[must_use]
    pub fn new(
        worker_id: &str,
        engine: Arc<dyn MediaEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<EventBox>) {
        let (publisher, events) = mpsc::unbounded_channel();
        let executor = Self {
            worker_id: worker_id.to_string(),
            engine,
            resources: Mutex::new(Resources {
                worker_id: worker_id.to_string(),
                log: EventLog::new(),
                publisher,
                routers: HashMap::new(),
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
                router_keys: HashMap::new(),
                transport_keys: HashMap::new(),
                producer_keys: HashMap::new(),
                consumer_keys: HashMap::new(),
            }),
        };
        (executor, events)
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Worker
    // ========================================================================

    #[must_use]
    pub fn current_seq(&self) -> u64 {
        self.resources().log.current_seq()
    }

    #[must_use]
    pub fn events_since(&self, seq: u64, batch_size: u64) -> GetEventsResponse {
        self.resources().log.since(seq, batch_size)
    }

    /// Whether a create with this lock key has already succeeded.
    #[must_use]
    pub fn is_replay(&self, key: &str) -> bool {
        let resources = self.resources();
        resources.router_keys.contains_key(key)
            || resources.transport_keys.contains_key(key)
            || resources.producer_keys.contains_key(key)
            || resources.consumer_keys.contains_key(key)
    }

    // ========================================================================
    // Routers
    // ========================================================================

    /// Create a router, or return the router already created under `key`.
    ///
    /// # Errors
    ///
    /// `Unknown` with the engine message if the engine rejects the router.
    pub async fn create_router(
        &self,
        key: &str,
        args: RouterCreateArgs,
    ) -> Result<RouterState, CommandError> {
        {
            let resources = self.resources();
            if let Some(id) = resources.router_keys.get(key) {
                return resources.router_snapshot(id);
            }
        }

        let id = self.engine.create_router(&args.media_codecs).await?;

        let mut resources = self.resources();
        resources.routers.insert(
            id.clone(),
            RouterRecord {
                state: Tracked::new(RouterState {
                    id: id.clone(),
                    closed: false,
                    app_data: args.app_data.unwrap_or_default(),
                    time: 0,
                }),
                transports: BTreeSet::new(),
            },
        );
        resources.router_keys.insert(key.to_string(), id.clone());
        resources.sync_router(&id);
        resources.router_snapshot(&id)
    }

    /// Close a router and everything under it. Closing a closed router
    /// returns its state.
    ///
    /// # Errors
    ///
    /// `NotFound` if the router is unknown.
    pub async fn close_router(&self, id: &str) -> Result<RouterState, CommandError> {
        let state = {
            let mut resources = self.resources();
            let state = resources.router_snapshot(id)?;
            if state.closed {
                return Ok(state);
            }
            resources.close_router(id);
            resources.router_snapshot(id)?
        };

        if let Err(e) = self.engine.close_router(id).await {
            warn!(target: "worker.executor", router_id = %id, error = %e, "Engine router close failed");
        }
        Ok(state)
    }

    // ========================================================================
    // Transports
    // ========================================================================

    /// Create a WebRTC transport on `router_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` / `AlreadyClosed` for the router, `Unknown` from the engine.
    pub async fn create_webrtc_transport(
        &self,
        key: &str,
        router_id: &str,
        args: WebRtcTransportCreateArgs,
    ) -> Result<WebRtcTransportState, CommandError> {
        {
            let resources = self.resources();
            if let Some(id) = resources.transport_keys.get(key) {
                return resources.webrtc_snapshot(id);
            }
            resources.open_router(router_id)?;
        }

        let info = self.engine.create_webrtc_transport(router_id, &args).await?;
        let id = info.id.clone();
        let state = webrtc_state(info, args.app_data.unwrap_or_default());

        let registered = {
            let mut resources = self.resources();
            match resources.open_router(router_id) {
                Ok(()) => {
                    resources.register_transport(
                        key,
                        router_id,
                        &id,
                        TransportState::WebRtc(Tracked::new(state)),
                    );
                    resources.webrtc_snapshot(&id)
                }
                Err(e) => Err(e),
            }
        };
        if registered.is_err() {
            self.release_transport(&id).await;
        }
        registered
    }

    /// Create a plain transport on `router_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` / `AlreadyClosed` for the router, `Unknown` from the engine.
    pub async fn create_plain_transport(
        &self,
        key: &str,
        router_id: &str,
        args: PlainTransportCreateArgs,
    ) -> Result<PlainTransportState, CommandError> {
        {
            let resources = self.resources();
            if let Some(id) = resources.transport_keys.get(key) {
                return resources.plain_snapshot(id);
            }
            resources.open_router(router_id)?;
        }

        let info = self.engine.create_plain_transport(router_id, &args).await?;
        let id = info.id.clone();
        let state = plain_state(info, args.app_data.unwrap_or_default());

        let registered = {
            let mut resources = self.resources();
            match resources.open_router(router_id) {
                Ok(()) => {
                    resources.register_transport(
                        key,
                        router_id,
                        &id,
                        TransportState::Plain(Tracked::new(state)),
                    );
                    resources.plain_snapshot(&id)
                }
                Err(e) => Err(e),
            }
        };
        if registered.is_err() {
            self.release_transport(&id).await;
        }
        registered
    }

    /// Create a pipe transport on `router_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` / `AlreadyClosed` for the router, `Unknown` from the engine.
    pub async fn create_pipe_transport(
        &self,
        key: &str,
        router_id: &str,
        args: PipeTransportCreateArgs,
    ) -> Result<PipeTransportState, CommandError> {
        {
            let resources = self.resources();
            if let Some(id) = resources.transport_keys.get(key) {
                return resources.pipe_snapshot(id);
            }
            resources.open_router(router_id)?;
        }

        let info = self.engine.create_pipe_transport(router_id, &args).await?;
        let id = info.id.clone();
        let state = pipe_state(info, args.app_data.unwrap_or_default());

        let registered = {
            let mut resources = self.resources();
            match resources.open_router(router_id) {
                Ok(()) => {
                    resources.register_transport(
                        key,
                        router_id,
                        &id,
                        TransportState::Pipe(Tracked::new(state)),
                    );
                    resources.pipe_snapshot(&id)
                }
                Err(e) => Err(e),
            }
        };
        if registered.is_err() {
            self.release_transport(&id).await;
        }
        registered
    }

    async fn release_transport(&self, id: &str) {
        debug!(target: "worker.executor", transport_id = %id, "Parent closed during create, releasing transport");
        if let Err(e) = self.engine.close_transport(id).await {
            warn!(target: "worker.executor", transport_id = %id, error = %e, "Engine transport release failed");
        }
    }

    /// Connect a WebRTC transport. The engine sees at most one connect per
    /// transport; later calls return the current state.
    ///
    /// # Errors
    ///
    /// `NotFound` if unknown, `Unknown` from the engine.
    pub async fn connect_webrtc_transport(
        &self,
        args: WebRtcTransportConnectArgs,
    ) -> Result<WebRtcTransportState, CommandError> {
        let id = args.id.as_str();
        {
            let mut resources = self.resources();
            resources.transport(id, TransportFamily::WebRtc)?;
            let Some(record) = resources.transports.get_mut(id) else {
                return Err(CommandError::not_found("transport", id));
            };
            if record.closed() || record.connect_called {
                return resources.webrtc_snapshot(id);
            }
            record.connect_called = true;
        }

        let result = self
            .engine
            .connect_webrtc_transport(id, &args.dtls_parameters)
            .await;

        let mut resources = self.resources();
        let Some(record) = resources.transports.get_mut(id) else {
            return Err(CommandError::not_found("transport", id));
        };
        match result {
            Ok(info) => {
                if !record.closed() {
                    if let Some(t) = record.webrtc_mut() {
                        t.current.ice_state = info.ice_state;
                        t.current.dtls_state = info.dtls_state;
                    }
                    resources.sync_transport(id);
                }
                resources.webrtc_snapshot(id)
            }
            Err(e) => {
                record.connect_called = false;
                Err(e.into())
            }
        }
    }

    /// Restart ICE on a WebRTC transport. A closed transport returns its state.
    ///
    /// # Errors
    ///
    /// `NotFound` if unknown, `Unknown` from the engine.
    pub async fn restart_ice(&self, id: &str) -> Result<WebRtcTransportState, CommandError> {
        {
            let resources = self.resources();
            if resources.transport(id, TransportFamily::WebRtc)?.closed() {
                return resources.webrtc_snapshot(id);
            }
        }

        let ice_parameters = self.engine.restart_ice(id).await?;

        let mut resources = self.resources();
        if let Some(record) = resources.transports.get_mut(id) {
            if !record.closed() {
                if let Some(t) = record.webrtc_mut() {
                    t.current.ice_parameters = ice_parameters;
                }
            }
        }
        resources.sync_transport(id);
        resources.webrtc_snapshot(id)
    }

    /// Set the remote endpoint of a plain transport.
    ///
    /// # Errors
    ///
    /// `NotFound` if unknown, `Unknown` from the engine.
    pub async fn connect_plain_transport(
        &self,
        args: PlainTransportConnectArgs,
    ) -> Result<PlainTransportState, CommandError> {
        {
            let resources = self.resources();
            if resources.transport(&args.id, TransportFamily::Plain)?.closed() {
                return resources.plain_snapshot(&args.id);
            }
        }

        let info = self.engine.connect_plain_transport(&args).await?;

        let mut resources = self.resources();
        if let Some(record) = resources.transports.get_mut(&args.id) {
            if !record.closed() {
                if let Some(t) = record.plain_mut() {
                    t.current.tuple = info.tuple;
                    t.current.rtcp_tuple = info.rtcp_tuple;
                    t.current.sctp_state = info.sctp_state;
                    t.current.srtp_parameters = info.srtp_parameters;
                }
            }
        }
        resources.sync_transport(&args.id);
        resources.plain_snapshot(&args.id)
    }

    /// Set the remote endpoint of a pipe transport.
    ///
    /// # Errors
    ///
    /// `NotFound` if unknown, `Unknown` from the engine.
    pub async fn connect_pipe_transport(
        &self,
        args: PipeTransportConnectArgs,
    ) -> Result<PipeTransportState, CommandError> {
        {
            let resources = self.resources();
            if resources.transport(&args.id, TransportFamily::Pipe)?.closed() {
                return resources.pipe_snapshot(&args.id);
            }
        }

        let info = self.engine.connect_pipe_transport(&args).await?;

        let mut resources = self.resources();
        if let Some(record) = resources.transports.get_mut(&args.id) {
            if !record.closed() {
                if let Some(t) = record.pipe_mut() {
                    t.current.tuple = info.tuple;
                    t.current.sctp_state = info.sctp_state;
                    t.current.srtp_parameters = info.srtp_parameters;
                }
            }
        }
        resources.sync_transport(&args.id);
        resources.pipe_snapshot(&args.id)
    }

    async fn close_transport(&self, id: &str, family: TransportFamily) -> Result<(), CommandError> {
        {
            let mut resources = self.resources();
            if resources.transport(id, family)?.closed() {
                return Ok(());
            }
            resources.close_transport(id);
        }
        if let Err(e) = self.engine.close_transport(id).await {
            warn!(target: "worker.executor", transport_id = %id, error = %e, "Engine transport close failed");
        }
        Ok(())
    }

    /// # Errors
    ///
    /// `NotFound` if unknown.
    pub async fn close_webrtc_transport(
        &self,
        id: &str,
    ) -> Result<WebRtcTransportState, CommandError> {
        self.close_transport(id, TransportFamily::WebRtc).await?;
        self.resources().webrtc_snapshot(id)
    }

    /// # Errors
    ///
    /// `NotFound` if unknown.
    pub async fn close_plain_transport(&self, id: &str) -> Result<PlainTransportState, CommandError> {
        self.close_transport(id, TransportFamily::Plain).await?;
        self.resources().plain_snapshot(id)
    }

    /// # Errors
    ///
    /// `NotFound` if unknown.
    pub async fn close_pipe_transport(&self, id: &str) -> Result<PipeTransportState, CommandError> {
        self.close_transport(id, TransportFamily::Pipe).await?;
        self.resources().pipe_snapshot(id)
    }

    // ========================================================================
    // Producers
    // ========================================================================

    /// Start producing on a transport.
    ///
    /// # Errors
    ///
    /// `NotFound` / `AlreadyClosed` for the transport, `Unknown` from the
    /// engine.
    pub async fn produce(
        &self,
        key: &str,
        transport_id: &str,
        args: ProduceArgs,
    ) -> Result<ProducerState, CommandError> {
        {
            let resources = self.resources();
            if let Some(id) = resources.producer_keys.get(key) {
                return resources.producer_snapshot(id);
            }
            resources.open_transport(transport_id)?;
        }

        let info = self.engine.produce(transport_id, &args).await?;
        let id = info.id.clone();

        let registered = {
            let mut resources = self.resources();
            match resources.open_transport(transport_id) {
                Ok(()) => {
                    let router_id = resources
                        .transports
                        .get_mut(transport_id)
                        .map(|t| {
                            t.producers.insert(id.clone());
                            t.router_id.clone()
                        })
                        .unwrap_or_default();
                    resources.producers.insert(
                        id.clone(),
                        ProducerRecord {
                            router_id,
                            transport_id: transport_id.to_string(),
                            state: Tracked::new(ProducerState {
                                id: id.clone(),
                                closed: false,
                                app_data: args.app_data.unwrap_or_default(),
                                paused: info.paused,
                                rtp_parameters: info.rtp_parameters,
                                producer_type: info.producer_type,
                                kind: info.kind,
                                time: 0,
                            }),
                            consumers: BTreeSet::new(),
                        },
                    );
                    resources.producer_keys.insert(key.to_string(), id.clone());
                    resources.sync_producer(&id);
                    resources.producer_snapshot(&id)
                }
                Err(e) => Err(e),
            }
        };
        if registered.is_err() {
            if let Err(e) = self.engine.close_producer(&id).await {
                warn!(target: "worker.executor", producer_id = %id, error = %e, "Engine producer release failed");
            }
        }
        registered
    }

    async fn set_producer_paused(&self, id: &str, paused: bool) -> Result<ProducerState, CommandError> {
        {
            let resources = self.resources();
            let state = resources.producer_snapshot(id)?;
            if state.closed {
                return Ok(state);
            }
        }

        if paused {
            self.engine.pause_producer(id).await?;
        } else {
            self.engine.resume_producer(id).await?;
        }

        let mut resources = self.resources();
        if let Some(record) = resources.producers.get_mut(id) {
            if !record.state.current.closed {
                record.state.current.paused = paused;
            }
        }
        resources.sync_producer(id);
        resources.producer_snapshot(id)
    }

    /// # Errors
    ///
    /// `NotFound` if unknown, `Unknown` from the engine.
    pub async fn pause_producer(&self, id: &str) -> Result<ProducerState, CommandError> {
        self.set_producer_paused(id, true).await
    }

    /// # Errors
    ///
    /// `NotFound` if unknown, `Unknown` from the engine.
    pub async fn resume_producer(&self, id: &str) -> Result<ProducerState, CommandError> {
        self.set_producer_paused(id, false).await
    }

    /// Close a producer and its consumers.
    ///
    /// # Errors
    ///
    /// `NotFound` if unknown.
    pub async fn close_producer(&self, id: &str) -> Result<ProducerState, CommandError> {
        {
            let mut resources = self.resources();
            let state = resources.producer_snapshot(id)?;
            if state.closed {
                return Ok(state);
            }
            resources.close_producer(id);
        }
        if let Err(e) = self.engine.close_producer(id).await {
            warn!(target: "worker.executor", producer_id = %id, error = %e, "Engine producer close failed");
        }
        self.resources().producer_snapshot(id)
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    /// Consume `producer_id` on `transport_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` / `AlreadyClosed` for the transport or producer, `Unknown`
    /// from the engine.
    pub async fn consume(
        &self,
        key: &str,
        transport_id: &str,
        producer_id: &str,
        args: ConsumeArgs,
    ) -> Result<ConsumerState, CommandError> {
        {
            let resources = self.resources();
            if let Some(id) = resources.consumer_keys.get(key) {
                return resources.consumer_snapshot(id);
            }
            resources.open_transport(transport_id)?;
            resources.open_producer(producer_id)?;
        }

        let info = self.engine.consume(transport_id, producer_id, &args).await?;
        let id = info.id.clone();

        let registered = {
            let mut resources = self.resources();
            match resources
                .open_transport(transport_id)
                .and_then(|()| resources.open_producer(producer_id))
            {
                Ok(()) => {
                    let router_id = resources
                        .transports
                        .get_mut(transport_id)
                        .map(|t| {
                            t.consumers.insert(id.clone());
                            t.router_id.clone()
                        })
                        .unwrap_or_default();
                    if let Some(producer) = resources.producers.get_mut(producer_id) {
                        producer.consumers.insert(id.clone());
                    }
                    let mut record = ConsumerRecord {
                        router_id,
                        transport_id: transport_id.to_string(),
                        producer_id: producer_id.to_string(),
                        state: Tracked::new(ConsumerState {
                            id: id.clone(),
                            closed: false,
                            app_data: args.app_data.unwrap_or_default(),
                            paused: info.paused,
                            rtp_parameters: info.rtp_parameters,
                            consumer_type: info.consumer_type,
                            kind: info.kind,
                            time: 0,
                        }),
                        own_paused: info.paused,
                        producer_paused: info.producer_paused,
                    };
                    record.refresh_paused();
                    resources.consumers.insert(id.clone(), record);
                    resources.consumer_keys.insert(key.to_string(), id.clone());
                    resources.sync_consumer(&id);
                    resources.consumer_snapshot(&id)
                }
                Err(e) => Err(e),
            }
        };
        if registered.is_err() {
            if let Err(e) = self.engine.close_consumer(&id).await {
                warn!(target: "worker.executor", consumer_id = %id, error = %e, "Engine consumer release failed");
            }
        }
        registered
    }

    async fn set_consumer_paused(&self, id: &str, paused: bool) -> Result<ConsumerState, CommandError> {
        {
            let resources = self.resources();
            let state = resources.consumer_snapshot(id)?;
            if state.closed {
                return Ok(state);
            }
        }

        if paused {
            self.engine.pause_consumer(id).await?;
        } else {
            self.engine.resume_consumer(id).await?;
        }

        let mut resources = self.resources();
        if let Some(record) = resources.consumers.get_mut(id) {
            if !record.state.current.closed {
                record.own_paused = paused;
                record.refresh_paused();
            }
        }
        resources.sync_consumer(id);
        resources.consumer_snapshot(id)
    }

    /// # Errors
    ///
    /// `NotFound` if unknown, `Unknown` from the engine.
    pub async fn pause_consumer(&self, id: &str) -> Result<ConsumerState, CommandError> {
        self.set_consumer_paused(id, true).await
    }

    /// # Errors
    ///
    /// `NotFound` if unknown, `Unknown` from the engine.
    pub async fn resume_consumer(&self, id: &str) -> Result<ConsumerState, CommandError> {
        self.set_consumer_paused(id, false).await
    }

    /// # Errors
    ///
    /// `NotFound` if unknown.
    pub async fn close_consumer(&self, id: &str) -> Result<ConsumerState, CommandError> {
        {
            let mut resources = self.resources();
            let state = resources.consumer_snapshot(id)?;
            if state.closed {
                return Ok(state);
            }
            resources.close_consumer(id);
        }
        if let Err(e) = self.engine.close_consumer(id).await {
            warn!(target: "worker.executor", consumer_id = %id, error = %e, "Engine consumer close failed");
        }
        self.resources().consumer_snapshot(id)
    }

    // ========================================================================
    // Stats
    // ========================================================================

    /// Opaque engine statistics for a transport, producer or consumer.
    /// Closed resources have none.
    ///
    /// # Errors
    ///
    /// `NotFound` if no resource has this id, `Unknown` from the engine.
    pub async fn get_stats(&self, id: &str) -> Result<StatsResponse, CommandError> {
        let closed = {
            let resources = self.resources();
            if let Some(t) = resources.transports.get(id) {
                t.closed()
            } else if let Some(p) = resources.producers.get(id) {
                p.state.current.closed
            } else if let Some(c) = resources.consumers.get(id) {
                c.state.current.closed
            } else {
                return Err(CommandError::not_found("resource", id));
            }
        };
        if closed {
            return Ok(StatsResponse { data: None });
        }

        let stats = self.engine.get_stats(id).await?;
        Ok(StatsResponse {
            data: stats.map(|value| value.to_string()),
        })
    }

    // ========================================================================
    // Engine notifications
    // ========================================================================

    /// Apply a change the engine originated. `Died` is handled by the worker.
    pub fn handle_notification(&self, notification: &EngineNotification) {
        let mut resources = self.resources();
        match notification {
            EngineNotification::WebRtcTransportState {
                transport_id,
                ice_state,
                dtls_state,
            } => {
                if let Some(record) = resources.transports.get_mut(transport_id) {
                    if !record.closed() {
                        if let Some(t) = record.webrtc_mut() {
                            t.current.ice_state = *ice_state;
                            t.current.dtls_state = *dtls_state;
                        }
                    }
                }
                resources.sync_transport(transport_id);
            }
            EngineNotification::ProducerClosed { producer_id } => {
                resources.close_producer(producer_id);
            }
            EngineNotification::ConsumerClosed { consumer_id } => {
                resources.close_consumer(consumer_id);
            }
            EngineNotification::ConsumerProducerPaused {
                consumer_id,
                producer_paused,
            } => {
                if let Some(record) = resources.consumers.get_mut(consumer_id) {
                    if !record.state.current.closed {
                        record.producer_paused = *producer_paused;
                        record.refresh_paused();
                    }
                }
                resources.sync_consumer(consumer_id);
            }
            EngineNotification::Died { .. } => {}
        }
    }
}
