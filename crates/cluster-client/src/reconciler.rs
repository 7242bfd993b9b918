//! Ordered, exactly-once event delivery for one worker.
//!
//! Live events arrive at most once and in any order. The reconciler turns
//! them into a gapless stream using the worker's replayable event log:
//!
//! 1. Subscribe to `<root>.<workerId>.events` and buffer everything.
//! 2. Fetch the worker's current seq (`worker-state`, retried with backoff).
//!    That is the baseline: buffered events at or below it are dropped.
//! 3. Deliver `baseline + 1`, `baseline + 2`, ... as they become contiguous.
//!    Whenever a later seq is buffered with a hole in front of it, pull the
//!    missing range with `worker-events` until the log reports nothing more.
//! 4. A buffered seq the log still does not contain after two consecutive
//!    complete backfills was never logged by the worker and is discarded.
//!    Every event is appended before it is published, so a genuine event
//!    received before one backfill reply is always in the next one.
//!
//! [`SequenceBuffer`] holds the ordering logic and is fully synchronous; the
//! async driver [`run_reconciler`] owns the subscription and the requests.

use crate::api::WorkerApi;
use common::backoff::{self, Backoff};
use common::bus::Subscription;
use common::wire::commands::GetEventsResponse;
use common::wire::{Event, EventBox};
use futures::future::{BoxFuture, FutureExt, OptionFuture};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Reorder buffer for one worker's event stream.
#[derive(Debug, Default)]
pub struct SequenceBuffer {
    /// Last delivered seq. `None` until the baseline is known.
    seq: Option<u64>,
    pending: BTreeMap<u64, Event>,
}

impl SequenceBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last delivered seq, once the baseline is known.
    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    /// Number of buffered, undelivered events.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether buffered events are waiting behind a missing seq.
    #[must_use]
    pub fn has_gap(&self) -> bool {
        self.seq.is_some() && !self.pending.is_empty()
    }

    /// Establish the baseline. Later calls are ignored.
    ///
    /// Returns the buffered events that are now deliverable.
    pub fn set_baseline(&mut self, seq: u64) -> Vec<EventBox> {
        if self.seq.is_some() {
            return Vec::new();
        }
        self.seq = Some(seq);
        self.drain()
    }

    /// Accept one live event. Returns the events now deliverable, in order.
    ///
    /// Before the baseline is known every event is buffered. Afterwards
    /// stale and duplicate seqs are dropped.
    pub fn offer(&mut self, seq: u64, event: Event) -> Vec<EventBox> {
        match self.seq {
            Some(current) if seq <= current => Vec::new(),
            _ => {
                self.pending.insert(seq, event);
                self.drain()
            }
        }
    }

    /// Merge a backfill batch that starts right after `from_seq`.
    pub fn merge(&mut self, from_seq: u64, events: Vec<Event>) -> Vec<EventBox> {
        let current = self.seq.unwrap_or(0);
        for (seq, event) in (from_seq + 1..).zip(events) {
            if seq > current {
                self.pending.entry(seq).or_insert(event);
            }
        }
        self.drain()
    }

    /// Buffered seqs above `log_seq`.
    #[must_use]
    pub fn beyond(&self, log_seq: u64) -> Vec<u64> {
        self.pending
            .range(log_seq.saturating_add(1)..)
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// Drop those of `seqs` that are still above `log_seq`. Returns how
    /// many were dropped.
    pub fn discard(&mut self, seqs: &[u64], log_seq: u64) -> usize {
        let mut dropped = 0;
        for seq in seqs.iter().filter(|seq| **seq > log_seq) {
            if self.pending.remove(seq).is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    fn drain(&mut self) -> Vec<EventBox> {
        let Some(mut current) = self.seq else {
            return Vec::new();
        };

        // Anything at or below the cursor is stale
        self.pending = self.pending.split_off(&(current + 1));

        let mut ready = Vec::new();
        while let Some(event) = self.pending.remove(&(current + 1)) {
            current += 1;
            ready.push(EventBox { seq: current, event });
        }
        self.seq = Some(current);
        ready
    }
}

/// Fetch the baseline seq, retrying until it succeeds or `cancel` fires.
async fn fetch_baseline(api: WorkerApi, cancel: CancellationToken) -> Option<u64> {
    backoff::retry("fetch worker state", &cancel, None, || api.get_state())
        .await
        .map(|state| state.seq)
}

/// Fetch one backfill batch after `seq`, retrying until it succeeds.
async fn fetch_batch(
    api: WorkerApi,
    seq: u64,
    batch_size: u64,
    delay: Duration,
    cancel: CancellationToken,
) -> Option<GetEventsResponse> {
    if !delay.is_zero() {
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }
    }
    backoff::retry("fetch worker events", &cancel, None, || {
        api.get_events(seq, batch_size)
    })
    .await
}

/// Run the reconciler for one worker until `cancel` fires or the
/// subscription ends, handing each event to `deliver` exactly once and in
/// seq order.
///
/// `subscription` must already be subscribed to the worker's events topic
/// so nothing published after the baseline fetch starts is missed.
#[instrument(skip_all, name = "client.reconciler", fields(worker_id = %api.worker_id()))]
pub async fn run_reconciler<F>(
    api: WorkerApi,
    mut subscription: Subscription,
    batch_size: u64,
    cancel: CancellationToken,
    mut deliver: F,
) where
    F: FnMut(EventBox) + Send,
{
    let mut buffer = SequenceBuffer::new();
    let mut emit = |ready: Vec<EventBox>| {
        for event_box in ready {
            deliver(event_box);
        }
    };

    let mut baseline: Option<BoxFuture<'static, Option<u64>>> =
        Some(fetch_baseline(api.clone(), cancel.clone()).boxed());

    // Set while a gap is being filled; cleared once the log has nothing more
    // and no gap remains.
    let mut backfilling = false;
    let mut backfill: Option<(u64, BoxFuture<'static, Option<GetEventsResponse>>)> = None;
    // Seqs above the log after the last complete backfill
    let mut suspects: Vec<u64> = Vec::new();
    // Paces backfills that end with the gap still open
    let mut idle = Backoff::default();
    let mut delay = Duration::ZERO;

    loop {
        if backfill.is_none() {
            if let Some(from) = buffer.seq().filter(|_| backfilling || buffer.has_gap()) {
                backfilling = true;
                debug!(target: "client.reconciler", from, "Backfilling events");
                backfill = Some((
                    from,
                    fetch_batch(api.clone(), from, batch_size, delay, cancel.clone()).boxed(),
                ));
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,

            message = subscription.recv() => {
                let Some(message) = message else {
                    warn!(target: "client.reconciler", "Event subscription ended");
                    break;
                };
                match serde_json::from_slice::<EventBox>(&message.payload) {
                    Ok(event_box) => emit(buffer.offer(event_box.seq, event_box.event)),
                    Err(e) => {
                        debug!(target: "client.reconciler", error = %e, "Discarding undecodable event");
                    }
                }
            }

            Some(seq) = OptionFuture::from(baseline.as_mut()), if baseline.is_some() => {
                baseline = None;
                let Some(seq) = seq else { break };
                debug!(target: "client.reconciler", seq, "Event baseline established");
                emit(buffer.set_baseline(seq));
            }

            Some(batch) = OptionFuture::from(backfill.as_mut().map(|(_, f)| f)), if backfill.is_some() => {
                let from = backfill.take().map_or(0, |(from, _)| from);
                let Some(batch) = batch else { break };
                let has_more = batch.has_more;
                let log_seq = batch.seq;
                emit(buffer.merge(from, batch.events));

                if !has_more && buffer.has_gap() {
                    let dropped = buffer.discard(&suspects, log_seq);
                    if dropped > 0 {
                        debug!(
                            target: "client.reconciler",
                            dropped,
                            log_seq,
                            "Discarding events the worker never logged"
                        );
                    }
                    suspects = buffer.beyond(log_seq);
                } else {
                    suspects.clear();
                }

                backfilling = has_more || buffer.has_gap();
                delay = if backfilling && !has_more {
                    idle.next_delay()
                } else {
                    idle = Backoff::default();
                    Duration::ZERO
                };
                if !backfilling {
                    debug!(target: "client.reconciler", seq = ?buffer.seq(), "Backfill complete");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::bus::{Bus, MemoryBus};
    use common::types::SimpleMap;
    use common::wire::commands::{CommandBox, CommandReply, GetStateResponse};
    use common::wire::{Command, RouterState};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn event(n: u64) -> Event {
        Event::Router {
            state: RouterState {
                id: format!("r{n}"),
                closed: false,
                app_data: SimpleMap::new(),
                time: n,
            },
            router_id: format!("r{n}"),
            worker_id: "w1".to_string(),
            time: n,
        }
    }

    fn seqs(boxes: &[EventBox]) -> Vec<u64> {
        boxes.iter().map(|b| b.seq).collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buffer = SequenceBuffer::new();
        assert!(buffer.set_baseline(0).is_empty());
        assert_eq!(seqs(&buffer.offer(1, event(1))), vec![1]);
        assert_eq!(seqs(&buffer.offer(2, event(2))), vec![2]);
        assert_eq!(buffer.seq(), Some(2));
    }

    #[test]
    fn test_events_before_baseline_are_buffered() {
        let mut buffer = SequenceBuffer::new();
        assert!(buffer.offer(5, event(5)).is_empty());
        assert!(buffer.offer(6, event(6)).is_empty());
        assert!(!buffer.has_gap());

        // Baseline 5: seq 5 is already reflected, 6 is next
        assert_eq!(seqs(&buffer.set_baseline(5)), vec![6]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_gap_is_filled_by_merge() {
        let mut buffer = SequenceBuffer::new();
        buffer.set_baseline(0);
        assert_eq!(seqs(&buffer.offer(1, event(1))), vec![1]);
        assert!(buffer.offer(4, event(4)).is_empty());
        assert!(buffer.has_gap());

        let ready = buffer.merge(1, vec![event(2), event(3), event(4)]);
        assert_eq!(seqs(&ready), vec![2, 3, 4]);
        assert!(!buffer.has_gap());
    }

    #[test]
    fn test_duplicates_and_stale_are_dropped() {
        let mut buffer = SequenceBuffer::new();
        buffer.set_baseline(3);
        assert!(buffer.offer(2, event(2)).is_empty());
        assert!(buffer.offer(3, event(3)).is_empty());
        assert_eq!(seqs(&buffer.offer(4, event(4))), vec![4]);
        assert!(buffer.offer(4, event(4)).is_empty());
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_zero_batch_size_merge_is_harmless() {
        let mut buffer = SequenceBuffer::new();
        buffer.set_baseline(2);
        assert!(buffer.merge(2, Vec::new()).is_empty());
        assert_eq!(buffer.seq(), Some(2));
    }

    #[test]
    fn test_any_permutation_delivers_gapless_sequence() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let total: u64 = rng.gen_range(1..40);
            let mut arrivals: Vec<u64> = (1..=total).collect();
            // Duplicate a few
            for _ in 0..rng.gen_range(0..5) {
                arrivals.push(rng.gen_range(1..=total));
            }
            arrivals.shuffle(&mut rng);
            // Drop a few; they come back through merge
            let dropped: Vec<u64> = arrivals
                .iter()
                .copied()
                .filter(|_| rng.gen_bool(0.2))
                .collect();
            arrivals.retain(|s| !dropped.contains(s));

            let mut buffer = SequenceBuffer::new();
            buffer.set_baseline(0);
            let mut delivered = Vec::new();
            for seq in arrivals {
                delivered.extend(seqs(&buffer.offer(seq, event(seq))));
            }
            // Backfill the whole log from wherever the cursor stopped
            let from = buffer.seq().unwrap();
            let rest: Vec<Event> = (from + 1..=total).map(event).collect();
            delivered.extend(seqs(&buffer.merge(from, rest)));

            assert_eq!(delivered, (1..=total).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_discard_only_drops_seqs_still_beyond_the_log() {
        let mut buffer = SequenceBuffer::new();
        buffer.set_baseline(0);
        buffer.offer(3, event(3));
        buffer.offer(1_000, event(1_000));
        assert_eq!(buffer.beyond(2), vec![3, 1_000]);

        // The log caught up to 3 meanwhile; only 1000 is unknown to it
        assert_eq!(buffer.discard(&[3, 1_000], 3), 1);
        assert_eq!(buffer.pending(), 1);
        assert_eq!(seqs(&buffer.merge(0, vec![event(1), event(2)])), vec![1, 2, 3]);
        assert!(!buffer.has_gap());
    }

    /// Fake worker: answers `worker-state` and `worker-events` from `log`,
    /// counting `worker-events` requests.
    async fn spawn_fake_worker(
        bus: Arc<MemoryBus>,
        log: Arc<Mutex<Vec<Event>>>,
        event_requests: Arc<AtomicUsize>,
    ) {
        let mut commands = bus.subscribe("test.w1.commands").await.unwrap();
        tokio::spawn(async move {
            while let Some(message) = commands.recv().await {
                let command_box: CommandBox = serde_json::from_slice(&message.payload).unwrap();
                let log = log.lock().unwrap().clone();
                let current = log.len() as u64;
                let data = match command_box.command {
                    Command::WorkerState => {
                        serde_json::to_value(GetStateResponse { seq: current }).unwrap()
                    }
                    Command::WorkerEvents { seq, batch_size } => {
                        event_requests.fetch_add(1, Ordering::SeqCst);
                        let end = (seq + batch_size.max(1)).min(current);
                        let events = if seq >= current {
                            Vec::new()
                        } else {
                            log[seq as usize..end as usize].to_vec()
                        };
                        serde_json::to_value(GetEventsResponse {
                            has_more: end < current,
                            seq: end.max(seq.min(current)),
                            events,
                        })
                        .unwrap()
                    }
                    other => panic!("unexpected command {other:?}"),
                };
                let reply = serde_json::to_vec(&CommandReply::Success { data }).unwrap();
                bus.publish(&message.reply.unwrap(), Bytes::from(reply))
                    .await
                    .unwrap();
            }
        });
    }

    async fn publish(bus: &MemoryBus, seq: u64) {
        let payload = serde_json::to_vec(&EventBox {
            seq,
            event: event(seq),
        })
        .unwrap();
        bus.publish("test.w1.events", Bytes::from(payload))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_driver_backfills_dropped_events() {
        let bus = Arc::new(MemoryBus::new());
        // Ten events already logged before the client starts; 11..=20 logged later
        let log = Arc::new(Mutex::new((1..=10).map(event).collect::<Vec<_>>()));
        spawn_fake_worker(Arc::clone(&bus), Arc::clone(&log), Arc::default()).await;

        let api = WorkerApi::new(bus.clone(), "test", "w1", Duration::from_secs(1));
        let subscription = bus.subscribe("test.w1.events").await.unwrap();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_reconciler(api, subscription, 3, cancel.clone(), move |b| {
            sink.lock().unwrap().push(b.seq);
        }));

        // Let the baseline settle at 10
        tokio::time::sleep(Duration::from_millis(50)).await;

        log.lock().unwrap().extend((11..=20).map(event));
        // Only a few make it live, out of order
        publish(&bus, 14).await;
        publish(&bus, 11).await;
        publish(&bus, 20).await;
        publish(&bus, 14).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while delivered.lock().unwrap().len() < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backfill did not complete");

        assert_eq!(*delivered.lock().unwrap(), (11..=20).collect::<Vec<_>>());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_event_the_worker_never_logged_is_discarded() {
        let bus = Arc::new(MemoryBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let event_requests = Arc::new(AtomicUsize::new(0));
        spawn_fake_worker(Arc::clone(&bus), Arc::clone(&log), Arc::clone(&event_requests)).await;

        let api = WorkerApi::new(bus.clone(), "test", "w1", Duration::from_secs(1));
        let subscription = bus.subscribe("test.w1.events").await.unwrap();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_reconciler(api, subscription, 500, cancel.clone(), move |b| {
            sink.lock().unwrap().push(b.seq);
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Far ahead of an empty log
        publish(&bus, 1_000_000).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let settled = event_requests.load(Ordering::SeqCst);
        assert!(
            (1..=3).contains(&settled),
            "expected a bounded backfill, saw {settled} requests"
        );

        // Backfilling has stopped
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(event_requests.load(Ordering::SeqCst), settled);

        // Genuine events still flow
        log.lock().unwrap().push(event(1));
        publish(&bus, 1).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while delivered.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("live event was not delivered");
        assert_eq!(*delivered.lock().unwrap(), vec![1]);

        cancel.cancel();
        task.await.unwrap();
    }
}
