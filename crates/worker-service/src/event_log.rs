//! Append-only per-worker event log.
//!
//! Sequence numbers start at 1 and are never skipped or reused. The event
//! with seq `n` is stored at index `n - 1`, which makes replay a slice.

use common::wire::commands::GetEventsResponse;
use common::wire::{Event, EventBox};

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and assign it the next sequence number.
    pub fn append(&mut self, event: Event) -> EventBox {
        self.events.push(event.clone());
        EventBox {
            seq: self.current_seq(),
            event,
        }
    }

    /// Seq of the newest event, 0 when empty.
    #[must_use]
    pub fn current_seq(&self) -> u64 {
        u64::try_from(self.events.len()).unwrap_or(u64::MAX)
    }

    /// Up to `batch_size` events strictly after `seq`.
    ///
    /// The returned `seq` is that of the last event included, so a client
    /// can feed it straight into the next call. A batch size of 0 is treated
    /// as 1 so that a paging client always makes progress.
    #[must_use]
    pub fn since(&self, seq: u64, batch_size: u64) -> GetEventsResponse {
        let current = self.current_seq();
        if seq >= current {
            return GetEventsResponse {
                has_more: false,
                seq: current,
                events: Vec::new(),
            };
        }

        let end = seq.saturating_add(batch_size.max(1)).min(current);
        let events = usize::try_from(seq)
            .ok()
            .zip(usize::try_from(end).ok())
            .and_then(|(start, end)| self.events.get(start..end))
            .map(<[Event]>::to_vec)
            .unwrap_or_default();

        GetEventsResponse {
            has_more: end < current,
            seq: end,
            events,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::SimpleMap;
    use common::wire::RouterState;

    fn router_event(id: &str) -> Event {
        Event::Router {
            state: RouterState {
                id: id.to_string(),
                closed: false,
                app_data: SimpleMap::new(),
                time: 1,
            },
            router_id: id.to_string(),
            worker_id: "w1".to_string(),
            time: 1,
        }
    }

    fn log_with(n: usize) -> EventLog {
        let mut log = EventLog::new();
        for i in 0..n {
            log.append(router_event(&format!("r{}", i + 1)));
        }
        log
    }

    fn router_ids(response: &GetEventsResponse) -> Vec<String> {
        response
            .events
            .iter()
            .map(|e| match e {
                Event::Router { router_id, .. } => router_id.clone(),
                _ => String::new(),
            })
            .collect()
    }

    #[test]
    fn test_append_assigns_one_based_seq() {
        let mut log = EventLog::new();
        assert_eq!(log.current_seq(), 0);

        assert_eq!(log.append(router_event("r1")).seq, 1);
        assert_eq!(log.append(router_event("r2")).seq, 2);
        assert_eq!(log.current_seq(), 2);
    }

    #[test]
    fn test_empty_log_query() {
        let response = EventLog::new().since(0, 500);
        assert_eq!(
            response,
            GetEventsResponse {
                has_more: false,
                seq: 0,
                events: Vec::new(),
            }
        );
    }

    #[test]
    fn test_since_returns_events_after_seq() {
        let log = log_with(5);
        let response = log.since(2, 500);

        assert!(!response.has_more);
        assert_eq!(response.seq, 5);
        assert_eq!(router_ids(&response), vec!["r3", "r4", "r5"]);
    }

    #[test]
    fn test_since_pages_through_batches() {
        let log = log_with(5);

        let first = log.since(0, 2);
        assert!(first.has_more);
        assert_eq!(first.seq, 2);
        assert_eq!(router_ids(&first), vec!["r1", "r2"]);

        let second = log.since(first.seq, 2);
        assert!(second.has_more);
        assert_eq!(second.seq, 4);

        let last = log.since(second.seq, 2);
        assert!(!last.has_more);
        assert_eq!(last.seq, 5);
        assert_eq!(router_ids(&last), vec!["r5"]);
    }

    #[test]
    fn test_exact_batch_boundary_has_no_more() {
        let log = log_with(4);
        let response = log.since(0, 4);
        assert!(!response.has_more);
        assert_eq!(response.events.len(), 4);
    }

    #[test]
    fn test_zero_batch_is_treated_as_one() {
        let log = log_with(3);
        let response = log.since(0, 0);
        assert!(response.has_more);
        assert_eq!(response.seq, 1);
        assert_eq!(response.events.len(), 1);
    }

    #[test]
    fn test_seq_ahead_of_log_returns_current() {
        let log = log_with(2);
        let response = log.since(10, 500);
        assert!(!response.has_more);
        assert_eq!(response.seq, 2);
        assert!(response.events.is_empty());
    }
}
