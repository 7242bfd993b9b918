//! Bus wrapper that misbehaves on purpose.
//!
//! Wraps another [`Bus`] and, for publishes on matching topics, drops,
//! duplicates or holds back messages (a held message is released after the
//! next one, which reorders the pair). Randomness is seeded so a failing
//! test can be replayed.
//!
//! Requests and subscriptions pass through untouched.

use async_trait::async_trait;
use bytes::Bytes;
use common::bus::{Bus, Subscription};
use common::error::BusError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct Faults {
    rng: StdRng,
    held: Option<(String, Bytes)>,
    dropped: usize,
    duplicated: usize,
    reordered: usize,
}

/// A [`Bus`] that drops, duplicates and reorders published messages.
///
/// # Example
/// ```rust,ignore
/// let bus = LossyBus::new(Arc::new(MemoryBus::new()))
///     .topics_containing(".events")
///     .drop_rate(0.2)
///     .duplicate_rate(0.2)
///     .reorder_rate(0.2)
///     .seed(7);
/// ```
pub struct LossyBus {
    inner: Arc<dyn Bus>,
    filter: Option<String>,
    drop_rate: f64,
    duplicate_rate: f64,
    reorder_rate: f64,
    faults: Mutex<Faults>,
}

impl LossyBus {
    /// Wrap `inner` with every fault rate at zero.
    pub fn new(inner: Arc<dyn Bus>) -> Self {
        Self {
            inner,
            filter: None,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            faults: Mutex::new(Faults {
                rng: StdRng::seed_from_u64(0),
                held: None,
                dropped: 0,
                duplicated: 0,
                reordered: 0,
            }),
        }
    }

    /// Only misbehave on topics containing `pattern`.
    pub fn topics_containing(mut self, pattern: &str) -> Self {
        self.filter = Some(pattern.to_string());
        self
    }

    pub fn drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate;
        self
    }

    pub fn duplicate_rate(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate;
        self
    }

    pub fn reorder_rate(mut self, rate: f64) -> Self {
        self.reorder_rate = rate;
        self
    }

    pub fn seed(self, seed: u64) -> Self {
        self.faults().rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Counts of (dropped, duplicated, reordered) messages so far.
    pub fn fault_counts(&self) -> (usize, usize, usize) {
        let faults = self.faults();
        (faults.dropped, faults.duplicated, faults.reordered)
    }

    /// Publish a held-back message, if any.
    pub async fn flush(&self) {
        let held = self.faults().held.take();
        if let Some((topic, payload)) = held {
            let _ = self.inner.publish(&topic, payload).await;
        }
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn matches(&self, topic: &str) -> bool {
        self.filter.as_ref().map_or(true, |f| topic.contains(f.as_str()))
    }
}

/// What to do with one publish.
enum Plan {
    Drop,
    Hold,
    Send { copies: usize, release: Option<(String, Bytes)> },
}

#[async_trait]
impl Bus for LossyBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        if !self.matches(topic) {
            return self.inner.publish(topic, payload).await;
        }

        let plan = {
            let mut faults = self.faults();
            if faults.rng.gen_bool(self.drop_rate) {
                faults.dropped += 1;
                Plan::Drop
            } else if faults.held.is_none() && faults.rng.gen_bool(self.reorder_rate) {
                faults.reordered += 1;
                faults.held = Some((topic.to_string(), payload.clone()));
                Plan::Hold
            } else {
                let copies = if faults.rng.gen_bool(self.duplicate_rate) {
                    faults.duplicated += 1;
                    2
                } else {
                    1
                };
                Plan::Send {
                    copies,
                    release: faults.held.take(),
                }
            }
        };

        match plan {
            Plan::Drop | Plan::Hold => Ok(()),
            Plan::Send { copies, release } => {
                for _ in 0..copies {
                    self.inner.publish(topic, payload.clone()).await?;
                }
                if let Some((held_topic, held_payload)) = release {
                    self.inner.publish(&held_topic, held_payload).await?;
                }
                Ok(())
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        self.inner.subscribe(topic).await
    }

    async fn request(
        &self,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        self.inner.request(topic, payload, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::bus::MemoryBus;

    async fn collect(sub: &mut Subscription) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(50), sub.recv()).await
        {
            out.push(message.payload[0]);
        }
        out
    }

    #[tokio::test]
    async fn test_passthrough_when_rates_are_zero() {
        let inner = Arc::new(MemoryBus::new());
        let bus = LossyBus::new(inner.clone());
        let mut sub = inner.subscribe("t.events").await.unwrap();

        for i in 0..5u8 {
            bus.publish("t.events", Bytes::from(vec![i])).await.unwrap();
        }
        assert_eq!(collect(&mut sub).await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_reorder_swaps_pairs() {
        let inner = Arc::new(MemoryBus::new());
        let bus = LossyBus::new(inner.clone()).reorder_rate(1.0);
        let mut sub = inner.subscribe("t.events").await.unwrap();

        for i in 0..4u8 {
            bus.publish("t.events", Bytes::from(vec![i])).await.unwrap();
        }
        assert_eq!(collect(&mut sub).await, vec![1, 0, 3, 2]);
    }

    #[tokio::test]
    async fn test_filter_spares_other_topics() {
        let inner = Arc::new(MemoryBus::new());
        let bus = LossyBus::new(inner.clone())
            .topics_containing(".events")
            .drop_rate(1.0);
        let mut events = inner.subscribe("t.events").await.unwrap();
        let mut reports = inner.subscribe("t.report").await.unwrap();

        bus.publish("t.events", Bytes::from(vec![1])).await.unwrap();
        bus.publish("t.report", Bytes::from(vec![2])).await.unwrap();

        assert!(collect(&mut events).await.is_empty());
        assert_eq!(collect(&mut reports).await, vec![2]);
        assert_eq!(bus.fault_counts(), (1, 0, 0));
    }
}
