//! Process-wide, strictly increasing millisecond clock.
//!
//! Values stamp resource states and heartbeats. They are version counters,
//! not timestamps: readers only ever compare a value with an earlier value
//! produced by the same process, so the clamp below is what matters and
//! cross-process skew does not.

use std::sync::atomic::{AtomicU64, Ordering};

static LAST: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock milliseconds, clamped so every call returns a value
/// strictly greater than the previous one.
#[must_use]
pub fn now() -> u64 {
    let wall = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
    let mut previous = LAST.load(Ordering::Relaxed);
    loop {
        let next = wall.max(previous + 1);
        match LAST.compare_exchange_weak(previous, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => previous = actual,
        }
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_strictly_increasing() {
        let mut last = now();
        for _ in 0..10_000 {
            let next = now();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_now_tracks_wall_clock() {
        let wall = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        assert!(now() >= wall);
    }

    #[test]
    fn test_now_is_increasing_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| now()).collect::<Vec<_>>()))
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let values = handle.join().unwrap_or_default();
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            all.extend(values);
        }

        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "no value handed out twice");
    }
}
