//! Unbounded retry with exponential backoff and full jitter.
//!
//! Close and kill confirmations are retried until they succeed, the owning
//! component shuts down, or the target reaches its terminal state through
//! another path (the `superseded` flag).

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Initial backoff delay for retry.
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay.
pub const MAX_BACKOFF_MS: u64 = 5_000;

/// Exponential delay generator (x2 per attempt, capped, full jitter).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    current_ms: u64,
    max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF_MS, MAX_BACKOFF_MS)
    }
}

impl Backoff {
    #[must_use]
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            current_ms: initial_ms.max(1),
            max_ms: max_ms.max(1),
        }
    }

    /// Ceiling of the next delay, before jitter.
    #[must_use]
    pub fn ceiling_ms(&self) -> u64 {
        self.current_ms.min(self.max_ms)
    }

    /// Draw the next delay and advance the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling_ms();
        let delay = rand::thread_rng().gen_range(0..=ceiling);
        self.current_ms = (self.current_ms.saturating_mul(2)).min(self.max_ms);
        Duration::from_millis(delay)
    }
}

/// Retry `attempt` until it succeeds.
///
/// Returns `None` without further attempts once `cancel` fires or
/// `superseded` is set; both are checked before every attempt and the token
/// also interrupts in-flight attempts and sleeps.
pub async fn retry<T, E, F, Fut>(
    operation: &str,
    cancel: &CancellationToken,
    superseded: Option<&AtomicBool>,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut backoff = Backoff::default();

    loop {
        if cancel.is_cancelled() || superseded.is_some_and(|s| s.load(Ordering::Acquire)) {
            debug!(
                target: "common.backoff",
                operation = %operation,
                "Retry abandoned, target already settled"
            );
            return None;
        }

        let result = tokio::select! {
            () = cancel.cancelled() => return None,
            result = attempt() => result,
        };

        match result {
            Ok(value) => return Some(value),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    target: "common.backoff",
                    operation = %operation,
                    error = %e,
                    backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Attempt failed, will retry"
                );

                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(100, 400);
        let ceilings: Vec<u64> = (0..5)
            .map(|_| {
                let ceiling = backoff.ceiling_ms();
                let delay = backoff.next_delay();
                assert!(delay <= Duration::from_millis(ceiling));
                ceiling
            })
            .collect();

        assert_eq!(ceilings, vec![100, 200, 400, 400, 400]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = retry("router-close", &cancel, None, || {
            let attempts = Arc::clone(&attempts);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Err("timeout")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Some(4));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_superseded() {
        let attempts = Arc::new(AtomicU32::new(0));
        let superseded = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let result: Option<()> = retry("produce-close", &cancel, Some(&*superseded), || {
            let attempts = Arc::clone(&attempts);
            let superseded = Arc::clone(&superseded);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 1 {
                    // Server confirmed the close through an event meanwhile
                    superseded.store(true, Ordering::Release);
                }
                Err("no responders")
            }
        })
        .await;

        assert_eq!(result, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_cancellation() {
        let cancel = CancellationToken::new();
        let child = cancel.child_token();

        let handle = tokio::spawn(async move {
            retry::<(), _, _, _>("worker-kill", &child, None, || async { Err("down") }).await
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), None);
    }
}
