//! Async mutual exclusion with FIFO hand-off.
//!
//! [`AsyncLock`] is a single permit; [`AsyncLockMap`] keeps one permit per
//! key and forgets keys that nobody holds or waits for. Both wake waiters
//! strictly in arrival order: a releasing holder hands the permit directly to
//! the next live waiter, so a newcomer can never barge ahead of the queue.
//!
//! Release is tied to the guard, so a critical section that returns an error
//! or unwinds still frees the permit. The worker command layer uses the keyed
//! form to serialise creates sharing a `(command type, repeat key)` pair.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::error;

type Waiters = VecDeque<oneshot::Sender<()>>;

/// Pass the permit to the first waiter still listening.
///
/// Returns `false` when the queue drained without anyone taking it.
fn hand_off(waiters: &mut Waiters) -> bool {
    while let Some(waiter) = waiters.pop_front() {
        if waiter.send(()).is_ok() {
            return true;
        }
    }
    false
}

/// Unlocking a permit nobody holds is a bug in this module, not a runtime
/// condition.
fn release_without_holder(what: &str) -> ! {
    error!(target: "common.lock", lock = %what, "Released a lock that is not held");
    std::process::abort()
}

/// A queued acquisition. If dropped after the permit was handed over but
/// before the waiter observed it, the permit is passed on.
struct Pending<F: Fn()> {
    rx: Option<oneshot::Receiver<()>>,
    release: F,
}

impl<F: Fn()> Pending<F> {
    async fn acquired(mut self) {
        if let Some(rx) = self.rx.as_mut() {
            // Senders are only dropped unsent when their receiver is gone.
            let _ = rx.await;
        }
        self.rx = None;
    }
}

impl<F: Fn()> Drop for Pending<F> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                (self.release)();
            }
        }
    }
}

/// Single-permit async lock with FIFO waiters.
#[derive(Debug, Default)]
pub struct AsyncLock {
    // `None` while unlocked; `Some(waiters)` while held.
    state: Mutex<Option<Waiters>>,
}

/// Holds the permit of an [`AsyncLock`] until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct AsyncLockGuard<'a> {
    lock: &'a AsyncLock,
}

impl AsyncLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the permit.
    pub async fn lock(&self) -> AsyncLockGuard<'_> {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(waiters) = state.as_mut() {
                let (tx, rx) = oneshot::channel();
                waiters.push_back(tx);
                rx
            } else {
                *state = Some(VecDeque::new());
                return AsyncLockGuard { lock: self };
            }
        };

        Pending {
            rx: Some(rx),
            release: || self.release(),
        }
        .acquired()
        .await;

        AsyncLockGuard { lock: self }
    }

    /// Run `f` while holding the permit.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock().await;
        f().await
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(waiters) = state.as_mut() else {
            release_without_holder("global");
        };
        if !hand_off(waiters) {
            *state = None;
        }
    }
}

impl Drop for AsyncLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Keyed async lock: one FIFO permit per key.
///
/// A key is present in the map exactly while someone holds it; the entry is
/// removed when the last holder releases with nobody waiting.
#[derive(Debug, Default)]
pub struct AsyncLockMap {
    keys: Mutex<HashMap<String, Waiters>>,
}

/// Holds the permit for one key of an [`AsyncLockMap`] until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct AsyncLockMapGuard<'a> {
    map: &'a AsyncLockMap,
    key: String,
}

impl AsyncLockMapGuard<'_> {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl AsyncLockMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the permit of `key`.
    pub async fn lock(&self, key: &str) -> AsyncLockMapGuard<'_> {
        let rx = {
            let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(waiters) = keys.get_mut(key) {
                let (tx, rx) = oneshot::channel();
                waiters.push_back(tx);
                rx
            } else {
                keys.insert(key.to_string(), VecDeque::new());
                return AsyncLockMapGuard {
                    map: self,
                    key: key.to_string(),
                };
            }
        };

        Pending {
            rx: Some(rx),
            release: || self.release(key),
        }
        .acquired()
        .await;

        AsyncLockMapGuard {
            map: self,
            key: key.to_string(),
        }
    }

    /// Run `f` while holding the permit of `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        f().await
    }

    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(waiters) = keys.get_mut(key) else {
            release_without_holder(key);
        };
        if !hand_off(waiters) {
            keys.remove(key);
        }
    }
}

impl Drop for AsyncLockMapGuard<'_> {
    fn drop(&mut self) {
        self.map.release(&self.key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_waiters_acquire_in_arrival_order() {
        let map = Arc::new(AsyncLockMap::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = map.lock("router-create:r1").await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let map = Arc::clone(&map);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                map.with_lock("router-create:r1", || async {
                    order.lock().unwrap().push(i);
                    tokio::task::yield_now().await;
                })
                .await;
            }));
            // Let the task enqueue before spawning the next one
            tokio::task::yield_now().await;
        }

        drop(guard);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(map.active_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let map = AsyncLockMap::new();
        let _a = map.lock("a").await;

        let b = tokio::time::timeout(Duration::from_millis(10), map.lock("b")).await;
        assert!(b.is_ok(), "distinct key must not block");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_keys_are_removed() {
        let map = AsyncLockMap::new();
        {
            let _guard = map.lock("k").await;
            assert!(map.is_locked("k"));
            assert_eq!(map.active_keys(), 1);
        }
        assert!(!map.is_locked("k"));
        assert_eq!(map.active_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_on_error() {
        let map = AsyncLockMap::new();

        let result: Result<(), &str> = map.with_lock("k", || async { Err("engine failed") }).await;
        assert!(result.is_err());

        let again = tokio::time::timeout(Duration::from_millis(10), map.lock("k")).await;
        assert!(again.is_ok(), "lock must be free after a failed section");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_is_skipped() {
        let map = AsyncLockMap::new();
        let guard = map.lock("k").await;

        // Enqueue a waiter, then give up on it
        let waiting = tokio::time::timeout(Duration::from_millis(10), map.lock("k")).await;
        assert!(waiting.is_err());

        drop(guard);
        assert_eq!(map.active_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_hand_off_is_passed_on() {
        let map = AsyncLockMap::new();
        let guard = map.lock("k").await;

        let mut waiter = Box::pin(map.lock("k"));
        // Poll once so the waiter joins the queue
        assert!(
            tokio::time::timeout(Duration::from_millis(1), &mut waiter)
                .await
                .is_err()
        );

        // Permit is handed to the queued waiter, which is then dropped unpolled
        drop(guard);
        assert!(map.is_locked("k"));
        drop(waiter);

        assert!(!map.is_locked("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_lock_serialises_sections() {
        let lock = Arc::new(AsyncLock::new());
        let inside = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            handles.push(tokio::spawn(async move {
                lock.with_lock(|| async {
                    let now = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(now, 0, "two holders at once");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                })
                .await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!lock.is_locked());
    }
}
