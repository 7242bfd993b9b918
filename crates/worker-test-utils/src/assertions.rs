//! Assertion helpers for state that converges asynchronously.

use std::time::Duration;

/// Poll `condition` every 10ms until it holds, panicking after `timeout`.
///
/// # Example
/// ```rust,ignore
/// assert_eventually(Duration::from_secs(1), || router.closed(), "router closed").await;
/// ```
pub async fn assert_eventually<F>(timeout: Duration, mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
