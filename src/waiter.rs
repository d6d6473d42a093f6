//! Bounded-interval polling used for every "wait until condition" in the
//! supervisor: drain completion, readiness, pool stabilization. Nothing in
//! the control plane blocks; waits are expressed as scheduled re-checks.

use std::time::Duration;
use tokio::time::Instant;

/// Poll `predicate` every `interval` until it returns true or `timeout`
/// elapses. Returns whether the predicate was satisfied.
///
/// The predicate is checked once immediately, so a condition that already
/// holds never sleeps.
pub async fn wait_until<F>(interval: Duration, timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        let remaining = deadline - Instant::now();
        tokio::time::sleep(interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_immediate_success_does_not_sleep() {
        let start = std::time::Instant::now();
        let ok = wait_until(Duration::from_secs(10), Duration::from_secs(10), || true).await;
        assert!(ok);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_eventual_success() {
        let calls = AtomicUsize::new(0);
        let ok = wait_until(Duration::from_millis(10), Duration::from_secs(5), || {
            calls.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert!(ok);
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_timeout_returns_false() {
        let ok = wait_until(Duration::from_millis(10), Duration::from_millis(50), || {
            false
        })
        .await;
        assert!(!ok);
    }
}
