//! Crash-storm circuit breaker for the worker pool.
//!
//! Every worker exit feeds the tracker; when exits pile up faster than the
//! pool-size-derived threshold allows, the "reload permitted" flag trips and
//! external reloads are rejected until the storm subsides.

use parking_lot::Mutex;
use std::time::Instant;
use tracing::warn;

/// Half-life of the decaying exit counter. An exit contributes half its
/// weight after this much time, a quarter after twice it, and so on.
const DECAY_HALF_LIFE_SECS: f64 = 10.0;

/// Decaying counter of worker-exit events with a derived "reload permitted"
/// flag.
///
/// The estimator is an exponentially decaying event count: each exit adds
/// one, and the accumulated level halves every [`DECAY_HALF_LIFE_SECS`].
/// The flag trips false when the level exceeds a threshold derived from the
/// pool size and resets once the level falls below half the threshold, so a
/// pool hovering at the boundary does not flap.
pub struct ExitRateTracker {
    threshold: f64,
    inner: Mutex<Inner>,
}

struct Inner {
    level: f64,
    updated_at: Instant,
    permitted: bool,
    stopped: bool,
}

impl ExitRateTracker {
    /// Build a tracker sized for a pool of `num_workers` processes.
    ///
    /// The threshold grows with the pool so that routine churn in a large
    /// pool does not trip the breaker: `(log2(n) + n/2) / 2`, floored at 1.
    pub fn new(num_workers: usize) -> Self {
        let n = num_workers.max(1) as f64;
        let threshold = ((n.log2() + n / 2.0) / 2.0).max(1.0);
        Self {
            threshold,
            inner: Mutex::new(Inner {
                level: 0.0,
                updated_at: Instant::now(),
                permitted: true,
                stopped: false,
            }),
        }
    }

    /// Record one worker-exit event and recompute the flag.
    pub fn record_exit(&self) {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return;
        }
        let now = Instant::now();
        inner.level = decayed(inner.level, now - inner.updated_at);
        inner.level += 1.0;
        inner.updated_at = now;
        if inner.permitted && inner.level > self.threshold {
            inner.permitted = false;
            warn!(
                level = inner.level,
                threshold = self.threshold,
                "Too many worker processes exiting; reloading disabled until further notice"
            );
        }
    }

    /// Whether a reload may proceed right now. Applies decay, so a tracker
    /// that tripped during a storm recovers on its own once exits subside.
    pub fn reload_permitted(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return true;
        }
        let now = Instant::now();
        inner.level = decayed(inner.level, now - inner.updated_at);
        inner.updated_at = now;
        if !inner.permitted && inner.level < self.threshold / 2.0 {
            inner.permitted = true;
            warn!("Worker exits subsided; reloading re-enabled");
        }
        inner.permitted
    }

    /// Stop tracking (used during terminate). A stopped tracker never
    /// blocks anything again.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
    }

    #[cfg(test)]
    fn backdate(&self, by: std::time::Duration) {
        let mut inner = self.inner.lock();
        inner.updated_at -= by;
    }
}

fn decayed(level: f64, elapsed: std::time::Duration) -> f64 {
    level * 0.5f64.powf(elapsed.as_secs_f64() / DECAY_HALF_LIFE_SECS)
}
