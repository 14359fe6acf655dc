use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

/// A per-host failure counter with threshold-based open/cooldown state.
///
/// The breaker is `closed` while the counter is below the threshold and no
/// cooldown is pending, and `open` until `cooldown_until` once the threshold
/// is reached. There is no half-open state: an expired cooldown returns the
/// breaker to closed and attempts resume immediately.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerInner>,
}

#[derive(Debug, Default, Clone, Copy)]
struct BreakerInner {
    failures: u32,
    last_failure: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker tripping after `threshold` consecutive
    /// failures, each trip blocking attempts for `cooldown`.
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        debug!(
            "Initialized circuit breaker: threshold={threshold}, cooldown={}s",
            cooldown.as_secs_f64()
        );
        CircuitBreaker {
            threshold,
            cooldown,
            state: Mutex::new(BreakerInner::default()),
        }
    }

    /// Whether a request may be attempted right now.
    #[must_use]
    pub fn can_attempt(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .cooldown_until
            .is_none_or(|until| Instant::now() >= until)
    }

    /// Record a failed attempt. Reaching the threshold arms the cooldown
    /// and resets the counter in the same transition.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.failures += 1;
        state.last_failure = Some(now);
        if state.failures >= self.threshold {
            state.cooldown_until = Some(now + self.cooldown);
            state.failures = 0;
            warn!(
                "Circuit breaker open for {:.0}s after {} failures",
                self.cooldown.as_secs_f64(),
                self.threshold
            );
        }
    }

    /// Record a successful attempt. Resets the failure counter; an armed
    /// cooldown is left to elapse on its own.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.failures > 0 {
            debug!("Circuit breaker: recorded success, resetting failures");
        }
        state.failures = 0;
    }

    /// The current failure count.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.state.lock().unwrap().failures
    }

    /// Seconds left until attempts resume, zero when closed.
    #[must_use]
    pub fn cooldown_remaining(&self) -> Duration {
        self.state
            .lock()
            .unwrap()
            .cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Time since the last recorded failure, if any.
    #[must_use]
    pub fn last_failure_age(&self) -> Option<Duration> {
        self.state.lock().unwrap().last_failure.map(|t| t.elapsed())
    }

    /// Overwrite counters and timestamps from a persisted snapshot.
    /// Offsets are best-effort hints, not correctness-critical.
    pub(crate) fn restore(&self, failures: u32, cooldown_remaining: Duration, failure_age: Duration) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.failures = failures;
        if !cooldown_remaining.is_zero() {
            state.cooldown_until = Some(now + cooldown_remaining);
        }
        if !failure_age.is_zero() {
            state.last_failure = now.checked_sub(failure_age);
        }
    }
}
