use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use super::MIN_RATE;
use crate::HostKey;

/// Sleep slice while the permit buffer is full
const FULL_BUFFER_POLL: Duration = Duration::from_millis(10);

/// A bounded, producer-driven token bucket pacing one logical host.
///
/// A background task emits permits into a bounded buffer at the effective
/// rate; [`acquire`](Self::acquire) consumes them. The buffer never holds
/// more than `burst` permits, so idle hosts cannot accumulate an unbounded
/// credit.
///
/// The effective rate ramps up linearly from 20% of the target to 100% over
/// the ramp-up window (slow start), and each inter-permit delay is jittered
/// to avoid synchronized emission across buckets. The target rate itself is
/// adaptive: [`adjust_rate`](Self::adjust_rate) multiplies it in response to
/// observed outcomes, floored at [`MIN_RATE`].
///
/// A forced cooldown ([`raise_cooldown`](Self::raise_cooldown)) blocks
/// `acquire` until its deadline; the deadline only ever moves forward.
#[derive(Debug)]
pub struct TokenBucket {
    name: HostKey,
    burst: usize,
    jitter_ratio: f64,
    ramp_up: Duration,
    rate: Mutex<f64>,
    started_at: Mutex<Option<Instant>>,
    // Guarded so concurrent raises keep the deadline monotone
    cooldown_until: Mutex<Option<Instant>>,
    permits: Semaphore,
    stop_tx: watch::Sender<bool>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl TokenBucket {
    /// Create a bucket for `name`.
    ///
    /// # Panics
    ///
    /// Panics if `rate_per_sec` is not positive or `burst` is zero.
    #[must_use]
    pub fn new(
        name: HostKey,
        rate_per_sec: f64,
        burst: usize,
        jitter_ratio: f64,
        ramp_up: Duration,
    ) -> Self {
        assert!(rate_per_sec > 0.0 && burst >= 1);
        debug!(
            "Created token bucket '{name}': rate={rate_per_sec}, burst={burst}, ramp_up={}s",
            ramp_up.as_secs_f64()
        );
        let (stop_tx, _) = watch::channel(false);
        TokenBucket {
            name,
            burst,
            jitter_ratio,
            ramp_up,
            rate: Mutex::new(rate_per_sec),
            started_at: Mutex::new(None),
            cooldown_until: Mutex::new(None),
            permits: Semaphore::new(0),
            stop_tx,
            producer: Mutex::new(None),
        }
    }

    /// Begin background permit production. Idempotent; a second call while
    /// the producer is running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut producer = self.producer.lock().unwrap();
        if producer.is_some() {
            return;
        }
        self.stop_tx.send_replace(false);
        {
            // A restored bucket may carry a back-dated ramp start; keep it.
            let mut started_at = self.started_at.lock().unwrap();
            if started_at.is_none() {
                *started_at = Some(Instant::now());
            }
        }
        let bucket = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        *producer = Some(tokio::spawn(async move {
            bucket.produce(&mut stop_rx).await;
        }));
        info!("Token bucket '{}' started", self.name);
    }

    /// Terminate the producer and wait for it to exit. Nothing is drained;
    /// a subsequent [`acquire`](Self::acquire) is not guaranteed to succeed.
    pub async fn stop(&self) {
        let handle = self.producer.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = self.stop_tx.send(true);
            let _ = handle.await;
            info!("Token bucket '{}' stopped", self.name);
        }
    }

    /// Consume one permit, waiting out any forced cooldown first.
    ///
    /// Cancellation-safe: the permit is consumed only after both the
    /// cooldown wait and the buffer take complete.
    ///
    /// # Panics
    ///
    /// Panics if the cooldown mutex is poisoned.
    pub async fn acquire(&self) {
        let wait = {
            let cooldown = self.cooldown_until.lock().unwrap();
            cooldown.map(|until| until.saturating_duration_since(Instant::now()))
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                debug!(
                    "Bucket '{}' cooling down for {:.2}s",
                    self.name,
                    wait.as_secs_f64()
                );
                sleep(wait).await;
            }
        }
        let permit = self
            .permits
            .acquire()
            .await
            // SAFETY: this should not panic as we never close the semaphore
            .expect("Permit semaphore was closed unexpectedly");
        permit.forget();
        debug!("Bucket '{}' acquired token", self.name);
    }

    /// Raise the cooldown floor to `until`. Deadlines earlier than the
    /// current one are ignored, so the floor is monotonically non-decreasing
    /// for the duration of a forced cooldown.
    pub fn raise_cooldown(&self, until: Instant) {
        let mut cooldown = self.cooldown_until.lock().unwrap();
        if cooldown.is_none_or(|current| until > current) {
            *cooldown = Some(until);
            info!(
                "Bucket '{}' set cooldown for {:.2}s",
                self.name,
                until.saturating_duration_since(Instant::now()).as_secs_f64()
            );
        }
    }

    /// Multiply the target rate, floored at [`MIN_RATE`]. The new rate is
    /// observable on the producer's next tick.
    ///
    /// # Panics
    ///
    /// Panics if the rate mutex is poisoned.
    pub fn adjust_rate(&self, multiplier: f64) {
        let mut rate = self.rate.lock().unwrap();
        let old_rate = *rate;
        *rate = (old_rate * multiplier).max(MIN_RATE);
        info!(
            "Bucket '{}' rate adjusted: {old_rate:.2} -> {:.2} (x{multiplier})",
            self.name, *rate
        );
    }

    /// The current target rate in permits per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        *self.rate.lock().unwrap()
    }

    /// The bucket's logical host.
    #[must_use]
    pub fn name(&self) -> &HostKey {
        &self.name
    }

    /// The instantaneous permit rate after applying slow-start ramp-up.
    #[must_use]
    pub fn effective_rate(&self) -> f64 {
        let target = *self.rate.lock().unwrap();
        let started_at = *self.started_at.lock().unwrap();
        let Some(started_at) = started_at else {
            return target.max(MIN_RATE);
        };
        if self.ramp_up.is_zero() {
            return target.max(MIN_RATE);
        }
        let elapsed = started_at.elapsed().as_secs_f64();
        let base = 0.2 * target;
        let rate = base + (target - base) * (elapsed / self.ramp_up.as_secs_f64()).min(1.0);
        rate.max(MIN_RATE)
    }

    /// Seconds left on the forced cooldown, zero when none is in effect.
    #[must_use]
    pub fn cooldown_remaining(&self) -> Duration {
        self.cooldown_until
            .lock()
            .unwrap()
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Time since permit production began, if it has.
    #[must_use]
    pub fn elapsed_since_start(&self) -> Option<Duration> {
        self.started_at.lock().unwrap().map(|t| t.elapsed())
    }

    /// Overwrite the target rate. Used when restoring persisted state.
    pub(crate) fn set_rate(&self, rate_per_sec: f64) {
        *self.rate.lock().unwrap() = rate_per_sec.max(MIN_RATE);
    }

    /// Back-date the ramp start by `elapsed`, so a restored bucket resumes
    /// ramp-up where the previous run left off.
    pub(crate) fn backdate_start(&self, elapsed: Duration) {
        let now = Instant::now();
        *self.started_at.lock().unwrap() = Some(now.checked_sub(elapsed).unwrap_or(now));
    }

    async fn produce(&self, stop: &mut watch::Receiver<bool>) {
        debug!("Bucket '{}' producer started", self.name);
        loop {
            if *stop.borrow() {
                break;
            }
            let delay = self.next_delay();
            if self.permits.available_permits() >= self.burst {
                // Buffer at burst capacity: hold back without emitting
                tokio::select! {
                    () = sleep(FULL_BUFFER_POLL.min(delay)) => {}
                    _ = stop.changed() => break,
                }
                continue;
            }
            self.permits.add_permits(1);
            debug!(
                "Bucket '{}' added token (delay={:.3}s)",
                self.name,
                delay.as_secs_f64()
            );
            tokio::select! {
                () = sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }
        debug!("Bucket '{}' producer exited", self.name);
    }

    fn next_delay(&self) -> Duration {
        let rate = self.effective_rate();
        let mut rng = rand::rng();
        let jitter = 1.0 + rng.random_range(-self.jitter_ratio..=self.jitter_ratio);
        Duration::from_secs_f64((1.0 / rate) * jitter.max(0.2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(rate: f64, burst: usize, ramp_up: Duration) -> Arc<TokenBucket> {
        Arc::new(TokenBucket::new(
            HostKey::from("example.com"),
            rate,
            burst,
            0.0,
            ramp_up,
        ))
    }

    #[test]
    fn test_effective_rate_before_start() {
        let bucket = bucket(2.0, 2, Duration::from_secs(10));
        assert!((bucket.effective_rate() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_effective_rate_during_ramp_up() {
        let bucket = bucket(1.0, 2, Duration::from_secs(10));
        bucket.backdate_start(Duration::from_secs(5));
        // Halfway through the window: 0.2 + 0.8 * 0.5
        let rate = bucket.effective_rate();
        assert!((rate - 0.6).abs() < 0.01, "rate = {rate}");
    }

    #[test]
    fn test_effective_rate_after_ramp_up() {
        let bucket = bucket(1.0, 2, Duration::from_secs(10));
        bucket.backdate_start(Duration::from_secs(60));
        assert!((bucket.effective_rate() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_effective_rate_floor() {
        let bucket = bucket(0.2, 2, Duration::from_secs(100));
        bucket.backdate_start(Duration::ZERO);
        // 20% of 0.2 would be 0.04; the floor wins
        assert!((bucket.effective_rate() - MIN_RATE).abs() < 0.01);
    }

    #[test]
    fn test_adjust_rate_floor() {
        let bucket = bucket(1.0, 2, Duration::ZERO);
        bucket.adjust_rate(0.0001);
        assert!((bucket.rate() - MIN_RATE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_adjust_rate_compounds() {
        let bucket = bucket(1.0, 2, Duration::ZERO);
        bucket.adjust_rate(0.8);
        bucket.adjust_rate(0.8);
        assert!((bucket.rate() - 0.64).abs() < 1e-9);
    }

    #[test]
    fn test_cooldown_is_monotone() {
        let bucket = bucket(1.0, 2, Duration::ZERO);
        let now = Instant::now();
        bucket.raise_cooldown(now + Duration::from_secs(2));
        bucket.raise_cooldown(now + Duration::from_secs(1));
        assert!(bucket.cooldown_remaining() > Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_buffer_never_exceeds_burst() {
        let bucket = bucket(100.0, 2, Duration::ZERO);
        bucket.start();
        sleep(Duration::from_millis(300)).await;
        // ~30 permits were due; the buffer caps at burst
        assert_eq!(bucket.permits.available_permits(), 2);
        bucket.stop().await;
    }

    #[tokio::test]
    async fn test_acquire_consumes_one_permit() {
        let bucket = bucket(100.0, 2, Duration::ZERO);
        bucket.start();
        sleep(Duration::from_millis(100)).await;
        bucket.acquire().await;
        assert!(bucket.permits.available_permits() <= 1);
        bucket.stop().await;
    }

    #[tokio::test]
    async fn test_acquire_waits_out_cooldown() {
        let bucket = bucket(100.0, 2, Duration::ZERO);
        bucket.start();
        sleep(Duration::from_millis(50)).await;
        bucket.raise_cooldown(Instant::now() + Duration::from_millis(300));
        let before = Instant::now();
        bucket.acquire().await;
        assert!(before.elapsed() >= Duration::from_millis(280));
        bucket.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let bucket = bucket(100.0, 2, Duration::ZERO);
        bucket.start();
        bucket.start();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(bucket.permits.available_permits(), 2);
        bucket.stop().await;
        // A second stop is a no-op
        bucket.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_producer_emits_nothing() {
        let bucket = bucket(100.0, 2, Duration::ZERO);
        bucket.start();
        sleep(Duration::from_millis(50)).await;
        bucket.stop().await;
        bucket.acquire().await;
        bucket.acquire().await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(bucket.permits.available_permits(), 0);
    }
}
