use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use log::debug;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::state::{BreakerState, BucketState, EngineState};
use crate::throttle::{CircuitBreaker, TokenBucket};
use crate::HostKey;

/// Jitter applied to every bucket's inter-permit delay.
/// Distinct from the retry policy's backoff jitter.
const BUCKET_JITTER_RATIO: f64 = 0.15;

/// Construction parameters for the per-host structures.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HostPolicy {
    pub rate: f64,
    pub burst: usize,
    pub ramp_up: Duration,
    pub concurrency: usize,
    pub failure_threshold: u32,
    pub breaker_cooldown: Duration,
}

/// The structures owned by one logical host.
#[derive(Debug)]
pub(crate) struct HostEntry {
    pub bucket: Arc<TokenBucket>,
    pub breaker: CircuitBreaker,
    pub semaphore: Semaphore,
}

/// Registry of per-host structures plus the global concurrency gate.
///
/// Hosts are created lazily on first sighting (either during pre-run
/// expansion or mid-run inside the fetch pipeline) and live for the
/// process's lifetime. Creation is race-safe: when two workers sight a new
/// host simultaneously, exactly one entry survives and only its bucket is
/// started.
#[derive(Debug)]
pub(crate) struct HostPool {
    hosts: DashMap<HostKey, Arc<HostEntry>>,
    policy: HostPolicy,
    global: Semaphore,
}

impl HostPool {
    pub(crate) fn new(policy: HostPolicy, global_concurrency: usize) -> Self {
        HostPool {
            hosts: DashMap::new(),
            policy,
            global: Semaphore::new(global_concurrency),
        }
    }

    /// The global concurrency semaphore.
    pub(crate) fn global(&self) -> &Semaphore {
        &self.global
    }

    /// Get the structures for `host`, creating and starting them on first
    /// sighting.
    pub(crate) fn ensure(&self, host: &HostKey) -> Arc<HostEntry> {
        if let Some(entry) = self.hosts.get(host) {
            return entry.clone();
        }
        match self.hosts.entry(host.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(
                    "Initializing host structures for {host} (concurrency={})",
                    self.policy.concurrency
                );
                let entry = Arc::new(self.build_entry(host));
                entry.bucket.start();
                slot.insert(entry).clone()
            }
        }
    }

    /// Reconstruct host structures from a persisted snapshot and start
    /// their buckets. Hosts present in either map are restored; missing
    /// halves fall back to the configured policy.
    pub(crate) fn restore(&self, state: &EngineState) {
        let hosts: std::collections::HashSet<&String> =
            state.buckets.keys().chain(state.breakers.keys()).collect();
        for name in hosts {
            let host = HostKey::from(name.clone());
            let entry = self.ensure(&host);
            if let Some(snapshot) = state.buckets.get(name) {
                entry.bucket.set_rate(snapshot.rate);
                if snapshot.start_t_offset > 0.0 {
                    entry
                        .bucket
                        .backdate_start(Duration::from_secs_f64(snapshot.start_t_offset));
                }
                if snapshot.cooldown_until > 0.0 {
                    entry.bucket.raise_cooldown(
                        Instant::now() + Duration::from_secs_f64(snapshot.cooldown_until),
                    );
                }
            }
            if let Some(snapshot) = state.breakers.get(name) {
                entry.breaker.restore(
                    snapshot.failures,
                    Duration::from_secs_f64(snapshot.cooldown_until.max(0.0)),
                    Duration::from_secs_f64(snapshot.last_failure.max(0.0)),
                );
            }
        }
    }

    /// Snapshot every host's bucket and breaker for persistence.
    pub(crate) fn snapshot(&self) -> EngineState {
        let mut state = EngineState::default();
        for entry in &self.hosts {
            let name = entry.key().to_string();
            let bucket = &entry.value().bucket;
            state.buckets.insert(
                name.clone(),
                BucketState {
                    rate: bucket.rate(),
                    cooldown_until: bucket.cooldown_remaining().as_secs_f64(),
                    start_t_offset: bucket
                        .elapsed_since_start()
                        .map_or(0.0, |elapsed| elapsed.as_secs_f64()),
                },
            );
            let breaker = &entry.value().breaker;
            state.breakers.insert(
                name,
                BreakerState {
                    failures: breaker.failures(),
                    cooldown_until: breaker.cooldown_remaining().as_secs_f64(),
                    last_failure: breaker
                        .last_failure_age()
                        .map_or(0.0, |age| age.as_secs_f64()),
                },
            );
        }
        state
    }

    /// Stop all bucket producers concurrently.
    pub(crate) async fn stop_all(&self) {
        let buckets: Vec<Arc<TokenBucket>> = self
            .hosts
            .iter()
            .map(|entry| entry.value().bucket.clone())
            .collect();
        join_all(buckets.iter().map(|bucket| bucket.stop())).await;
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.hosts.len()
    }

    fn build_entry(&self, host: &HostKey) -> HostEntry {
        HostEntry {
            bucket: Arc::new(TokenBucket::new(
                host.clone(),
                self.policy.rate,
                self.policy.burst,
                BUCKET_JITTER_RATIO,
                self.policy.ramp_up,
            )),
            breaker: CircuitBreaker::new(
                self.policy.failure_threshold,
                self.policy.breaker_cooldown,
            ),
            semaphore: Semaphore::new(self.policy.concurrency),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool() -> HostPool {
        HostPool::new(
            HostPolicy {
                rate: 1.0,
                burst: 2,
                ramp_up: Duration::ZERO,
                concurrency: 2,
                failure_threshold: 5,
                breaker_cooldown: Duration::from_secs(60),
            },
            10,
        )
    }

    #[tokio::test]
    async fn test_ensure_creates_once() {
        let pool = pool();
        assert_eq!(pool.len(), 0);

        let first = pool.ensure(&HostKey::from("a.test"));
        let second = pool.ensure(&HostKey::from("a.test"));
        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));

        pool.ensure(&HostKey::from("b.test"));
        assert_eq!(pool.len(), 2);
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_restore_applies_bucket_rate() {
        let pool = pool();
        let state = EngineState {
            buckets: HashMap::from([(
                "h.test".to_string(),
                BucketState {
                    rate: 0.4,
                    cooldown_until: 0.0,
                    start_t_offset: 5.0,
                },
            )]),
            breakers: HashMap::from([(
                "h.test".to_string(),
                BreakerState {
                    failures: 2,
                    cooldown_until: 0.0,
                    last_failure: 3.0,
                },
            )]),
        };
        pool.restore(&state);

        let entry = pool.ensure(&HostKey::from("h.test"));
        assert!((entry.bucket.rate() - 0.4).abs() < f64::EPSILON);
        assert_eq!(entry.breaker.failures(), 2);
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_snapshot_contains_all_hosts() {
        let pool = pool();
        pool.ensure(&HostKey::from("a.test"));
        pool.ensure(&HostKey::from("b.test"));

        let state = pool.snapshot();
        assert_eq!(state.buckets.len(), 2);
        assert_eq!(state.breakers.len(), 2);
        assert!((state.buckets["a.test"].rate - 1.0).abs() < f64::EPSILON);
        pool.stop_all().await;
    }
}
