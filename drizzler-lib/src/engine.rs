use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future::join_all;
use http::header::HeaderMap;
use http::StatusCode;
use log::{debug, error, info, warn};
use tokio::time::{sleep, Instant};
use typed_builder::TypedBuilder;

use crate::headers;
use crate::pool::{HostPolicy, HostPool};
use crate::retry::{self, RetryPolicy};
use crate::state::StateStore;
use crate::stats::{compute_stats, MetricsSink, ProgressSink, RunStats};
use crate::timeline::{Timeline, TimelineSegment};
use crate::{ErrorKind, HostKey, Result, ShutdownFlag};

/// Default per-host target rate in requests per second
pub const DEFAULT_PER_HOST_RATE: f64 = 1.0;
/// Default per-host burst capacity
pub const DEFAULT_PER_HOST_BURST: usize = 2;
/// Default per-host concurrency cap
pub const DEFAULT_PER_HOST_CONCURRENCY: usize = 2;
/// Default global concurrency ceiling (also the worker pool size)
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 10;
/// Default per-request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 30.0;
/// Default maximum number of attempts per URL
pub const DEFAULT_MAX_RETRIES: usize = 5;
/// Default base backoff in seconds
pub const DEFAULT_BACKOFF_BASE_SECS: f64 = 1.0;
/// Default proportional backoff jitter
pub const DEFAULT_BACKOFF_JITTER_RATIO: f64 = 0.2;
/// Default slow-start ramp-up window in seconds
pub const DEFAULT_SLOW_START_RAMP_UP_SECS: f64 = 15.0;
/// Default breaker failure threshold
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default breaker cooldown window in seconds
pub const DEFAULT_BREAKER_COOLDOWN_SECS: f64 = 60.0;
/// Default state file path
pub const DEFAULT_STATE_FILE: &str = "drizzler_state.json";

/// Options for building a [`Drizzler`] engine.
///
/// ```
/// use drizzler_lib::DrizzlerBuilder;
///
/// # fn main() -> drizzler_lib::Result<()> {
/// let engine = DrizzlerBuilder::builder()
///     .per_host_rate(2.0)
///     .global_concurrency(4usize)
///     .build()
///     .engine(["https://example.com/a", "https://example.com/b"])?;
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct DrizzlerBuilder {
    /// Target rate per logical host, in requests per second
    #[builder(default = DEFAULT_PER_HOST_RATE)]
    per_host_rate: f64,
    /// Permits a bucket may pre-accumulate while idle
    #[builder(default = DEFAULT_PER_HOST_BURST)]
    per_host_burst: usize,
    /// Concurrent requests allowed per logical host
    #[builder(default = DEFAULT_PER_HOST_CONCURRENCY)]
    per_host_concurrency: usize,
    /// Concurrent requests allowed across all hosts; also the number of
    /// workers draining the queue
    #[builder(default = DEFAULT_GLOBAL_CONCURRENCY)]
    global_concurrency: usize,
    /// Per-request timeout in seconds, covering the full body read
    #[builder(default = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout_s: f64,
    /// Maximum attempts per URL (first attempt included)
    #[builder(default = DEFAULT_MAX_RETRIES)]
    max_retries: usize,
    /// Base backoff delay in seconds
    #[builder(default = DEFAULT_BACKOFF_BASE_SECS)]
    backoff_base_s: f64,
    /// Proportional jitter applied to backoff delays
    #[builder(default = DEFAULT_BACKOFF_JITTER_RATIO)]
    backoff_jitter_ratio: f64,
    /// Slow-start ramp-up window in seconds
    #[builder(default = DEFAULT_SLOW_START_RAMP_UP_SECS)]
    slow_start_ramp_up_s: f64,
    /// Breaker failure threshold per logical host
    #[builder(default = DEFAULT_FAILURE_THRESHOLD)]
    failure_threshold: u32,
    /// Breaker cooldown window in seconds
    #[builder(default = DEFAULT_BREAKER_COOLDOWN_SECS)]
    breaker_cooldown_s: f64,
    /// Deduplicate the input URL list, preserving first-seen order
    #[builder(default = true)]
    deduplicate: bool,
    /// Headers sent with every request; overridden per attempt by the
    /// rotating header set
    default_headers: HeaderMap,
    /// Path of the persisted engine state
    #[builder(default = PathBuf::from(DEFAULT_STATE_FILE))]
    state_file: PathBuf,
    /// Sink invoked after each terminated URL
    progress: Option<Arc<dyn ProgressSink>>,
    /// Sink invoked once with the final statistics snapshot
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl Default for DrizzlerBuilder {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for DrizzlerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrizzlerBuilder")
            .field("per_host_rate", &self.per_host_rate)
            .field("per_host_burst", &self.per_host_burst)
            .field("per_host_concurrency", &self.per_host_concurrency)
            .field("global_concurrency", &self.global_concurrency)
            .field("request_timeout_s", &self.request_timeout_s)
            .field("max_retries", &self.max_retries)
            .field("deduplicate", &self.deduplicate)
            .field("state_file", &self.state_file)
            .finish_non_exhaustive()
    }
}

impl DrizzlerBuilder {
    /// Instantiate the engine for a batch of URLs.
    ///
    /// Surrounding whitespace is trimmed from every URL; when
    /// `deduplicate` is set, repeated URLs are dropped preserving
    /// first-seen order.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn engine<I, S>(&self, urls: I) -> Result<Drizzler>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls: Vec<String> = urls
            .into_iter()
            .map(|url| url.as_ref().trim().to_string())
            .collect();
        let urls = if self.deduplicate {
            dedup_preserving_order(urls)
        } else {
            urls
        };

        // The pool must never gate below the engine's own concurrency
        // ceiling, so the global semaphore stays the only global limit.
        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .timeout(Duration::from_secs_f64(self.request_timeout_s))
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(self.global_concurrency)
            .build()
            .map_err(ErrorKind::BuildRequestClient)?;

        let pool = HostPool::new(
            HostPolicy {
                rate: self.per_host_rate,
                burst: self.per_host_burst,
                ramp_up: Duration::from_secs_f64(self.slow_start_ramp_up_s),
                concurrency: self.per_host_concurrency,
                failure_threshold: self.failure_threshold,
                breaker_cooldown: Duration::from_secs_f64(self.breaker_cooldown_s),
            },
            self.global_concurrency,
        );

        info!(
            "Initialized drizzler with {} URLs, global_concurrency={}, per_host_rate={}",
            urls.len(),
            self.global_concurrency,
            self.per_host_rate
        );

        Ok(Drizzler {
            urls,
            global_concurrency: self.global_concurrency,
            max_retries: self.max_retries,
            default_headers: self.default_headers.clone(),
            policy: RetryPolicy {
                backoff_base: Duration::from_secs_f64(self.backoff_base_s),
                jitter_ratio: self.backoff_jitter_ratio,
            },
            client,
            pool,
            state: StateStore::new(self.state_file.clone()),
            shutdown: ShutdownFlag::new(),
            recorder: Mutex::new(Recorder::default()),
            t0: OnceLock::new(),
            progress: self.progress.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

/// The fetch engine: a batch of URLs, the per-host throttling structures,
/// and the per-run counters.
///
/// An instance is single-use: call [`run`](Self::run) once and read the
/// returned snapshot (plus [`timeline`](Self::timeline) /
/// [`latencies`](Self::latencies) for rendering). Instances must not be
/// shared across concurrent runs.
pub struct Drizzler {
    urls: Vec<String>,
    global_concurrency: usize,
    max_retries: usize,
    default_headers: HeaderMap,
    policy: RetryPolicy,
    client: reqwest::Client,
    pool: HostPool,
    state: StateStore,
    shutdown: ShutdownFlag,
    recorder: Mutex<Recorder>,
    t0: OnceLock<Instant>,
    progress: Option<Arc<dyn ProgressSink>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for Drizzler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drizzler")
            .field("urls", &self.urls.len())
            .field("global_concurrency", &self.global_concurrency)
            .field("max_retries", &self.max_retries)
            .field("state_file", &self.state.path())
            .finish_non_exhaustive()
    }
}

/// Per-run mutable state. One lock keeps each mutation atomic; it is never
/// held across a suspension point.
#[derive(Debug, Default)]
struct Recorder {
    latencies: Vec<f64>,
    success: usize,
    errors: usize,
    status_counts: HashMap<u16, usize>,
    timeline: Timeline,
}

/// One queued URL with its input index.
#[derive(Debug)]
struct UrlJob {
    index: usize,
    url: String,
}

/// Outcome of a single attempt: optional status, optional wall latency
/// (present only when the body was fully read), response headers.
#[derive(Debug)]
struct Attempt {
    status: Option<StatusCode>,
    latency: Option<Duration>,
    headers: HeaderMap,
}

impl Attempt {
    fn failed() -> Self {
        Attempt {
            status: None,
            latency: None,
            headers: HeaderMap::new(),
        }
    }
}

impl Drizzler {
    /// The effective URL batch after trimming and deduplication.
    #[must_use]
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// A handle to the engine's shutdown flag, e.g. for tests or embedding
    /// callers that manage their own signals.
    #[must_use]
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Latencies of all successful requests, in seconds.
    #[must_use]
    pub fn latencies(&self) -> Vec<f64> {
        self.recorder.lock().unwrap().latencies.clone()
    }

    /// The per-worker timeline recorded so far.
    #[must_use]
    pub fn timeline(&self) -> Timeline {
        self.recorder.lock().unwrap().timeline.clone()
    }

    /// Drain the URL batch and return the final statistics snapshot.
    ///
    /// Restores persisted host state, starts buckets, spawns the worker
    /// pool, and on completion (or graceful shutdown) persists state and
    /// aggregates statistics. Per-request failures never escape; a state
    /// persistence failure is logged and swallowed.
    pub async fn run(&self) -> RunStats {
        info!("Starting drizzler run...");

        let restored = self.state.load();
        self.pool.restore(&restored);

        // Eager host initialization for everything already in the batch;
        // hosts discovered mid-run are created lazily by the pipeline.
        for url in &self.urls {
            self.pool.ensure(&HostKey::classify(url));
        }

        let queue: Mutex<VecDeque<UrlJob>> = Mutex::new(
            self.urls
                .iter()
                .enumerate()
                .map(|(index, url)| UrlJob {
                    index,
                    url: url.clone(),
                })
                .collect(),
        );

        let _ = self.t0.set(Instant::now());
        self.shutdown.listen_for_signals();

        info!(
            "Starting {} requests with {} workers",
            self.urls.len(),
            self.global_concurrency
        );
        join_all((0..self.global_concurrency).map(|id| self.worker(id, &queue))).await;

        // Persist state before stopping the buckets, so cooldowns and ramp
        // offsets are captured live.
        if let Err(err) = self.state.save(&self.pool.snapshot()) {
            error!("Failed to save state: {err}");
        }
        self.pool.stop_all().await;

        let stats = {
            let recorder = self.recorder.lock().unwrap();
            compute_stats(
                &recorder.latencies,
                recorder.success,
                recorder.errors,
                recorder.status_counts.clone(),
            )
        };
        if let Some(metrics) = &self.metrics {
            metrics.record(&stats);
        }
        info!(
            "Run completed: {} successes, {} errors, error_rate={:.2}%",
            stats.success,
            stats.errors,
            stats.error_rate * 100.0
        );
        stats
    }

    async fn worker(&self, worker_id: usize, queue: &Mutex<VecDeque<UrlJob>>) {
        loop {
            if self.shutdown.is_set() {
                break;
            }
            let job = queue.lock().unwrap().pop_front();
            let Some(job) = job else { break };
            debug!("[W{worker_id}] Dequeued #{} {}", job.index, job.url);
            self.fetch_with_policy(&job.url, worker_id).await;
            if self.shutdown.is_set() {
                break;
            }
            if let Some(progress) = &self.progress {
                progress.url_completed(&job.url);
            }
        }
        debug!("Worker {worker_id} stopped");
    }

    /// The per-URL state machine: breaker gate, concurrency gates, token,
    /// attempt loop with retry/backoff, outcome recording.
    async fn fetch_with_policy(&self, url: &str, worker_id: usize) {
        let host = HostKey::classify(url);
        let entry = self.pool.ensure(&host);

        if !entry.breaker.can_attempt() {
            warn!("[W{worker_id}] Circuit breaker OPEN for {host}, skipping {url}");
            let now_rel = self.since_start(Instant::now());
            let mut recorder = self.recorder.lock().unwrap();
            recorder.errors += 1;
            recorder
                .timeline
                .entry(worker_id)
                .or_default()
                .push(TimelineSegment {
                    start: now_rel,
                    end: now_rel,
                    host,
                    status: None,
                });
            return;
        }

        // Gate nesting: global, then host, then token. Permits release in
        // reverse on every exit path; the token is only consumed once the
        // request is no longer stalled by concurrency caps.
        let _global = self
            .pool
            .global()
            .acquire()
            .await
            // SAFETY: this should not panic as we never close the semaphore
            .expect("Global semaphore was closed unexpectedly");
        let _host_permit = entry
            .semaphore
            .acquire()
            .await
            // SAFETY: this should not panic as we never close the semaphore
            .expect("Host semaphore was closed unexpectedly");
        debug!("[W{worker_id}] Acquiring token for {host}");
        entry.bucket.acquire().await;

        let started = Instant::now();
        let mut last_status: Option<StatusCode> = None;

        for attempt in 1..=self.max_retries {
            if self.shutdown.is_set() {
                info!("[W{worker_id}] Graceful shutdown requested. Aborting {url}");
                return;
            }

            debug!("[W{worker_id}] Attempt {attempt} for {url}");
            let outcome = self.fetch_once(url).await;
            last_status = outcome.status;

            if let Some(status) = outcome.status {
                let mut recorder = self.recorder.lock().unwrap();
                *recorder.status_counts.entry(status.as_u16()).or_default() += 1;
            }

            if let (Some(status), Some(latency)) = (outcome.status, outcome.latency) {
                if (200..400).contains(&status.as_u16()) {
                    let start_rel = self.since_start(started);
                    {
                        let mut recorder = self.recorder.lock().unwrap();
                        recorder.success += 1;
                        recorder.latencies.push(latency.as_secs_f64());
                        recorder
                            .timeline
                            .entry(worker_id)
                            .or_default()
                            .push(TimelineSegment {
                                start: start_rel,
                                end: start_rel + latency.as_secs_f64(),
                                host,
                                status: Some(status.as_u16()),
                            });
                    }
                    entry.breaker.record_success();
                    if attempt == 1 {
                        entry.bucket.adjust_rate(1.05);
                    }
                    info!(
                        "[W{worker_id}] Success {url} ({:.3}s, status={status})",
                        latency.as_secs_f64()
                    );
                    return;
                }
            }

            let mut should_retry = false;
            if retryable(outcome.status) {
                entry.breaker.record_failure();
                entry.bucket.adjust_rate(0.8);
                let hint = retry::retry_after(&outcome.headers).filter(|d| !d.is_zero());
                if let Some(hint) = hint {
                    warn!(
                        "[W{worker_id}] Retry-After: {:.1}s for {url}",
                        hint.as_secs_f64()
                    );
                    entry.bucket.raise_cooldown(Instant::now() + hint);
                    sleep(hint).await;
                    should_retry = true;
                } else if attempt < self.max_retries {
                    let delay = self.policy.backoff_delay(attempt);
                    debug!(
                        "[W{worker_id}] Backing off {:.2}s before retry {}",
                        delay.as_secs_f64(),
                        attempt + 1
                    );
                    sleep(delay).await;
                    should_retry = true;
                }
            }
            if !should_retry {
                break;
            }
        }

        // All attempts exhausted (or the status was not worth retrying)
        let start_rel = self.since_start(started);
        let end_rel = self.since_start(Instant::now());
        {
            let mut recorder = self.recorder.lock().unwrap();
            recorder.errors += 1;
            recorder
                .timeline
                .entry(worker_id)
                .or_default()
                .push(TimelineSegment {
                    start: start_rel,
                    end: end_rel,
                    host,
                    status: last_status.map(|status| status.as_u16()),
                });
        }
        warn!(
            "[W{worker_id}] Failed {url} after {} attempt(s). Last status: {:?}",
            self.max_retries, last_status
        );
    }

    /// Issue a single GET and fully read the body.
    ///
    /// Wall latency spans from just before issue to just after the body
    /// read. Transport failures and timeouts yield a status-less outcome.
    async fn fetch_once(&self, url: &str) -> Attempt {
        let request_headers = headers::request_headers(&self.default_headers);
        let start = Instant::now();
        let response = match self.client.get(url).headers(request_headers).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                warn!("Timeout for {url}");
                return Attempt::failed();
            }
            Err(err) if err.is_connect() => {
                warn!("Connection error for {url}: {err}");
                return Attempt::failed();
            }
            Err(err) => {
                error!("Unexpected error fetching {url}: {err}");
                return Attempt::failed();
            }
        };
        let status = response.status();
        let headers = response.headers().clone();
        match response.bytes().await {
            Ok(body) => {
                let latency = start.elapsed();
                debug!("Fetched {url}: status={status}, size={} bytes", body.len());
                Attempt {
                    status: Some(status),
                    latency: Some(latency),
                    headers,
                }
            }
            Err(err) => {
                warn!("Error reading response body from {url}: {err}");
                Attempt::failed()
            }
        }
    }

    fn since_start(&self, instant: Instant) -> f64 {
        self.t0
            .get()
            .map_or(0.0, |t0| instant.duration_since(*t0).as_secs_f64())
    }
}

/// Whether an outcome is worth another attempt: throttle/unavailable
/// statuses and transport failures only.
fn retryable(status: Option<StatusCode>) -> bool {
    match status {
        None => true,
        Some(status) => matches!(status.as_u16(), 429 | 503),
    }
}

/// Drop repeated elements, keeping the first occurrence of each.
fn dedup_preserving_order(urls: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter().filter(|url| seen.insert(url.clone())).collect()
}
