//! End-to-end engine tests against a controllable mock HTTP layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use drizzler_lib::{
    mock_server, DrizzlerBuilder, HostKey, MetricsSink, ProgressSink, RunStats, ShutdownFlag,
    StateStore,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mount a catch-all GET responder on `server`.
async fn respond_with(server: &MockServer, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .respond_with(template)
        .mount(server)
        .await;
}

/// Metrics sink capturing the snapshot it was handed.
#[derive(Default)]
struct CapturingMetrics {
    calls: AtomicUsize,
    snapshot: std::sync::Mutex<Option<RunStats>>,
}

impl MetricsSink for CapturingMetrics {
    fn record(&self, stats: &RunStats) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.snapshot.lock().unwrap() = Some(stats.clone());
    }
}

#[tokio::test]
async fn test_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    for server in [&server_a, &server_b] {
        respond_with(
            server,
            ResponseTemplate::new(200).set_delay(Duration::from_millis(10)),
        )
        .await;
    }

    let urls = [
        format!("{}/1", server_a.uri()),
        format!("{}/2", server_a.uri()),
        format!("{}/1", server_b.uri()),
    ];
    let metrics = Arc::new(CapturingMetrics::default());
    let engine = DrizzlerBuilder::builder()
        .per_host_rate(100.0)
        .slow_start_ramp_up_s(0.0)
        .state_file(dir.path().join("state.json"))
        .metrics(metrics.clone() as Arc<dyn MetricsSink>)
        .build()
        .engine(&urls)
        .unwrap();
    let stats = engine.run().await;

    assert_eq!(stats.total, 3);
    assert_eq!(stats.success, 3);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.status_counts, HashMap::from([(200, 3)]));
    assert!(stats.mean.unwrap() >= 0.008, "mean = {:?}", stats.mean);

    // The metrics sink saw the same snapshot exactly once
    assert_eq!(metrics.calls.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.snapshot.lock().unwrap().as_ref(), Some(&stats));

    // Exactly one timeline segment per URL, grouped by logical host
    let timeline = engine.timeline();
    let segments: Vec<_> = timeline.values().flatten().collect();
    assert_eq!(segments.len(), 3);
    let host_a = HostKey::classify(&server_a.uri());
    let host_b = HostKey::classify(&server_b.uri());
    assert_eq!(segments.iter().filter(|s| s.host == host_a).count(), 2);
    assert_eq!(segments.iter().filter(|s| s.host == host_b).count(), 1);
    for segment in &segments {
        assert!(segment.end >= segment.start);
        assert_eq!(segment.status, Some(200));
    }
}

#[tokio::test]
async fn test_empty_batch_returns_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let engine = DrizzlerBuilder::builder()
        .state_file(dir.path().join("state.json"))
        .build()
        .engine(Vec::<String>::new())
        .unwrap();
    let stats = engine.run().await;

    assert_eq!(stats.total, 0);
    assert_eq!(stats.error_rate, 0.0);
    assert_eq!(stats.mean, None);
    assert!(engine.timeline().is_empty());
    assert!(dir.path().join("state.json").exists());
}

#[tokio::test]
async fn test_transient_429_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    // Two throttled responses, then the mock expires and the 200 below
    // takes over
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    respond_with(&server, ResponseTemplate::new(200)).await;

    let engine = DrizzlerBuilder::builder()
        .per_host_rate(100.0)
        .slow_start_ramp_up_s(0.0)
        .max_retries(3usize)
        .state_file(dir.path().join("state.json"))
        .build()
        .engine([server.uri()])
        .unwrap();
    let started = Instant::now();
    let stats = engine.run().await;

    // Two Retry-After sleeps of one second each
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(stats.success, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.status_counts, HashMap::from([(429, 2), (200, 1)]));

    // Rate dropped twice; the late success earns no first-try reward
    let state = StateStore::new(dir.path().join("state.json")).load();
    let host = HostKey::classify(&server.uri());
    let rate = state.buckets[host.as_str()].rate;
    assert!((rate - 64.0).abs() < 1e-6, "rate = {rate}");
    assert_eq!(state.breakers[host.as_str()].failures, 0);
}

#[tokio::test]
async fn test_retry_after_hint_delays_success() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2.5"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    respond_with(&server, ResponseTemplate::new(200)).await;

    let engine = DrizzlerBuilder::builder()
        .per_host_rate(100.0)
        .slow_start_ramp_up_s(0.0)
        .max_retries(3usize)
        .state_file(dir.path().join("state.json"))
        .build()
        .engine([server.uri()])
        .unwrap();
    let started = Instant::now();
    let stats = engine.run().await;

    assert!(started.elapsed() >= Duration::from_secs_f64(2.5));
    assert_eq!(stats.success, 1);
    assert_eq!(stats.status_counts, HashMap::from([(429, 1), (200, 1)]));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let state = StateStore::new(dir.path().join("state.json")).load();
    let host = HostKey::classify(&server.uri());
    assert_eq!(state.breakers[host.as_str()].failures, 0);
}

#[tokio::test]
async fn test_throttle_without_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    respond_with(&server, ResponseTemplate::new(429)).await;

    let engine = DrizzlerBuilder::builder()
        .per_host_rate(100.0)
        .slow_start_ramp_up_s(0.0)
        .max_retries(1usize)
        .state_file(dir.path().join("state.json"))
        .build()
        .engine([server.uri()])
        .unwrap();
    let stats = engine.run().await;

    // Exactly one attempt: no retry budget left
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.success, 0);
    assert_eq!(stats.status_counts, HashMap::from([(429, 1)]));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let state = StateStore::new(dir.path().join("state.json")).load();
    let host = HostKey::classify(&server.uri());
    assert!((state.buckets[host.as_str()].rate - 80.0).abs() < 1e-6);
    assert_eq!(state.breakers[host.as_str()].failures, 1);

    let timeline = engine.timeline();
    let segment = timeline.values().flatten().next().unwrap();
    assert_eq!(segment.status, Some(429));
}

#[tokio::test]
async fn test_breaker_trips_after_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let server = mock_server!(503u16);

    let urls: Vec<String> = (0..6).map(|i| format!("{}/{i}", server.uri())).collect();
    let engine = DrizzlerBuilder::builder()
        .per_host_rate(100.0)
        .slow_start_ramp_up_s(0.0)
        .max_retries(1usize)
        .global_concurrency(1usize)
        .state_file(dir.path().join("state.json"))
        .build()
        .engine(&urls)
        .unwrap();
    let stats = engine.run().await;

    assert_eq!(stats.total, 6);
    assert_eq!(stats.success, 0);
    assert_eq!(stats.errors, 6);
    // The sixth URL is breaker-blocked: no network attempt, no status
    assert_eq!(stats.status_counts, HashMap::from([(503, 5)]));
    assert_eq!(server.received_requests().await.unwrap().len(), 5);

    let timeline = engine.timeline();
    let blocked: Vec<_> = timeline
        .values()
        .flatten()
        .filter(|s| s.status.is_none())
        .collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].start, blocked[0].end);
}

#[tokio::test]
async fn test_dedup_preserves_first_seen_order() {
    let dir = tempfile::tempdir().unwrap();
    let server = mock_server!(200u16);

    let u = format!("{}/u", server.uri());
    let v = format!("{}/v", server.uri());
    let engine = DrizzlerBuilder::builder()
        .per_host_rate(100.0)
        .slow_start_ramp_up_s(0.0)
        .state_file(dir.path().join("state.json"))
        .build()
        .engine([u.clone(), u.clone(), v.clone(), u.clone()])
        .unwrap();

    assert_eq!(engine.urls(), [u, v]);
    let stats = engine.run().await;
    assert_eq!(stats.total, 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_restored_rate_survives_config_change() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let server = MockServer::start().await;
    let host = HostKey::classify(&server.uri());

    // First run: one non-retryable failure leaves the configured rate
    // untouched and persists it
    respond_with(&server, ResponseTemplate::new(404)).await;
    let engine = DrizzlerBuilder::builder()
        .per_host_rate(0.4)
        .slow_start_ramp_up_s(0.0)
        .state_file(state_file.clone())
        .build()
        .engine([server.uri()])
        .unwrap();
    let stats = engine.run().await;
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.status_counts, HashMap::from([(404, 1)]));

    let state = StateStore::new(state_file.clone()).load();
    assert!((state.buckets[host.as_str()].rate - 0.4).abs() < 1e-6);

    // Second run configures a higher rate, but the restored bucket keeps
    // the learned one; the first-try success multiplies it by 1.05
    server.reset().await;
    respond_with(&server, ResponseTemplate::new(200)).await;
    let engine = DrizzlerBuilder::builder()
        .per_host_rate(1.0)
        .slow_start_ramp_up_s(0.0)
        .state_file(state_file.clone())
        .build()
        .engine([server.uri()])
        .unwrap();
    let stats = engine.run().await;
    assert_eq!(stats.success, 1);

    let state = StateStore::new(state_file).load();
    let rate = state.buckets[host.as_str()].rate;
    assert!((rate - 0.42).abs() < 1e-6, "rate = {rate}");
}

#[tokio::test]
async fn test_transport_failure_counts_as_error() {
    let dir = tempfile::tempdir().unwrap();
    // Take a port from a live server, then shut it down
    let server = MockServer::start().await;
    let url = server.uri();
    drop(server);

    let engine = DrizzlerBuilder::builder()
        .per_host_rate(100.0)
        .slow_start_ramp_up_s(0.0)
        .max_retries(1usize)
        .request_timeout_s(2.0)
        .state_file(dir.path().join("state.json"))
        .build()
        .engine([url])
        .unwrap();
    let stats = engine.run().await;

    assert_eq!(stats.errors, 1);
    assert_eq!(stats.success, 0);
    assert!(stats.status_counts.is_empty());

    let timeline = engine.timeline();
    let segment = timeline.values().flatten().next().unwrap();
    assert_eq!(segment.status, None);
}

/// Progress sink that raises the shutdown flag after a fixed number of
/// completions.
#[derive(Default)]
struct ShutdownAfter {
    completions: AtomicUsize,
    at: usize,
    flag: OnceLock<ShutdownFlag>,
}

impl ProgressSink for ShutdownAfter {
    fn url_completed(&self, _url: &str) {
        if self.completions.fetch_add(1, Ordering::SeqCst) + 1 == self.at {
            if let Some(flag) = self.flag.get() {
                flag.trigger();
            }
        }
    }
}

#[tokio::test]
async fn test_graceful_shutdown_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    respond_with(
        &server,
        ResponseTemplate::new(200).set_delay(Duration::from_millis(10)),
    )
    .await;

    let urls: Vec<String> = (0..100).map(|i| format!("{}/{i}", server.uri())).collect();
    let sink = Arc::new(ShutdownAfter {
        at: 10,
        ..ShutdownAfter::default()
    });
    let engine = DrizzlerBuilder::builder()
        .per_host_rate(1000.0)
        .per_host_concurrency(4usize)
        .global_concurrency(4usize)
        .slow_start_ramp_up_s(0.0)
        .progress(sink.clone() as Arc<dyn ProgressSink>)
        .state_file(dir.path().join("state.json"))
        .build()
        .engine(&urls)
        .unwrap();
    sink.flag.set(engine.shutdown_flag()).unwrap();

    let stats = engine.run().await;

    // Everything in flight at the signal may still land; nothing new starts
    assert!(stats.total >= 10, "total = {}", stats.total);
    assert!(stats.total <= 14, "total = {}", stats.total);
    assert!(server.received_requests().await.unwrap().len() <= 14);
    assert!(dir.path().join("state.json").exists());
    for segment in engine.timeline().values().flatten() {
        assert!(segment.end >= segment.start);
    }
}
