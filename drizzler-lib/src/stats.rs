use std::collections::HashMap;

use serde::Serialize;

/// Statistics snapshot produced once at the end of a run.
///
/// Latency aggregates cover successful requests only; backoff sleeps and
/// failed attempts never contribute. Percentiles are nearest-rank on the
/// sorted sample, not interpolated. When no latency was recorded, the
/// numeric fields are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    /// Total number of terminated requests
    pub total: usize,
    /// Number of successful requests (status in `[200, 400)`)
    pub success: usize,
    /// Number of failed requests, including breaker-blocked ones
    pub errors: usize,
    /// Mean latency in seconds
    pub mean: Option<f64>,
    /// Population standard deviation of latency in seconds
    pub std: Option<f64>,
    /// 50th percentile latency in seconds
    pub p50: Option<f64>,
    /// 90th percentile latency in seconds
    pub p90: Option<f64>,
    /// 95th percentile latency in seconds
    pub p95: Option<f64>,
    /// 99th percentile latency in seconds
    pub p99: Option<f64>,
    /// Minimum latency in seconds
    pub min: Option<f64>,
    /// Maximum latency in seconds
    pub max: Option<f64>,
    /// `errors / total`, or 0.0 when no requests terminated
    pub error_rate: f64,
    /// Count of every observed status code, including intermediate ones
    /// across retries
    pub status_counts: HashMap<u16, usize>,
}

/// Sink invoked after each terminated URL.
///
/// Used by external progress UIs. Absence of a sink is indistinguishable
/// from a no-op sink; implementations must not affect engine correctness.
pub trait ProgressSink: Send + Sync {
    /// Called once per URL after it has been recorded as success or error.
    fn url_completed(&self, url: &str);
}

/// Sink invoked once with the final statistics snapshot.
pub trait MetricsSink: Send + Sync {
    /// Called exactly once at the end of a run.
    fn record(&self, stats: &RunStats);
}

/// Aggregate the recorded latencies and counters into a [`RunStats`].
pub(crate) fn compute_stats(
    latencies: &[f64],
    success: usize,
    errors: usize,
    status_counts: HashMap<u16, usize>,
) -> RunStats {
    let total = success + errors;
    log::debug!("Computing stats: total={total}, success={success}, errors={errors}");

    let error_rate = if total == 0 {
        0.0
    } else {
        errors as f64 / total as f64
    };

    let n = latencies.len();
    if n == 0 {
        if total > 0 {
            log::warn!("No successful latencies recorded");
        }
        return RunStats {
            total,
            success,
            errors,
            mean: None,
            std: None,
            p50: None,
            p90: None,
            p95: None,
            p99: None,
            min: None,
            max: None,
            error_rate,
            status_counts,
        };
    }

    #[allow(clippy::cast_precision_loss)]
    let count = n as f64;
    let mean = latencies.iter().sum::<f64>() / count;
    let sum_sq = latencies.iter().map(|x| x * x).sum::<f64>();
    let std = (sum_sq / count - mean * mean).max(0.0).sqrt();

    let mut sorted = latencies.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    // Nearest-rank percentile on the sorted sample
    let pct = |p: f64| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let idx = ((p * (count - 1.0)) as usize).min(n - 1);
        sorted[idx]
    };

    RunStats {
        total,
        success,
        errors,
        mean: Some(mean),
        std: Some(std),
        p50: Some(pct(0.50)),
        p90: Some(pct(0.90)),
        p95: Some(pct(0.95)),
        p99: Some(pct(0.99)),
        min: Some(sorted[0]),
        max: Some(sorted[n - 1]),
        error_rate,
        status_counts,
    }
}
