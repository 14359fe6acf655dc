use std::time::Duration;

use http::header::{self, HeaderMap};
use rand::Rng;

/// Lower bound for a single backoff sleep
const MIN_BACKOFF: Duration = Duration::from_millis(50);

/// Exponential backoff with proportional jitter.
///
/// Attempt `k` (1-indexed) sleeps `max(0.05, base * 2^(k-1) * U)` seconds,
/// with `U` uniform in `[1 - jitter_ratio, 1 + jitter_ratio]`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base delay for the first retry
    pub backoff_base: Duration,
    /// Proportional jitter applied to every computed delay, in `[0, 1)`
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Compute the backoff delay before retry number `attempt + 1`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let base = self.backoff_base.as_secs_f64() * 2f64.powi(exponent);
        let mut rng = rand::rng();
        let jitter = 1.0 + rng.random_range(-self.jitter_ratio..=self.jitter_ratio);
        Duration::from_secs_f64(base * jitter).max(MIN_BACKOFF)
    }
}

/// Extract a `Retry-After` hint from response headers.
///
/// Only the delay-seconds form is recognized; negative values clamp to zero
/// and HTTP-date values are ignored.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(secs.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_secs(1),
            jitter_ratio: 0.2,
        };
        for attempt in 1..=4 {
            let nominal = 2f64.powi(attempt - 1);
            #[allow(clippy::cast_sign_loss)]
            let delay = policy.backoff_delay(attempt as usize).as_secs_f64();
            assert!(delay >= nominal * 0.8 - f64::EPSILON, "attempt {attempt}: {delay}");
            assert!(delay <= nominal * 1.2 + f64::EPSILON, "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn test_backoff_floor() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(1),
            jitter_ratio: 0.0,
        };
        assert!(policy.backoff_delay(1) >= MIN_BACKOFF);
    }

    #[test]
    fn test_retry_after_seconds() {
        assert_eq!(
            retry_after(&headers_with("2")),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            retry_after(&headers_with("2.5")),
            Some(Duration::from_secs_f64(2.5))
        );
    }

    #[test]
    fn test_retry_after_negative_clamps_to_zero() {
        assert_eq!(retry_after(&headers_with("-1")), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_http_date_is_ignored() {
        assert_eq!(retry_after(&headers_with("Fri, 15 May 2015 15:34:21 GMT")), None);
    }

    #[test]
    fn test_retry_after_absent() {
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }
}
