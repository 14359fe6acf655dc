//! Per-attempt request header synthesis.
//!
//! Every attempt gets a freshly rotated browser-like header set, merged over
//! any caller-provided defaults. Faking the user agent is necessary for some
//! websites, unfortunately; otherwise we get blocked by bot heuristics
//! before rate limiting even becomes a factor.

use http::header::{self, HeaderMap, HeaderValue};
use rand::Rng;

pub(crate) const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
];

const ACCEPT_LANGUAGES: &[&str] = &["en-US,en;q=0.9", "en-GB,en;q=0.8", "en;q=0.7"];

/// Build the header set for a single attempt.
///
/// The rotated values override same-named caller defaults; all other
/// defaults pass through untouched.
pub(crate) fn request_headers(defaults: &HeaderMap) -> HeaderMap {
    let mut rng = rand::rng();
    let user_agent = USER_AGENTS[rng.random_range(0..USER_AGENTS.len())];
    let accept_language = ACCEPT_LANGUAGES[rng.random_range(0..ACCEPT_LANGUAGES.len())];

    let mut headers = defaults.clone();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(user_agent));
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static(accept_language),
    );
    headers.insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_static("gzip, deflate, br"),
    );
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::UPGRADE_INSECURE_REQUESTS,
        HeaderValue::from_static("1"),
    );
    headers
}
