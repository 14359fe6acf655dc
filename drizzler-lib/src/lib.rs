//! `drizzler-lib` is the library component of `drizzler`, an adaptive,
//! host-aware concurrent HTTP fetch engine.
//!
//! Given a batch of URLs, the engine issues GET requests in parallel while
//! respecting per-host rate limits (token buckets with slow start and
//! adaptive rates), per-host and global concurrency caps, per-host circuit
//! breakers, bounded retries with exponential backoff, and `Retry-After`
//! hints. Learned rates and breaker positions persist across runs.
//!
//! ```no_run
//! use drizzler_lib::{DrizzlerBuilder, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let engine = DrizzlerBuilder::builder()
//!         .per_host_rate(2.0)
//!         .build()
//!         .engine(["https://example.com/a", "https://example.com/b"])?;
//!     let stats = engine.run().await;
//!     println!("{} ok, {} failed", stats.success, stats.errors);
//!     Ok(())
//! }
//! ```
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

mod engine;
mod error;
mod headers;
mod host;
mod pool;
mod retry;
mod shutdown;
mod state;
mod stats;
/// Per-host throttling primitives: token buckets and circuit breakers
pub mod throttle;
mod timeline;

#[doc(hidden)]
pub mod test_utils;

#[doc(inline)]
pub use crate::{
    // Constants get exposed so that the CLI can use the same defaults as
    // the library
    engine::{
        Drizzler, DrizzlerBuilder, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_JITTER_RATIO,
        DEFAULT_BREAKER_COOLDOWN_SECS, DEFAULT_FAILURE_THRESHOLD, DEFAULT_GLOBAL_CONCURRENCY,
        DEFAULT_MAX_RETRIES, DEFAULT_PER_HOST_BURST, DEFAULT_PER_HOST_CONCURRENCY,
        DEFAULT_PER_HOST_RATE, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SLOW_START_RAMP_UP_SECS,
        DEFAULT_STATE_FILE,
    },
    error::{ErrorKind, Result},
    host::{HostKey, DEFAULT_HOST},
    retry::RetryPolicy,
    shutdown::ShutdownFlag,
    state::{BreakerState, BucketState, EngineState, StateStore},
    stats::{MetricsSink, ProgressSink, RunStats},
    timeline::{Timeline, TimelineSegment},
};
