use std::path::PathBuf;

use clap::Parser;
use drizzler_lib::{
    DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_JITTER_RATIO, DEFAULT_GLOBAL_CONCURRENCY,
    DEFAULT_MAX_RETRIES, DEFAULT_PER_HOST_BURST, DEFAULT_PER_HOST_CONCURRENCY,
    DEFAULT_PER_HOST_RATE, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SLOW_START_RAMP_UP_SECS,
    DEFAULT_STATE_FILE,
};

const DEFAULT_HISTOGRAM_BINS: usize = 20;
const DEFAULT_TIMELINE_WIDTH: usize = 80;

/// Adaptive HTTP fetcher with host-aware throttling
#[derive(Parser, Debug)]
#[command(name = "drizzler", version, about)]
pub(crate) struct Options {
    /// URLs to fetch
    #[arg(required_unless_present = "input_file")]
    pub(crate) urls: Vec<String>,

    /// Read additional URLs from a file, one per line ('#' starts a comment)
    #[arg(long, value_name = "FILE")]
    pub(crate) input_file: Option<PathBuf>,

    /// Per-host rate limit in requests per second
    #[arg(long, default_value_t = DEFAULT_PER_HOST_RATE)]
    pub(crate) rate: f64,

    /// Per-host burst capacity
    #[arg(long, default_value_t = DEFAULT_PER_HOST_BURST)]
    pub(crate) burst: usize,

    /// Concurrent requests per host
    #[arg(long, default_value_t = DEFAULT_PER_HOST_CONCURRENCY)]
    pub(crate) host_concurrency: usize,

    /// Global concurrency (also the worker pool size)
    #[arg(short = 'c', long, default_value_t = DEFAULT_GLOBAL_CONCURRENCY)]
    pub(crate) concurrency: usize,

    /// Request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub(crate) timeout: f64,

    /// Maximum attempts per URL
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub(crate) max_retries: usize,

    /// Base backoff delay in seconds
    #[arg(long, default_value_t = DEFAULT_BACKOFF_BASE_SECS)]
    pub(crate) backoff_base: f64,

    /// Proportional jitter applied to backoff delays
    #[arg(long, default_value_t = DEFAULT_BACKOFF_JITTER_RATIO)]
    pub(crate) backoff_jitter: f64,

    /// Slow-start ramp-up window in seconds
    #[arg(long, default_value_t = DEFAULT_SLOW_START_RAMP_UP_SECS)]
    pub(crate) ramp_up: f64,

    /// Keep duplicate URLs instead of deduplicating them
    #[arg(long)]
    pub(crate) no_dedup: bool,

    /// Path of the persisted engine state
    #[arg(long, value_name = "FILE", default_value = DEFAULT_STATE_FILE)]
    pub(crate) state_file: PathBuf,

    /// Number of latency histogram bins
    #[arg(long, default_value_t = DEFAULT_HISTOGRAM_BINS)]
    pub(crate) histogram_bins: usize,

    /// Width of the rendered per-worker timeline
    #[arg(long, default_value_t = DEFAULT_TIMELINE_WIDTH)]
    pub(crate) timeline_width: usize,

    /// Do not show a progress bar while fetching
    #[arg(long)]
    pub(crate) no_progress: bool,

    /// Print the final statistics as JSON instead of rendering
    #[arg(long)]
    pub(crate) json: bool,

    /// Enable debug-level logging
    #[arg(long)]
    pub(crate) debug: bool,
}
