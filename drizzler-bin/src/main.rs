#![warn(clippy::all, clippy::pedantic)]

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use drizzler_lib::{Drizzler, DrizzlerBuilder, ProgressSink, RunStats};
use indicatif::{ProgressBar, ProgressStyle};

mod options;
mod render;

use crate::options::Options;

/// A C-like enum that can be cast to `i32` and used as process exit code.
enum ExitCode {
    Success = 0,
    #[allow(unused)]
    UnexpectedFailure = 1,
    FetchFailure = 2,
}

fn main() -> Result<()> {
    // std::process::exit doesn't guarantee that all destructors will be run,
    // therefore we wrap "main" code in another function to guarantee that.
    // See: https://doc.rust-lang.org/stable/std/process/fn.exit.html
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

fn run_main() -> Result<i32> {
    let opts = Options::parse();
    init_logging(&opts);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(&opts))
}

fn init_logging(opts: &Options) {
    let default_filter = if opts.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .format_timestamp_millis()
    .init();
}

async fn run(opts: &Options) -> Result<i32> {
    let urls = gather_urls(opts)?;
    log::info!(
        "Starting drizzler with {} URLs | Concurrency: {} | Rate: {} RPS",
        urls.len(),
        opts.concurrency,
        opts.rate
    );

    let progress = if opts.no_progress {
        None
    } else {
        let bar = ProgressBar::new(0).with_style(
            ProgressStyle::with_template(
                "{spinner:.green} {pos}/{len} [{elapsed_precise}] {bar:25} {wide_msg}",
            )
            .expect("valid progress template"),
        );
        Some(Arc::new(ProgressReporter { bar }))
    };
    let progress_sink: Option<Arc<dyn ProgressSink>> = progress
        .clone()
        .map(|reporter| reporter as Arc<dyn ProgressSink>);

    let engine = DrizzlerBuilder::builder()
        .per_host_rate(opts.rate)
        .per_host_burst(opts.burst)
        .per_host_concurrency(opts.host_concurrency)
        .global_concurrency(opts.concurrency)
        .request_timeout_s(opts.timeout)
        .max_retries(opts.max_retries)
        .backoff_base_s(opts.backoff_base)
        .backoff_jitter_ratio(opts.backoff_jitter)
        .slow_start_ramp_up_s(opts.ramp_up)
        .deduplicate(!opts.no_dedup)
        .state_file(opts.state_file.clone())
        .progress(progress_sink)
        .build()
        .engine(&urls)?;

    if let Some(reporter) = &progress {
        reporter.bar.set_length(engine.urls().len() as u64);
        reporter.bar.enable_steady_tick(std::time::Duration::from_millis(100));
    }

    let stats = engine.run().await;

    if let Some(reporter) = &progress {
        reporter.bar.finish_and_clear();
    }

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        render_report(&engine, &stats, opts);
    }

    let exit_code = if stats.errors == 0 {
        ExitCode::Success
    } else {
        ExitCode::FetchFailure
    };
    Ok(exit_code as i32)
}

fn render_report(engine: &Drizzler, stats: &RunStats, opts: &Options) {
    let separator = "=".repeat(60);
    println!("\n{separator}");
    println!(
        "{}",
        render::latency_histogram(&engine.latencies(), opts.histogram_bins)
    );
    println!();
    println!(
        "{}",
        render::timeline_lanes(&engine.timeline(), opts.timeline_width)
    );
    println!("{separator}");

    println!(
        "Total: {} | Success: {} | Errors: {} | Error rate: {:.1}%",
        stats.total,
        stats.success,
        stats.errors,
        stats.error_rate * 100.0
    );
    if let (Some(mean), Some(p50), Some(p95), Some(p99)) =
        (stats.mean, stats.p50, stats.p95, stats.p99)
    {
        println!("Latency: mean={mean:.3}s p50={p50:.3}s p95={p95:.3}s p99={p99:.3}s");
    }
    if !stats.status_counts.is_empty() {
        let mut statuses: Vec<_> = stats.status_counts.iter().collect();
        statuses.sort();
        let formatted: Vec<String> = statuses
            .iter()
            .map(|(status, count)| format!("{status}: {count}"))
            .collect();
        println!("Status codes: {}", formatted.join(", "));
    }
}

fn gather_urls(opts: &Options) -> Result<Vec<String>> {
    let mut urls = opts.urls.clone();
    if let Some(path) = &opts.input_file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot read URL file `{}`", path.display()))?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            urls.push(line.to_string());
        }
    }
    Ok(urls)
}

/// Drives the progress bar from the engine's progress sink.
struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressSink for ProgressReporter {
    fn url_completed(&self, url: &str) {
        self.bar.inc(1);
        self.bar.set_message(url.to_string());
    }
}
