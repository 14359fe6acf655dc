//! ASCII rendering of the latency histogram and the per-worker timeline.
//!
//! Downstream consumers of the engine's result surface; the engine itself
//! never prints.

use drizzler_lib::Timeline;

/// Bar width of the histogram's widest bin
const HISTOGRAM_BAR_WIDTH: usize = 40;

/// Render successful-request latencies as a fixed-width ASCII histogram.
pub(crate) fn latency_histogram(latencies: &[f64], bins: usize) -> String {
    if latencies.is_empty() || bins == 0 {
        return "No latency data.".to_string();
    }
    let lo = latencies.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if hi <= lo {
        return format!("Histogram: single value {lo:.4}s");
    }

    let mut counts = vec![0usize; bins];
    for &sample in latencies {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bin = (((sample - lo) / (hi - lo)) * bins as f64) as usize;
        counts[bin.min(bins - 1)] += 1;
    }

    let peak = counts.iter().copied().max().unwrap_or(1);
    let mut lines = vec!["Latency Histogram".to_string()];
    for (i, &count) in counts.iter().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let left = lo + (hi - lo) * (i as f64 / bins as f64);
        #[allow(clippy::cast_precision_loss)]
        let right = lo + (hi - lo) * ((i + 1) as f64 / bins as f64);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bar_len = ((count as f64 / peak as f64) * HISTOGRAM_BAR_WIDTH as f64) as usize;
        let bar = "#".repeat(bar_len.max(1));
        lines.push(format!("{left:.3}s - {right:.3}s | {bar} ({count})"));
    }
    lines.join("\n")
}

/// Render the per-worker timeline as one lane per worker, scaled to the
/// latest segment end.
pub(crate) fn timeline_lanes(timeline: &Timeline, width: usize) -> String {
    if timeline.is_empty() || width < 8 {
        return "No timeline data.".to_string();
    }
    let mut max_t = timeline
        .values()
        .flatten()
        .map(|segment| segment.end)
        .fold(0.0, f64::max);
    if max_t <= 0.0 {
        max_t = 1.0;
    }

    let mut lines = vec!["Request Timeline (relative seconds)".to_string()];
    for (worker, segments) in timeline {
        let mut lane = vec![' '; width];
        for segment in segments {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let from = ((segment.start / max_t) * (width - 1) as f64) as usize;
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let to = ((segment.end / max_t) * (width - 1) as f64) as usize;
            let from = from.min(width - 1);
            let to = to.clamp(from, width - 1);
            for cell in &mut lane[from..=to] {
                *cell = '=';
            }
        }
        let lane: String = lane.into_iter().collect();
        lines.push(format!("W{worker:02} |{lane}|"));
    }
    lines.push(format!("0s{}~ {max_t:.2}s", " ".repeat(width - 6)));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use drizzler_lib::{HostKey, TimelineSegment};

    fn segment(start: f64, end: f64, status: Option<u16>) -> TimelineSegment {
        TimelineSegment {
            start,
            end,
            host: HostKey::from("a.test"),
            status,
        }
    }

    #[test]
    fn test_histogram_empty() {
        assert_eq!(latency_histogram(&[], 20), "No latency data.");
    }

    #[test]
    fn test_histogram_single_value() {
        let rendered = latency_histogram(&[0.25, 0.25], 20);
        assert!(rendered.starts_with("Histogram: single value 0.2500s"));
    }

    #[test]
    fn test_histogram_bins_and_counts() {
        let rendered = latency_histogram(&[0.1, 0.1, 0.1, 0.9], 2);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Latency Histogram");
        assert!(lines[1].ends_with("(3)"), "{}", lines[1]);
        assert!(lines[2].ends_with("(1)"), "{}", lines[2]);
        // The fuller bin has the longer bar
        let hashes = |line: &str| line.chars().filter(|&c| c == '#').count();
        assert!(hashes(lines[1]) > hashes(lines[2]));
    }

    #[test]
    fn test_timeline_empty() {
        assert_eq!(timeline_lanes(&Timeline::new(), 80), "No timeline data.");
    }

    #[test]
    fn test_timeline_lanes_cover_segments() {
        let mut timeline = Timeline::new();
        timeline.insert(0, vec![segment(0.0, 1.0, Some(200))]);
        timeline.insert(1, vec![segment(1.0, 2.0, Some(200))]);
        let rendered = timeline_lanes(&timeline, 40);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("W00 |"));
        assert!(lines[2].starts_with("W01 |"));
        // Worker 0 worked the first half, worker 1 the second
        assert!(lines[1].contains('='));
        let w0_fill = lines[1].chars().filter(|&c| c == '=').count();
        let w1_fill = lines[2].chars().filter(|&c| c == '=').count();
        assert!(w0_fill.abs_diff(w1_fill) <= 1);
        assert!(lines[3].starts_with("0s"));
        assert!(lines[3].ends_with("~ 2.00s"));
    }

    #[test]
    fn test_timeline_zero_length_segment_marks_one_cell() {
        let mut timeline = Timeline::new();
        timeline.insert(0, vec![segment(0.5, 0.5, None), segment(0.0, 1.0, Some(200))]);
        let rendered = timeline_lanes(&timeline, 20);
        assert!(rendered.lines().nth(1).unwrap().contains('='));
    }
}
