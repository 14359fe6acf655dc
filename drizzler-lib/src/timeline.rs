use std::collections::BTreeMap;

use serde::Serialize;

use crate::HostKey;

/// One terminated request on a worker's lane.
///
/// Offsets are in seconds relative to run start, measured on a shared
/// monotonic clock. Breaker-blocked requests produce a zero-length segment
/// with no status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineSegment {
    /// Run-relative start offset in seconds
    pub start: f64,
    /// Run-relative end offset in seconds
    pub end: f64,
    /// The logical host the request was issued against
    pub host: HostKey,
    /// Final HTTP status, if any was observed
    pub status: Option<u16>,
}

/// Per-worker request timelines, keyed by worker index.
///
/// Segments within a lane are appended in completion order. No ordering is
/// promised across workers beyond the shared clock.
pub type Timeline = BTreeMap<usize, Vec<TimelineSegment>>;
