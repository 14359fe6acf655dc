use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, Result};

/// Persisted snapshot of one token bucket.
///
/// `cooldown_until` and `start_t_offset` are offsets in seconds relative to
/// process time at save: remaining cooldown and elapsed ramp time. They are
/// rebased against the clock of the restoring process and treated as
/// best-effort hints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Learned target rate in permits per second
    pub rate: f64,
    /// Remaining forced cooldown in seconds at save time
    #[serde(default)]
    pub cooldown_until: f64,
    /// Elapsed ramp-up time in seconds at save time
    #[serde(default)]
    pub start_t_offset: f64,
}

/// Persisted snapshot of one circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    /// Consecutive failure count
    #[serde(default)]
    pub failures: u32,
    /// Remaining cooldown in seconds at save time
    #[serde(default)]
    pub cooldown_until: f64,
    /// Seconds since the last failure at save time
    #[serde(default)]
    pub last_failure: f64,
}

/// Durable engine state: learned rates and breaker positions keyed by
/// logical host.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Token bucket snapshots
    #[serde(default)]
    pub buckets: HashMap<String, BucketState>,
    /// Circuit breaker snapshots
    #[serde(default)]
    pub breakers: HashMap<String, BreakerState>,
}

impl EngineState {
    /// Whether the snapshot contains no hosts at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.breakers.is_empty()
    }
}

/// Reads and writes the JSON state file.
///
/// Loading never fails: a missing or corrupt file yields an empty snapshot
/// and a clean start, with the cause logged.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore { path: path.into() }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted snapshot, or an empty one when the file is
    /// missing or unreadable.
    #[must_use]
    pub fn load(&self) -> EngineState {
        if !self.path.exists() {
            info!("No state file found. Starting fresh.");
            return EngineState::default();
        }
        match self.try_load() {
            Ok(state) => {
                info!(
                    "Loaded state for {} buckets and {} breakers",
                    state.buckets.len(),
                    state.breakers.len()
                );
                state
            }
            Err(err) => {
                error!("Failed to load state: {err}");
                EngineState::default()
            }
        }
    }

    /// Write the snapshot to disk.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot cannot be serialized or the file
    /// cannot be written. Callers treat this as non-fatal.
    pub fn save(&self, state: &EngineState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).map_err(ErrorKind::EncodeState)?;
        fs::write(&self.path, json)
            .map_err(|err| ErrorKind::WriteStateFile(err, self.path.clone()))?;
        info!("State saved to {}", self.path.display());
        Ok(())
    }

    fn try_load(&self) -> Result<EngineState> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|err| ErrorKind::ReadStateFile(err, self.path.clone()))?;
        serde_json::from_str(&raw).map_err(|err| ErrorKind::DecodeStateFile(err, self.path.clone()))
    }
}
