//! Persistence for completed histories.
//!
//! A closed state system serializes to a single JSON document: the provider
//! version, the trace time range, the attribute paths in quark order, and
//! the per-quark interval dump. Reopening a snapshot with a matching
//! provider version answers every query identically to the in-memory build;
//! a version mismatch means the snapshot is stale and must be rebuilt,
//! unless the caller passes [`IGNORE_PROVIDER_VERSION`] to force reuse.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::InMemoryBackend;
use crate::errors::SnapshotError;
use crate::interval::StateInterval;
use crate::provider::IGNORE_PROVIDER_VERSION;
use crate::system::StateSystem;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    provider_version: i32,
    start_time: i64,
    end_time: i64,
    /// Attribute paths in quark order, so reloading reproduces identical
    /// handles.
    attributes: Vec<Vec<String>>,
    intervals: Vec<Vec<StateInterval>>,
}

/// Write a closed history to `path`.
pub fn save(ss: &StateSystem, provider_version: i32, path: &Path) -> Result<(), SnapshotError> {
    if !ss.is_closed() {
        return Err(SnapshotError::Incomplete);
    }
    let n = ss.attributes().num_attributes();
    let mut intervals = ss.dump_intervals();
    intervals.resize_with(n, Vec::new);
    let snapshot = Snapshot {
        provider_version,
        start_time: ss.start_time(),
        end_time: ss.current_end_time(),
        attributes: (0..n).map(|q| ss.attributes().path_of(q)).collect(),
        intervals,
    };
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), &snapshot)?;
    Ok(())
}

/// Reopen a persisted history. `expected_version` must match the version
/// recorded at save time; pass [`IGNORE_PROVIDER_VERSION`] to reuse the
/// snapshot regardless.
pub fn load(path: &Path, expected_version: i32) -> Result<StateSystem, SnapshotError> {
    let file = File::open(path)?;
    let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))?;
    if expected_version != IGNORE_PROVIDER_VERSION && snapshot.provider_version != expected_version
    {
        return Err(SnapshotError::StaleVersion {
            found: snapshot.provider_version,
            expected: expected_version,
        });
    }
    Ok(StateSystem::restore(
        snapshot.attributes,
        Box::new(InMemoryBackend::from_dump(snapshot.intervals)),
        snapshot.start_time,
        snapshot.end_time,
    ))
}
