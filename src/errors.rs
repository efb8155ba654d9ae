//! Error taxonomy for the state-history engine.
//!
//! The first four variants of [`StateError`] are recoverable: the event
//! pipeline logs them per-event and moves on, so one malformed event never
//! aborts a whole trace build. [`StateError::InvariantViolation`] is not
//! recoverable; it means the interval store caught a logic bug (overlapping
//! intervals, out-of-range quark) and the writer thread must stop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    /// A query or mutation timestamp falls outside valid bounds: before the
    /// trace start, before an attribute's last update, or past the end of a
    /// closed history.
    #[error("timestamp {ts} outside valid range [{start}, {end}]")]
    TimeRange { ts: i64, start: i64, end: i64 },

    /// A non-creating lookup found no attribute at the given path. Callers
    /// that want the attribute created should use the `_and_add` variant.
    #[error("no attribute at path {path:?}")]
    AttributeNotFound { path: String },

    /// A numeric operation was attempted on an incompatible value kind.
    #[error("state value is a {actual}, expected {expected}")]
    ValueType {
        expected: &'static str,
        actual: &'static str,
    },

    /// The state system was torn down before this call arrived.
    #[error("state system has been disposed")]
    Disposed,

    /// An internal interval-store invariant was broken. This indicates a bug
    /// in a state provider or backend and aborts history construction.
    #[error("interval store invariant violated: {0}")]
    InvariantViolation(String),
}

impl StateError {
    /// Recoverable errors are caught per-event by the pipeline; fatal ones
    /// escape and terminate the writer thread.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StateError::InvariantViolation(_))
    }
}

/// Errors from persisting or reopening a history snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The snapshot was written by a different provider version and must be
    /// rebuilt from the trace.
    #[error("snapshot has provider version {found}, expected {expected}")]
    StaleVersion { found: i32, expected: i32 },

    /// The snapshot covers a history that was never closed.
    #[error("snapshot is incomplete (history was not closed)")]
    Incomplete,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed snapshot: {0}")]
    Format(#[from] serde_json::Error),
}

pub type Result<T, E = StateError> = std::result::Result<T, E>;
