//! State providers: the domain logic that turns trace events into attribute
//! mutations.
//!
//! A provider is a small capability interface, not a base class: the
//! pipeline hands it each event in arrival order along with the state system
//! to mutate. Mipmap summarization composes on top as a wrapper around the
//! state-system handle rather than a provider superclass.

pub mod counters;
pub mod kernel;

pub use counters::CounterStateProvider;
pub use kernel::KernelStateProvider;

use crate::errors::Result;
use crate::event::TraceEvent;
use crate::system::StateSystem;

/// Provider schema version that forces reuse of a persisted history
/// regardless of version mismatch. Escape hatch for tooling and tests.
pub const IGNORE_PROVIDER_VERSION: i32 = -42;

pub trait StateProvider: Send {
    /// Schema version of the attribute layout this provider writes. A
    /// persisted history built by a different version is stale and must be
    /// rebuilt (unless the reader passes [`IGNORE_PROVIDER_VERSION`]).
    fn version(&self) -> i32;

    /// Apply one event's state transitions. Called by the single writer
    /// thread, in strict arrival order; the resulting state may depend only
    /// on the ordered prefix of events seen so far.
    ///
    /// Recoverable errors are logged and the event skipped by the caller;
    /// fatal ones abort the build.
    fn process_event(&mut self, ss: &StateSystem, event: &TraceEvent) -> Result<()>;

    /// Flush any provider-side accumulators before the history closes at
    /// `end_ts`. Default: nothing to flush.
    fn done(&mut self, _ss: &StateSystem, _end_ts: i64) -> Result<()> {
        Ok(())
    }
}
