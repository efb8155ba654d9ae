//! statehist - a trace state-history engine.
//!
//! Consumes a strictly time-ordered stream of decoded trace events,
//! incrementally derives a hierarchical attribute tree of typed state
//! values, and persists the full history of state changes as queryable
//! intervals.
//!
//! # Modules
//!
//! - [`attribute`] - hierarchical attribute namespace ("quark" tree)
//! - [`value`] - the typed state value stored in intervals
//! - [`interval`] - immutable closed state intervals
//! - [`backend`] - interval stores (in-memory, null)
//! - [`system`] - the state system tying tree, ongoing state and backend
//! - [`pipeline`] - bounded queue + single writer thread
//! - [`provider`] - event-to-state-change logic (kernel sched/IRQ/syscall
//!   machine, counter sampling)
//! - [`mipmap`] - multi-resolution min/max/avg summary index
//! - [`snapshot`] - persistence for completed histories
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use statehist::backend::InMemoryBackend;
//! use statehist::event::TraceEvent;
//! use statehist::pipeline::HistoryBuilder;
//! use statehist::provider::KernelStateProvider;
//! use statehist::system::StateSystem;
//!
//! let system = Arc::new(StateSystem::new(Box::new(InMemoryBackend::new()), 0));
//! let builder = HistoryBuilder::spawn(
//!     Box::new(KernelStateProvider::new()),
//!     Arc::clone(&system),
//! );
//! builder
//!     .feed(
//!         TraceEvent::new(100, "sched_switch", 0)
//!             .with_field_long("prev_tid", 1)
//!             .with_field_long("prev_state", 0)
//!             .with_field_long("next_tid", 2),
//!     )
//!     .unwrap();
//! builder.finish().unwrap();
//! let stats = builder.join();
//! assert!(stats.closed);
//! ```

pub mod attribute;
pub mod backend;
pub mod errors;
pub mod event;
pub mod interval;
pub mod mipmap;
pub mod pipeline;
pub mod provider;
pub mod snapshot;
pub mod system;
pub mod value;

// Re-export for convenience
pub use errors::{SnapshotError, StateError};
pub use event::{EventKind, TraceEvent};
pub use interval::{Quark, StateInterval};
pub use pipeline::{BuildStats, HistoryBuilder};
pub use provider::{
    CounterStateProvider, KernelStateProvider, StateProvider, IGNORE_PROVIDER_VERSION,
};
pub use system::StateSystem;
pub use value::StateValue;
