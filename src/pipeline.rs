//! The event-processing pipeline: a bounded queue between the event feed and
//! the single writer thread that builds the history.
//!
//! The producer blocks when the queue is full; events are never dropped. A
//! sentinel event (timestamp -1) marks end-of-stream: the writer closes the
//! history at the timestamp of the last real event it processed, then exits.
//! Cancellation still drains whatever is already buffered, but finalizes by
//! disposing the store instead of closing it, so a partial history is never
//! mistaken for a complete one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread;

use log::{error, warn};

use crate::errors::{Result, StateError};
use crate::event::TraceEvent;
use crate::provider::StateProvider;
use crate::system::StateSystem;

/// Default bound on the event queue. Large enough to decouple a bursty
/// producer from the writer, small enough to cap memory.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Outcome of a finished build.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildStats {
    /// Events whose transitions were fully applied.
    pub processed: u64,
    /// Events skipped after a recoverable per-event error.
    pub skipped: u64,
    /// True when the history was closed; false when it ended disposed
    /// (canceled, interrupted, or a fatal error).
    pub closed: bool,
}

pub struct HistoryBuilder {
    tx: Option<SyncSender<TraceEvent>>,
    cancel: Arc<AtomicBool>,
    writer: Option<thread::JoinHandle<BuildStats>>,
    system: Arc<StateSystem>,
}

impl HistoryBuilder {
    /// Start the writer thread for `provider` over `system` with the default
    /// queue capacity.
    pub fn spawn(provider: Box<dyn StateProvider>, system: Arc<StateSystem>) -> Self {
        Self::spawn_with_capacity(provider, system, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(
        mut provider: Box<dyn StateProvider>,
        system: Arc<StateSystem>,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = sync_channel::<TraceEvent>(capacity);
        let cancel = Arc::new(AtomicBool::new(false));

        let writer_cancel = Arc::clone(&cancel);
        let writer_system = Arc::clone(&system);
        let writer = thread::spawn(move || {
            let ss = writer_system;
            let mut stats = BuildStats::default();
            let mut last_ts: Option<i64> = None;
            let mut saw_sentinel = false;

            while let Ok(event) = rx.recv() {
                if event.is_sentinel() {
                    saw_sentinel = true;
                    break;
                }
                match provider.process_event(&ss, &event) {
                    Ok(()) => stats.processed += 1,
                    Err(e) if !e.is_fatal() => {
                        warn!("skipping event {:?} at {}: {e}", event.name, event.ts);
                        stats.skipped += 1;
                    }
                    Err(e) => {
                        error!("fatal error processing {:?} at {}: {e}", event.name, event.ts);
                        ss.dispose();
                        return stats;
                    }
                }
                last_ts = Some(event.ts);
            }

            // A dropped sender without a sentinel means the producer was
            // interrupted; the partial history must not look complete.
            if !saw_sentinel || writer_cancel.load(Ordering::Acquire) {
                ss.dispose();
                return stats;
            }

            let end_ts = last_ts.unwrap_or_else(|| ss.start_time());
            if let Err(e) = provider.done(&ss, end_ts) {
                error!("provider finalization failed: {e}");
                ss.dispose();
                return stats;
            }
            match ss.close_history(end_ts) {
                Ok(()) => stats.closed = true,
                Err(e) => {
                    error!("failed to close history at {end_ts}: {e}");
                    ss.dispose();
                }
            }
            stats
        });

        Self {
            tx: Some(tx),
            cancel,
            writer: Some(writer),
            system,
        }
    }

    pub fn system(&self) -> &Arc<StateSystem> {
        &self.system
    }

    /// Queue one event. Blocks while the queue is full; fails only when the
    /// writer thread is gone (fatal error or already joined).
    pub fn feed(&self, event: TraceEvent) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or(StateError::Disposed)?
            .send(event)
            .map_err(|_| StateError::Disposed)
    }

    /// Signal end-of-stream. The writer finishes draining, then closes the
    /// history at the last real event's timestamp.
    pub fn finish(&self) -> Result<()> {
        self.feed(TraceEvent::sentinel())
    }

    /// Request cancellation: everything already queued is still drained, but
    /// the build finalizes by disposing instead of closing. The caller
    /// should stop feeding and call [`finish`](Self::finish) (or drop the
    /// builder) to unblock the writer.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Wait for the writer thread and return the build outcome.
    pub fn join(mut self) -> BuildStats {
        // Drop our sender first so the writer wakes even if no sentinel was
        // ever fed.
        self.tx.take();
        let handle = self.writer.take().expect("join called twice");
        handle.join().unwrap_or_else(|_| {
            error!("writer thread panicked");
            self.system.dispose();
            BuildStats::default()
        })
    }
}
