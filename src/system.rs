//! The state system: attribute tree + ongoing-state map + history backend.
//!
//! This is where the builder-side mutations (`modify_attribute` and friends)
//! and the query side meet. Exactly one thread performs mutations; queries
//! may run concurrently from other threads and see everything written up to
//! `current_end_time`. The ongoing-state vector is the only mutable
//! per-attribute state during construction; once an interval is handed to
//! the backend it is immutable.
//!
//! Lifecycle: `Building` until either `close_history` (complete, reusable)
//! or `dispose` (partial, queries fail with `Disposed`).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

use log::debug;

use crate::attribute::AttributeTree;
use crate::backend::HistoryBackend;
use crate::errors::{Result, StateError};
use crate::interval::{Quark, StateInterval};
use crate::value::StateValue;

struct OngoingState {
    value: StateValue,
    start: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Building,
    Closed,
    Disposed,
}

pub struct StateSystem {
    attributes: AttributeTree,
    backend: Box<dyn HistoryBackend>,
    ongoing: RwLock<Vec<OngoingState>>,
    start_time: i64,
    /// Largest mutation timestamp seen so far; the upper query bound while
    /// building, frozen to the close timestamp afterwards.
    current_end: AtomicI64,
    lifecycle: Mutex<Lifecycle>,
    built: Condvar,
}

impl std::fmt::Debug for StateSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSystem")
            .field("start_time", &self.start_time)
            .field("current_end", &self.current_end.load(Ordering::Relaxed))
            .field("lifecycle", &*self.lifecycle.lock().unwrap())
            .finish()
    }
}

impl StateSystem {
    pub fn new(backend: Box<dyn HistoryBackend>, start_time: i64) -> Self {
        Self {
            attributes: AttributeTree::new(),
            backend,
            ongoing: RwLock::new(Vec::new()),
            start_time,
            current_end: AtomicI64::new(start_time),
            lifecycle: Mutex::new(Lifecycle::Building),
            built: Condvar::new(),
        }
    }

    /// Rebuild a closed state system from persisted parts. `paths` must be in
    /// quark order so handles come out identical to the original build.
    pub fn restore(
        paths: Vec<Vec<String>>,
        backend: Box<dyn HistoryBackend>,
        start_time: i64,
        end_time: i64,
    ) -> Self {
        let attributes = AttributeTree::new();
        for path in &paths {
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            attributes.quark_for_and_add(&segments);
        }
        Self {
            attributes,
            backend,
            ongoing: RwLock::new(Vec::new()),
            start_time,
            current_end: AtomicI64::new(end_time),
            lifecycle: Mutex::new(Lifecycle::Closed),
            built: Condvar::new(),
        }
    }

    pub fn attributes(&self) -> &AttributeTree {
        &self.attributes
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Upper bound of the queryable range right now.
    pub fn current_end_time(&self) -> i64 {
        self.current_end.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.lifecycle.lock().unwrap() == Lifecycle::Closed
    }

    pub fn is_disposed(&self) -> bool {
        *self.lifecycle.lock().unwrap() == Lifecycle::Disposed
    }

    /// Total closed intervals in the backend.
    pub fn interval_count(&self) -> usize {
        self.backend.interval_count()
    }

    /// Per-quark dump of all closed intervals, for persistence and
    /// determinism checks.
    pub fn dump_intervals(&self) -> Vec<Vec<StateInterval>> {
        self.backend.dump()
    }

    fn check_building(&self) -> Result<()> {
        match *self.lifecycle.lock().unwrap() {
            Lifecycle::Building => Ok(()),
            _ => Err(StateError::Disposed),
        }
    }

    fn check_queryable(&self) -> Result<()> {
        match *self.lifecycle.lock().unwrap() {
            Lifecycle::Disposed => Err(StateError::Disposed),
            _ => Ok(()),
        }
    }

    /// Grow the ongoing vector to cover `quark`, seeding new attributes with
    /// Null from the trace start so every attribute's timeline is fully
    /// covered.
    fn ensure_capacity(&self, quark: Quark) -> Result<()> {
        let known = self.attributes.num_attributes();
        if quark >= known {
            return Err(StateError::InvariantViolation(format!(
                "quark {quark} out of range ({known} attributes exist)"
            )));
        }
        {
            let ongoing = self.ongoing.read().unwrap();
            if quark < ongoing.len() {
                return Ok(());
            }
        }
        let mut ongoing = self.ongoing.write().unwrap();
        let start = self.start_time;
        if ongoing.len() < known {
            ongoing.resize_with(known, || OngoingState {
                value: StateValue::Null,
                start,
            });
        }
        Ok(())
    }

    /// Close the current ongoing interval of `quark` at `ts - 1` and open a
    /// new one holding `value` from `ts`. The event stream is time-ordered,
    /// so `ts` earlier than the ongoing start is a `TimeRange` violation.
    pub fn modify_attribute(&self, ts: i64, value: StateValue, quark: Quark) -> Result<()> {
        self.check_building()?;
        if ts < self.start_time {
            return Err(StateError::TimeRange {
                ts,
                start: self.start_time,
                end: self.current_end_time(),
            });
        }
        self.ensure_capacity(quark)?;
        let mut ongoing = self.ongoing.write().unwrap();
        let og = &mut ongoing[quark];
        if ts < og.start {
            return Err(StateError::TimeRange {
                ts,
                start: og.start,
                end: self.current_end_time(),
            });
        }
        if ts > og.start {
            self.backend.insert_interval(StateInterval::new(
                og.start,
                ts - 1,
                quark,
                og.value.clone(),
            ))?;
        }
        // ts == og.start: the previous value never covered a full tick, the
        // new one simply supersedes it.
        og.value = value;
        og.start = ts;
        self.current_end.fetch_max(ts, Ordering::AcqRel);
        Ok(())
    }

    /// Replace the ongoing value in place without creating an interval
    /// boundary. Only for retroactive fixups (cumulative counters); normal
    /// transitions must go through `modify_attribute` or history is lost.
    pub fn update_ongoing_state(&self, value: StateValue, quark: Quark) -> Result<()> {
        self.check_building()?;
        self.ensure_capacity(quark)?;
        let mut ongoing = self.ongoing.write().unwrap();
        ongoing[quark].value = value;
        Ok(())
    }

    /// The attribute's current in-progress value, without committing
    /// anything.
    pub fn query_ongoing_state(&self, quark: Quark) -> Result<StateValue> {
        self.check_queryable()?;
        self.ensure_capacity(quark)?;
        let ongoing = self.ongoing.read().unwrap();
        Ok(ongoing[quark].value.clone())
    }

    /// Start timestamp of the attribute's ongoing interval.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<i64> {
        self.check_queryable()?;
        self.ensure_capacity(quark)?;
        let ongoing = self.ongoing.read().unwrap();
        Ok(ongoing[quark].start)
    }

    /// Add `delta` to the attribute's current numeric value at `ts`.
    pub fn increment_attribute(&self, ts: i64, quark: Quark, delta: i64) -> Result<()> {
        let current = self.query_ongoing_state(quark)?;
        let base = if current.is_null() {
            StateValue::Long(0)
        } else {
            current
        };
        let next = base.add(&StateValue::Long(delta))?;
        self.modify_attribute(ts, next, quark)
    }

    /// Close `quark` and its whole subtree with Null at `ts`; used when the
    /// entity behind the attribute (a thread, usually) goes away. Handles
    /// are never freed.
    pub fn remove_attribute(&self, ts: i64, quark: Quark) -> Result<()> {
        self.modify_attribute(ts, StateValue::Null, quark)?;
        for sub in self.attributes.sub_attributes(quark, true) {
            self.modify_attribute(ts, StateValue::Null, sub)?;
        }
        Ok(())
    }

    fn check_query_ts(&self, ts: i64) -> Result<()> {
        self.check_queryable()?;
        let end = self.current_end_time();
        if ts < self.start_time || ts > end {
            return Err(StateError::TimeRange {
                ts,
                start: self.start_time,
                end,
            });
        }
        Ok(())
    }

    /// Point query: the interval of `quark` containing `ts`.
    pub fn query_single_state(&self, ts: i64, quark: Quark) -> Result<StateInterval> {
        self.check_query_ts(ts)?;
        self.ensure_capacity(quark)?;
        if let Some(iv) = self.backend.query_single(quark, ts)? {
            return Ok(iv);
        }
        // Past the last closed interval: the ongoing value covers through
        // the current end of the history.
        let ongoing = self.ongoing.read().unwrap();
        let og = &ongoing[quark];
        Ok(StateInterval::new(
            og.start,
            self.current_end_time(),
            quark,
            og.value.clone(),
        ))
    }

    /// Full-state query: one interval per attribute, all containing `ts`.
    pub fn query_full_state(&self, ts: i64) -> Result<Vec<StateInterval>> {
        self.check_query_ts(ts)?;
        let n = self.attributes.num_attributes();
        let mut out = Vec::with_capacity(n);
        for quark in 0..n {
            out.push(self.query_single_state(ts, quark)?);
        }
        Ok(out)
    }

    /// All intervals of `quark` intersecting `[t1, t2]`, ordered by start.
    /// The caller clips to the query range where it needs exact coverage.
    pub fn query_history_range(&self, quark: Quark, t1: i64, t2: i64) -> Result<Vec<StateInterval>> {
        self.check_queryable()?;
        if t2 < t1 {
            return Err(StateError::TimeRange {
                ts: t2,
                start: t1,
                end: self.current_end_time(),
            });
        }
        let end = self.current_end_time();
        if t2 < self.start_time || t1 > end {
            return Err(StateError::TimeRange {
                ts: t1,
                start: self.start_time,
                end,
            });
        }
        self.ensure_capacity(quark)?;
        let t1c = t1.max(self.start_time);
        let t2c = t2.min(end);
        let mut out = self.backend.query_range(quark, t1c, t2c)?;
        if !self.is_closed() {
            let ongoing = self.ongoing.read().unwrap();
            let og = &ongoing[quark];
            if og.start <= t2c && end >= t1c && end >= og.start {
                out.push(StateInterval::new(og.start, end, quark, og.value.clone()));
            }
        }
        Ok(out)
    }

    /// Convert every ongoing value into a final closed interval ending at
    /// `end_ts`. Terminal: the store is read-only afterwards.
    pub fn close_history(&self, end_ts: i64) -> Result<()> {
        let mut lc = self.lifecycle.lock().unwrap();
        if *lc != Lifecycle::Building {
            return Err(StateError::Disposed);
        }
        let mut ongoing = self.ongoing.write().unwrap();
        // Attributes created but never touched still get their final Null
        // interval, so the closed history covers every quark end to end.
        let known = self.attributes.num_attributes();
        let start = self.start_time;
        if ongoing.len() < known {
            ongoing.resize_with(known, || OngoingState {
                value: StateValue::Null,
                start,
            });
        }
        for (quark, og) in ongoing.iter().enumerate() {
            // An attribute modified at exactly end_ts still gets a final
            // interval (zero-length is fine).
            let end = end_ts.max(og.start);
            self.backend.insert_interval(StateInterval::new(
                og.start,
                end,
                quark,
                og.value.clone(),
            ))?;
        }
        drop(ongoing);
        self.current_end.fetch_max(end_ts, Ordering::AcqRel);
        debug!(
            "history closed at {end_ts}: {} attributes, {} intervals",
            self.attributes.num_attributes(),
            self.backend.interval_count()
        );
        *lc = Lifecycle::Closed;
        self.built.notify_all();
        Ok(())
    }

    /// Tear down without closing. Partial backend state is deleted so an
    /// interrupted build is never mistaken for a complete history.
    pub fn dispose(&self) {
        let mut lc = self.lifecycle.lock().unwrap();
        if *lc == Lifecycle::Building {
            self.backend.delete();
        }
        *lc = Lifecycle::Disposed;
        self.built.notify_all();
    }

    /// Block until the history is closed or disposed. Returns true when the
    /// build completed (closed), false when it was abandoned (disposed).
    /// Callers needing a timeout wrap this externally.
    pub fn wait_until_built(&self) -> bool {
        let mut lc = self.lifecycle.lock().unwrap();
        while *lc == Lifecycle::Building {
            lc = self.built.wait(lc).unwrap();
        }
        *lc == Lifecycle::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn test_system(start: i64) -> StateSystem {
        StateSystem::new(Box::new(InMemoryBackend::new()), start)
    }

    #[test]
    fn test_modify_closes_previous_interval() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["Threads", "1", "Status"]);

        ss.modify_attribute(100, StateValue::Int(1), q).unwrap();
        ss.modify_attribute(200, StateValue::Int(2), q).unwrap();

        // [0, 99] Null, [100, 199] Int(1), ongoing Int(2) from 200.
        let iv = ss.query_single_state(50, q).unwrap();
        assert_eq!(iv.value, StateValue::Null);
        assert_eq!((iv.start, iv.end), (0, 99));

        let iv = ss.query_single_state(150, q).unwrap();
        assert_eq!(iv.value, StateValue::Int(1));
        assert_eq!((iv.start, iv.end), (100, 199));

        let iv = ss.query_single_state(200, q).unwrap();
        assert_eq!(iv.value, StateValue::Int(2));
    }

    #[test]
    fn test_modify_before_ongoing_start_is_time_range() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["a"]);
        ss.modify_attribute(100, StateValue::Int(1), q).unwrap();
        let err = ss.modify_attribute(50, StateValue::Int(2), q).unwrap_err();
        assert!(matches!(err, StateError::TimeRange { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_same_timestamp_modify_supersedes() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["a"]);
        ss.modify_attribute(100, StateValue::Int(1), q).unwrap();
        ss.modify_attribute(100, StateValue::Int(2), q).unwrap();
        assert_eq!(ss.query_ongoing_state(q).unwrap(), StateValue::Int(2));
        // No extra interval was closed for the superseded value.
        assert_eq!(ss.interval_count(), 1);
    }

    #[test]
    fn test_update_ongoing_leaves_no_boundary() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["counter"]);
        ss.modify_attribute(100, StateValue::Long(5), q).unwrap();
        let before = ss.interval_count();
        ss.update_ongoing_state(StateValue::Long(7), q).unwrap();
        assert_eq!(ss.interval_count(), before);
        assert_eq!(ss.query_ongoing_state(q).unwrap(), StateValue::Long(7));
        assert_eq!(ss.ongoing_start_time(q).unwrap(), 100);
    }

    #[test]
    fn test_increment_attribute() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["counter"]);
        ss.increment_attribute(10, q, 3).unwrap();
        ss.increment_attribute(20, q, 4).unwrap();
        assert_eq!(ss.query_ongoing_state(q).unwrap(), StateValue::Long(7));
    }

    #[test]
    fn test_close_history_flushes_ongoing() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["a"]);
        ss.modify_attribute(100, StateValue::Int(1), q).unwrap();
        ss.close_history(500).unwrap();

        assert!(ss.is_closed());
        // Query at exactly the end boundary returns the final interval, not
        // a TimeRange error.
        let iv = ss.query_single_state(500, q).unwrap();
        assert_eq!(iv.value, StateValue::Int(1));
        assert_eq!((iv.start, iv.end), (100, 500));

        // Mutations after close fail.
        assert!(ss.modify_attribute(600, StateValue::Int(2), q).is_err());
    }

    #[test]
    fn test_query_beyond_end_is_time_range() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["a"]);
        ss.modify_attribute(100, StateValue::Int(1), q).unwrap();
        ss.close_history(500).unwrap();
        assert!(matches!(
            ss.query_single_state(501, q).unwrap_err(),
            StateError::TimeRange { .. }
        ));
        assert!(matches!(
            ss.query_single_state(-5, q).unwrap_err(),
            StateError::TimeRange { .. }
        ));
    }

    #[test]
    fn test_query_full_state() {
        let ss = test_system(0);
        let a = ss.attributes().quark_for_and_add(&["a"]);
        let b = ss.attributes().quark_for_and_add(&["b"]);
        ss.modify_attribute(100, StateValue::Int(1), a).unwrap();
        ss.modify_attribute(200, StateValue::Int(2), b).unwrap();
        ss.close_history(300).unwrap();

        let full = ss.query_full_state(250).unwrap();
        assert_eq!(full.len(), 2);
        assert_eq!(full[a].value, StateValue::Int(1));
        assert_eq!(full[b].value, StateValue::Int(2));
        assert!(full.iter().all(|iv| iv.intersects(250)));
    }

    #[test]
    fn test_history_range_contiguous_no_overlap() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["a"]);
        for (ts, v) in [(100, 1), (250, 2), (400, 3), (700, 4)] {
            ss.modify_attribute(ts, StateValue::Int(v), q).unwrap();
        }
        ss.close_history(1000).unwrap();

        let ivs = ss.query_history_range(q, 0, 1000).unwrap();
        assert_eq!(ivs.first().unwrap().start, 0);
        assert_eq!(ivs.last().unwrap().end, 1000);
        for pair in ivs.windows(2) {
            assert_eq!(pair[1].start, pair[0].end + 1);
        }
    }

    #[test]
    fn test_history_range_includes_ongoing_while_building() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["a"]);
        ss.modify_attribute(100, StateValue::Int(1), q).unwrap();
        ss.modify_attribute(200, StateValue::Int(2), q).unwrap();

        let ivs = ss.query_history_range(q, 0, 200).unwrap();
        assert_eq!(ivs.len(), 3);
        assert_eq!(ivs[2].value, StateValue::Int(2));
        assert_eq!(ivs[2].start, 200);
    }

    #[test]
    fn test_remove_attribute_closes_subtree() {
        let ss = test_system(0);
        let thread = ss.attributes().quark_for_and_add(&["Threads", "9"]);
        let status = ss
            .attributes()
            .quark_for_and_add(&["Threads", "9", "Status"]);
        ss.modify_attribute(100, StateValue::Int(3), status).unwrap();
        ss.modify_attribute(100, StateValue::Int(9), thread).unwrap();

        ss.remove_attribute(300, thread).unwrap();
        assert!(ss.query_ongoing_state(thread).unwrap().is_null());
        assert!(ss.query_ongoing_state(status).unwrap().is_null());

        // The old value is still queryable in the past.
        ss.close_history(400).unwrap();
        let iv = ss.query_single_state(200, status).unwrap();
        assert_eq!(iv.value, StateValue::Int(3));
    }

    #[test]
    fn test_dispose_makes_queries_fail() {
        let ss = test_system(0);
        let q = ss.attributes().quark_for_and_add(&["a"]);
        ss.modify_attribute(100, StateValue::Int(1), q).unwrap();
        ss.dispose();
        assert!(ss.is_disposed());
        assert!(matches!(
            ss.query_single_state(100, q).unwrap_err(),
            StateError::Disposed
        ));
        assert!(matches!(
            ss.query_history_range(q, 0, 100).unwrap_err(),
            StateError::Disposed
        ));
        // Dispose deleted the partial backend state.
        assert_eq!(ss.interval_count(), 0);
    }

    #[test]
    fn test_wait_until_built_reports_outcome() {
        let ss = test_system(0);
        ss.close_history(10).unwrap();
        assert!(ss.wait_until_built());

        let ss = test_system(0);
        ss.dispose();
        assert!(!ss.wait_until_built());
    }

    #[test]
    fn test_determinism_identical_runs_identical_dumps() {
        let run = || {
            let ss = test_system(0);
            let q = ss.attributes().quark_for_and_add(&["CPUs", "0", "Status"]);
            let r = ss.attributes().quark_for_and_add(&["Threads", "5", "Status"]);
            for (ts, v) in [(10, 1), (20, 2), (35, 1), (50, 3)] {
                ss.modify_attribute(ts, StateValue::Int(v), q).unwrap();
                ss.modify_attribute(ts + 1, StateValue::Int(v + 10), r).unwrap();
            }
            ss.close_history(100).unwrap();
            ss.dump_intervals()
        };
        assert_eq!(run(), run());
    }
}
