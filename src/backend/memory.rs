//! In-memory interval store with binary-search point queries.

use std::sync::RwLock;

use crate::backend::HistoryBackend;
use crate::errors::{Result, StateError};
use crate::interval::{Quark, StateInterval};

/// Closed intervals held in one sorted `Vec` per quark.
///
/// Inserts only ever append (the builder hands intervals over in time
/// order), so point queries binary-search on interval end time. The outer
/// `RwLock` gives concurrent readers a consistent snapshot while the writer
/// appends; closed intervals themselves are never mutated in place.
pub struct InMemoryBackend {
    intervals: RwLock<Vec<Vec<StateInterval>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            intervals: RwLock::new(Vec::new()),
        }
    }

    /// Rebuild a backend from a persisted per-quark dump.
    pub fn from_dump(dump: Vec<Vec<StateInterval>>) -> Self {
        Self {
            intervals: RwLock::new(dump),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryBackend for InMemoryBackend {
    fn insert_interval(&self, interval: StateInterval) -> Result<()> {
        if interval.start > interval.end {
            return Err(StateError::InvariantViolation(format!(
                "interval start {} after end {} for quark {}",
                interval.start, interval.end, interval.attribute
            )));
        }
        let mut store = self.intervals.write().unwrap();
        if interval.attribute >= store.len() {
            store.resize_with(interval.attribute + 1, Vec::new);
        }
        let list = &mut store[interval.attribute];
        if let Some(last) = list.last() {
            if interval.start != last.end + 1 {
                return Err(StateError::InvariantViolation(format!(
                    "quark {}: interval starting at {} does not continue from {}",
                    interval.attribute, interval.start, last.end
                )));
            }
        }
        list.push(interval);
        Ok(())
    }

    fn query_single(&self, quark: Quark, ts: i64) -> Result<Option<StateInterval>> {
        let store = self.intervals.read().unwrap();
        let Some(list) = store.get(quark) else {
            return Ok(None);
        };
        // Intervals are sorted and contiguous; find the first whose end
        // covers ts.
        let idx = list.partition_point(|iv| iv.end < ts);
        match list.get(idx) {
            Some(iv) if iv.intersects(ts) => Ok(Some(iv.clone())),
            _ => Ok(None),
        }
    }

    fn query_range(&self, quark: Quark, t1: i64, t2: i64) -> Result<Vec<StateInterval>> {
        let store = self.intervals.read().unwrap();
        let Some(list) = store.get(quark) else {
            return Ok(Vec::new());
        };
        let first = list.partition_point(|iv| iv.end < t1);
        Ok(list[first..]
            .iter()
            .take_while(|iv| iv.start <= t2)
            .cloned()
            .collect())
    }

    fn interval_count(&self) -> usize {
        self.intervals.read().unwrap().iter().map(Vec::len).sum()
    }

    fn dump(&self) -> Vec<Vec<StateInterval>> {
        self.intervals.read().unwrap().clone()
    }

    fn delete(&self) {
        self.intervals.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StateValue;

    fn iv(start: i64, end: i64, quark: Quark, v: i64) -> StateInterval {
        StateInterval::new(start, end, quark, StateValue::Long(v))
    }

    #[test]
    fn test_point_query_hits_covering_interval() {
        let backend = InMemoryBackend::new();
        backend.insert_interval(iv(0, 99, 0, 1)).unwrap();
        backend.insert_interval(iv(100, 199, 0, 2)).unwrap();
        backend.insert_interval(iv(200, 300, 0, 3)).unwrap();

        assert_eq!(backend.query_single(0, 0).unwrap().unwrap(), iv(0, 99, 0, 1));
        assert_eq!(
            backend.query_single(0, 150).unwrap().unwrap(),
            iv(100, 199, 0, 2)
        );
        assert_eq!(
            backend.query_single(0, 300).unwrap().unwrap(),
            iv(200, 300, 0, 3)
        );
        assert!(backend.query_single(0, 301).unwrap().is_none());
    }

    #[test]
    fn test_gap_insert_is_fatal() {
        let backend = InMemoryBackend::new();
        backend.insert_interval(iv(0, 99, 0, 1)).unwrap();
        let err = backend.insert_interval(iv(150, 199, 0, 2)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_overlap_insert_is_fatal() {
        let backend = InMemoryBackend::new();
        backend.insert_interval(iv(0, 99, 0, 1)).unwrap();
        let err = backend.insert_interval(iv(50, 199, 0, 2)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_range_query_returns_intersecting_ordered() {
        let backend = InMemoryBackend::new();
        for (s, e, v) in [(0, 99, 1), (100, 199, 2), (200, 299, 3), (300, 399, 4)] {
            backend.insert_interval(iv(s, e, 0, v)).unwrap();
        }
        let got = backend.query_range(0, 150, 250).unwrap();
        assert_eq!(got, vec![iv(100, 199, 0, 2), iv(200, 299, 0, 3)]);

        // A range touching only a boundary nanosecond still intersects.
        let got = backend.query_range(0, 99, 99).unwrap();
        assert_eq!(got, vec![iv(0, 99, 0, 1)]);
    }

    #[test]
    fn test_unknown_quark_queries_empty() {
        let backend = InMemoryBackend::new();
        assert!(backend.query_single(7, 0).unwrap().is_none());
        assert!(backend.query_range(7, 0, 100).unwrap().is_empty());
    }

    #[test]
    fn test_zero_length_interval() {
        let backend = InMemoryBackend::new();
        backend.insert_interval(iv(0, 0, 0, 1)).unwrap();
        backend.insert_interval(iv(1, 10, 0, 2)).unwrap();
        assert_eq!(backend.query_single(0, 0).unwrap().unwrap(), iv(0, 0, 0, 1));
    }

    #[test]
    fn test_delete_clears_everything() {
        let backend = InMemoryBackend::new();
        backend.insert_interval(iv(0, 99, 0, 1)).unwrap();
        backend.delete();
        assert_eq!(backend.interval_count(), 0);
        assert!(backend.query_single(0, 50).unwrap().is_none());
    }
}
