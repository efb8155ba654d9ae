//! No-op backend: accepts every interval and remembers nothing.
//!
//! Useful when a provider is run only for its side effects (ongoing-state
//! queries, mipmap construction benchmarks) and the closed history is not
//! needed.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::HistoryBackend;
use crate::errors::Result;
use crate::interval::{Quark, StateInterval};

#[derive(Default)]
pub struct NullBackend {
    dropped: AtomicUsize,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many intervals were accepted and discarded.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl HistoryBackend for NullBackend {
    fn insert_interval(&self, _interval: StateInterval) -> Result<()> {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn query_single(&self, _quark: Quark, _ts: i64) -> Result<Option<StateInterval>> {
        Ok(None)
    }

    fn query_range(&self, _quark: Quark, _t1: i64, _t2: i64) -> Result<Vec<StateInterval>> {
        Ok(Vec::new())
    }

    fn interval_count(&self) -> usize {
        0
    }

    fn dump(&self) -> Vec<Vec<StateInterval>> {
        Vec::new()
    }

    fn delete(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StateValue;

    #[test]
    fn test_null_backend_accepts_and_forgets() {
        let backend = NullBackend::new();
        backend
            .insert_interval(StateInterval::new(0, 10, 0, StateValue::Int(1)))
            .unwrap();
        assert_eq!(backend.dropped(), 1);
        assert_eq!(backend.interval_count(), 0);
        assert!(backend.query_single(0, 5).unwrap().is_none());
    }
}
