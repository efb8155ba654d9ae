//! Decoded trace events as consumed by state providers.
//!
//! The engine never parses binary trace formats; an event arrives as an
//! already-decoded `(timestamp, name, fields, cpu)` tuple. Event name
//! dispatch goes through [`EventClassifier`], a closed enum mapping built
//! once at provider construction so the hot path never string-compares
//! against every known event name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Timestamp of the end-of-stream sentinel event.
pub const SENTINEL_TS: i64 = -1;

/// A single decoded field value. JSONL input maps numbers to `Long` and
/// everything else to `Str`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Long(i64),
    Str(String),
}

/// One decoded trace event.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ts: i64,
    pub name: String,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
}

impl TraceEvent {
    pub fn new(ts: i64, name: &str, cpu: u32) -> Self {
        Self {
            ts,
            name: name.to_string(),
            cpu,
            fields: HashMap::new(),
        }
    }

    pub fn with_field_long(mut self, name: &str, value: i64) -> Self {
        self.fields.insert(name.to_string(), FieldValue::Long(value));
        self
    }

    pub fn with_field_str(mut self, name: &str, value: &str) -> Self {
        self.fields
            .insert(name.to_string(), FieldValue::Str(value.to_string()));
        self
    }

    /// The end-of-stream poison pill. Never reaches a provider; the pipeline
    /// consumes it and closes the history at the last real event's timestamp.
    pub fn sentinel() -> Self {
        Self::new(SENTINEL_TS, "", 0)
    }

    pub fn is_sentinel(&self) -> bool {
        self.ts == SENTINEL_TS
    }

    pub fn field_long(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(FieldValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Closed set of event kinds the kernel provider reacts to. Anything not in
/// the table classifies as `Unknown` and produces no state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    SchedSwitch,
    SchedWakeup,
    SchedWakeupNew,
    SchedProcessFork,
    SchedProcessFree,
    IrqHandlerEntry,
    IrqHandlerExit,
    SoftirqEntry,
    SoftirqExit,
    SysEntry,
    SysExit,
    Unknown,
}

/// Name -> kind table, built once per provider.
pub struct EventClassifier {
    table: HashMap<&'static str, EventKind>,
}

const EVENT_NAMES: &[(&str, EventKind)] = &[
    ("sched_switch", EventKind::SchedSwitch),
    ("sched_wakeup", EventKind::SchedWakeup),
    ("sched_waking", EventKind::SchedWakeup),
    ("sched_wakeup_new", EventKind::SchedWakeupNew),
    ("sched_process_fork", EventKind::SchedProcessFork),
    ("sched_process_free", EventKind::SchedProcessFree),
    ("irq_handler_entry", EventKind::IrqHandlerEntry),
    ("irq_handler_exit", EventKind::IrqHandlerExit),
    ("softirq_entry", EventKind::SoftirqEntry),
    ("softirq_exit", EventKind::SoftirqExit),
    ("sys_exit", EventKind::SysExit),
];

impl EventClassifier {
    pub fn new() -> Self {
        Self {
            table: EVENT_NAMES.iter().copied().collect(),
        }
    }

    pub fn classify(&self, name: &str) -> EventKind {
        if let Some(kind) = self.table.get(name) {
            return *kind;
        }
        // Syscall entry tracepoints carry the syscall name in the event name
        // itself (sys_enter_read, sys_enter_futex, ...).
        if name.starts_with("sys_enter") {
            return EventKind::SysEntry;
        }
        if name.starts_with("sys_exit") {
            return EventKind::SysExit;
        }
        EventKind::Unknown
    }
}

impl Default for EventClassifier {
    fn default() -> Self {
        Self::new()
    }
}
