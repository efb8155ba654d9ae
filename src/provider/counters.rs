//! Counter provider: turns numeric sample events into summarized attributes.
//!
//! Every event carrying a numeric `value` field becomes a state change on
//! `Counters/{event name}`, routed through a [`MipmapWriter`] so min/max/avg
//! summary levels build up alongside the base history. Events without a
//! `value` field are ignored.

use crate::errors::Result;
use crate::event::TraceEvent;
use crate::mipmap::{MipmapKind, MipmapWriter};
use crate::provider::StateProvider;
use crate::system::StateSystem;
use crate::value::StateValue;

pub const COUNTER_PROVIDER_VERSION: i32 = 1;

const ALL_KINDS: &[MipmapKind] = &[MipmapKind::Min, MipmapKind::Max, MipmapKind::Avg];

pub struct CounterStateProvider {
    writer: MipmapWriter,
}

impl CounterStateProvider {
    pub fn new(resolution: u64) -> Self {
        Self {
            writer: MipmapWriter::new(resolution),
        }
    }
}

impl StateProvider for CounterStateProvider {
    fn version(&self) -> i32 {
        COUNTER_PROVIDER_VERSION
    }

    fn process_event(&mut self, ss: &StateSystem, event: &TraceEvent) -> Result<()> {
        let Some(value) = event.field_long("value") else {
            return Ok(());
        };
        let q = ss
            .attributes()
            .quark_for_and_add(&["Counters", &event.name]);
        if !self.writer.is_registered(q) {
            self.writer.register(q, ALL_KINDS);
        }
        self.writer
            .modify_attribute(ss, event.ts, StateValue::Long(value), q)
    }

    fn done(&mut self, ss: &StateSystem, end_ts: i64) -> Result<()> {
        self.writer.close(ss, end_ts)
    }
}
