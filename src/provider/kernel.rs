//! Scheduler/IRQ/syscall state machine: the reference state provider.
//!
//! For each event this looks up (or creates) the relevant attribute nodes
//! under `CPUs/`, `Threads/` and `Resources/` and calls `modify_attribute`
//! to reflect the event's semantics. Dispatch goes through the closed
//! [`EventKind`] enum; unknown event names produce no state change, so new
//! tracepoints in a trace never error.
//!
//! Attribute layout:
//!
//! ```text
//! CPUs/{cpu}/Current_thread      Int tid
//! CPUs/{cpu}/Status              Int (see [`status`])
//! Threads/{tid}/Status           Int (see [`status`])
//! Threads/{tid}/System_call      Str syscall name, Null when none open
//! Threads/{tid}/Exec_name        Str comm, from fork
//! Threads/{tid}/PPID             Int parent tid, from fork
//! Resources/IRQs/{irq}           Int cpu servicing it, Null when idle
//! Resources/Soft_IRQs/{vec}      Int cpu servicing it, Null when idle
//! ```

use log::debug;

use crate::errors::{Result, StateError};
use crate::event::{EventClassifier, EventKind, TraceEvent};
use crate::interval::Quark;
use crate::provider::StateProvider;
use crate::system::StateSystem;
use crate::value::StateValue;

/// Integer state values written into the Status attributes.
pub mod status {
    pub const CPU_IDLE: i32 = 0;
    pub const CPU_RUN_USERMODE: i32 = 1;
    pub const CPU_RUN_SYSCALL: i32 = 2;
    pub const CPU_IRQ: i32 = 3;
    pub const CPU_SOFTIRQ: i32 = 4;

    pub const WAIT_BLOCKED: i32 = 1;
    pub const WAIT_FOR_CPU: i32 = 2;
    pub const RUN_USERMODE: i32 = 3;
    pub const RUN_SYSCALL: i32 = 4;
}

pub struct KernelStateProvider {
    classifier: EventClassifier,
}

/// Bumped whenever the attribute layout or a transition changes; persisted
/// histories built under another version are stale.
pub const KERNEL_PROVIDER_VERSION: i32 = 3;

impl KernelStateProvider {
    pub fn new() -> Self {
        Self {
            classifier: EventClassifier::new(),
        }
    }

    fn cpu_quark(ss: &StateSystem, cpu: u32, leaf: &str) -> Quark {
        ss.attributes()
            .quark_for_and_add(&["CPUs", &cpu.to_string(), leaf])
    }

    fn thread_quark(ss: &StateSystem, tid: i64, leaf: &str) -> Quark {
        ss.attributes()
            .quark_for_and_add(&["Threads", &tid.to_string(), leaf])
    }

    fn missing_field(event: &TraceEvent, field: &'static str) -> StateError {
        StateError::AttributeNotFound {
            path: format!("{}.{field}", event.name),
        }
    }

    /// Running status for a thread: in a syscall if it has one open.
    fn running_status(ss: &StateSystem, tid: i64) -> Result<i32> {
        let syscall = ss
            .attributes()
            .quark_for(&["Threads", &tid.to_string(), "System_call"]);
        match syscall {
            Ok(q) if !ss.query_ongoing_state(q)?.is_null() => Ok(status::RUN_SYSCALL),
            _ => Ok(status::RUN_USERMODE),
        }
    }

    fn handle_sched_switch(&self, ss: &StateSystem, event: &TraceEvent) -> Result<()> {
        let prev_tid = event
            .field_long("prev_tid")
            .ok_or_else(|| Self::missing_field(event, "prev_tid"))?;
        let next_tid = event
            .field_long("next_tid")
            .ok_or_else(|| Self::missing_field(event, "next_tid"))?;
        let prev_state = event.field_long("prev_state").unwrap_or(0);
        let ts = event.ts;

        // The departing thread goes back to the run queue when it was
        // preempted (state 0), otherwise it blocked.
        let prev_status = if prev_state == 0 {
            status::WAIT_FOR_CPU
        } else {
            status::WAIT_BLOCKED
        };
        let q = Self::thread_quark(ss, prev_tid, "Status");
        ss.modify_attribute(ts, StateValue::Int(prev_status), q)?;

        // The incoming thread runs in usermode unless it still has an open
        // syscall.
        let next_status = Self::running_status(ss, next_tid)?;
        let q = Self::thread_quark(ss, next_tid, "Status");
        ss.modify_attribute(ts, StateValue::Int(next_status), q)?;

        let q = Self::cpu_quark(ss, event.cpu, "Current_thread");
        ss.modify_attribute(ts, StateValue::Int(next_tid as i32), q)?;

        let cpu_status = if next_tid == 0 {
            status::CPU_IDLE
        } else if next_status == status::RUN_SYSCALL {
            status::CPU_RUN_SYSCALL
        } else {
            status::CPU_RUN_USERMODE
        };
        let q = Self::cpu_quark(ss, event.cpu, "Status");
        ss.modify_attribute(ts, StateValue::Int(cpu_status), q)
    }

    fn handle_wakeup(&self, ss: &StateSystem, event: &TraceEvent) -> Result<()> {
        let tid = event
            .field_long("tid")
            .ok_or_else(|| Self::missing_field(event, "tid"))?;
        let q = Self::thread_quark(ss, tid, "Status");
        // A wakeup for a thread already on a CPU changes nothing.
        let current = ss.query_ongoing_state(q)?;
        if let Ok(s) = current.unbox_int() {
            if s == status::RUN_USERMODE || s == status::RUN_SYSCALL {
                return Ok(());
            }
        }
        ss.modify_attribute(event.ts, StateValue::Int(status::WAIT_FOR_CPU), q)
    }

    fn handle_fork(&self, ss: &StateSystem, event: &TraceEvent) -> Result<()> {
        let parent_tid = event
            .field_long("parent_tid")
            .ok_or_else(|| Self::missing_field(event, "parent_tid"))?;
        let child_tid = event
            .field_long("child_tid")
            .ok_or_else(|| Self::missing_field(event, "child_tid"))?;
        let ts = event.ts;

        let q = Self::thread_quark(ss, child_tid, "PPID");
        ss.modify_attribute(ts, StateValue::Int(parent_tid as i32), q)?;
        if let Some(comm) = event.field_str("child_comm") {
            let q = Self::thread_quark(ss, child_tid, "Exec_name");
            ss.modify_attribute(ts, StateValue::Str(comm.to_string()), q)?;
        }
        let q = Self::thread_quark(ss, child_tid, "Status");
        ss.modify_attribute(ts, StateValue::Int(status::WAIT_FOR_CPU), q)
    }

    fn handle_process_free(&self, ss: &StateSystem, event: &TraceEvent) -> Result<()> {
        let tid = event
            .field_long("tid")
            .ok_or_else(|| Self::missing_field(event, "tid"))?;
        let thread = ss
            .attributes()
            .quark_for_and_add(&["Threads", &tid.to_string()]);
        ss.remove_attribute(event.ts, thread)
    }

    fn handle_irq(&self, ss: &StateSystem, event: &TraceEvent, entry: bool) -> Result<()> {
        let irq = event
            .field_long("irq")
            .ok_or_else(|| Self::missing_field(event, "irq"))?;
        let ts = event.ts;
        let q = ss
            .attributes()
            .quark_for_and_add(&["Resources", "IRQs", &irq.to_string()]);
        if entry {
            ss.modify_attribute(ts, StateValue::Int(event.cpu as i32), q)?;
            let q = Self::cpu_quark(ss, event.cpu, "Status");
            ss.modify_attribute(ts, StateValue::Int(status::CPU_IRQ), q)
        } else {
            ss.modify_attribute(ts, StateValue::Null, q)?;
            self.restore_cpu_status(ss, event.cpu, ts)
        }
    }

    fn handle_softirq(&self, ss: &StateSystem, event: &TraceEvent, entry: bool) -> Result<()> {
        let vec = event
            .field_long("vec")
            .ok_or_else(|| Self::missing_field(event, "vec"))?;
        let ts = event.ts;
        let q = ss
            .attributes()
            .quark_for_and_add(&["Resources", "Soft_IRQs", &vec.to_string()]);
        if entry {
            ss.modify_attribute(ts, StateValue::Int(event.cpu as i32), q)?;
            let q = Self::cpu_quark(ss, event.cpu, "Status");
            ss.modify_attribute(ts, StateValue::Int(status::CPU_SOFTIRQ), q)
        } else {
            ss.modify_attribute(ts, StateValue::Null, q)?;
            self.restore_cpu_status(ss, event.cpu, ts)
        }
    }

    /// After an interrupt handler returns, the CPU status falls back to
    /// whatever the current thread was doing.
    fn restore_cpu_status(&self, ss: &StateSystem, cpu: u32, ts: i64) -> Result<()> {
        let current = Self::cpu_quark(ss, cpu, "Current_thread");
        let tid = ss.query_ongoing_state(current)?.unbox_int().unwrap_or(0) as i64;
        let cpu_status = if tid == 0 {
            status::CPU_IDLE
        } else if Self::running_status(ss, tid)? == status::RUN_SYSCALL {
            status::CPU_RUN_SYSCALL
        } else {
            status::CPU_RUN_USERMODE
        };
        let q = Self::cpu_quark(ss, cpu, "Status");
        ss.modify_attribute(ts, StateValue::Int(cpu_status), q)
    }

    fn handle_sys_entry(&self, ss: &StateSystem, event: &TraceEvent) -> Result<()> {
        let tid = self.current_tid(ss, event)?;
        let ts = event.ts;
        let q = Self::thread_quark(ss, tid, "System_call");
        ss.modify_attribute(ts, StateValue::Str(event.name.clone()), q)?;
        let q = Self::thread_quark(ss, tid, "Status");
        ss.modify_attribute(ts, StateValue::Int(status::RUN_SYSCALL), q)?;
        let q = Self::cpu_quark(ss, event.cpu, "Status");
        ss.modify_attribute(ts, StateValue::Int(status::CPU_RUN_SYSCALL), q)
    }

    fn handle_sys_exit(&self, ss: &StateSystem, event: &TraceEvent) -> Result<()> {
        let tid = self.current_tid(ss, event)?;
        let ts = event.ts;
        let q = Self::thread_quark(ss, tid, "System_call");
        ss.modify_attribute(ts, StateValue::Null, q)?;
        let q = Self::thread_quark(ss, tid, "Status");
        ss.modify_attribute(ts, StateValue::Int(status::RUN_USERMODE), q)?;
        let q = Self::cpu_quark(ss, event.cpu, "Status");
        ss.modify_attribute(ts, StateValue::Int(status::CPU_RUN_USERMODE), q)
    }

    /// Processing context: the thread currently on the event's CPU, either
    /// from an explicit `tid` field or from the CPU's Current_thread.
    fn current_tid(&self, ss: &StateSystem, event: &TraceEvent) -> Result<i64> {
        if let Some(tid) = event.field_long("tid") {
            return Ok(tid);
        }
        let q = ss
            .attributes()
            .quark_for(&["CPUs", &event.cpu.to_string(), "Current_thread"])?;
        Ok(ss.query_ongoing_state(q)?.unbox_int()? as i64)
    }
}

impl Default for KernelStateProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StateProvider for KernelStateProvider {
    fn version(&self) -> i32 {
        KERNEL_PROVIDER_VERSION
    }

    fn process_event(&mut self, ss: &StateSystem, event: &TraceEvent) -> Result<()> {
        match self.classifier.classify(&event.name) {
            EventKind::SchedSwitch => self.handle_sched_switch(ss, event),
            EventKind::SchedWakeup | EventKind::SchedWakeupNew => self.handle_wakeup(ss, event),
            EventKind::SchedProcessFork => self.handle_fork(ss, event),
            EventKind::SchedProcessFree => self.handle_process_free(ss, event),
            EventKind::IrqHandlerEntry => self.handle_irq(ss, event, true),
            EventKind::IrqHandlerExit => self.handle_irq(ss, event, false),
            EventKind::SoftirqEntry => self.handle_softirq(ss, event, true),
            EventKind::SoftirqExit => self.handle_softirq(ss, event, false),
            EventKind::SysEntry => self.handle_sys_entry(ss, event),
            EventKind::SysExit => self.handle_sys_exit(ss, event),
            EventKind::Unknown => {
                debug!("no transition for event {:?}", event.name);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn build(events: Vec<TraceEvent>) -> StateSystem {
        let ss = StateSystem::new(Box::new(InMemoryBackend::new()), 0);
        let mut provider = KernelStateProvider::new();
        let mut last = 0;
        for ev in events {
            last = ev.ts;
            provider.process_event(&ss, &ev).unwrap();
        }
        ss.close_history(last.max(0) + 100).unwrap();
        ss
    }

    fn sched_switch(ts: i64, cpu: u32, prev: i64, prev_state: i64, next: i64) -> TraceEvent {
        TraceEvent::new(ts, "sched_switch", cpu)
            .with_field_long("prev_tid", prev)
            .with_field_long("prev_state", prev_state)
            .with_field_long("next_tid", next)
    }

    fn thread_status(ss: &StateSystem, tid: i64, ts: i64) -> i32 {
        let q = ss
            .attributes()
            .quark_for(&["Threads", &tid.to_string(), "Status"])
            .unwrap();
        ss.query_single_state(ts, q).unwrap().value.unbox_int().unwrap()
    }

    #[test]
    fn test_sched_switch_thread_states() {
        // Thread 2 runs from t=100 and is preempted back out at t=200.
        let ss = build(vec![
            sched_switch(100, 0, 1, 0, 2),
            sched_switch(200, 0, 2, 0, 1),
        ]);

        assert_eq!(thread_status(&ss, 2, 150), status::RUN_USERMODE);
        assert_eq!(thread_status(&ss, 2, 250), status::WAIT_FOR_CPU);
        assert_eq!(thread_status(&ss, 1, 150), status::WAIT_FOR_CPU);
        assert_eq!(thread_status(&ss, 1, 250), status::RUN_USERMODE);
    }

    #[test]
    fn test_sched_switch_blocked_vs_preempted() {
        // prev_state != 0 means the thread went to sleep rather than being
        // preempted.
        let ss = build(vec![
            sched_switch(100, 0, 1, 0, 2),
            sched_switch(200, 0, 2, 2, 1),
        ]);
        assert_eq!(thread_status(&ss, 2, 250), status::WAIT_BLOCKED);
    }

    #[test]
    fn test_cpu_current_thread_tracks_switches() {
        let ss = build(vec![
            sched_switch(100, 1, 0, 0, 7),
            sched_switch(300, 1, 7, 0, 0),
        ]);
        let q = ss
            .attributes()
            .quark_for(&["CPUs", "1", "Current_thread"])
            .unwrap();
        assert_eq!(
            ss.query_single_state(200, q).unwrap().value,
            StateValue::Int(7)
        );
        assert_eq!(
            ss.query_single_state(350, q).unwrap().value,
            StateValue::Int(0)
        );

        let q = ss.attributes().quark_for(&["CPUs", "1", "Status"]).unwrap();
        assert_eq!(
            ss.query_single_state(350, q).unwrap().value,
            StateValue::Int(status::CPU_IDLE)
        );
    }

    #[test]
    fn test_syscall_entry_exit() {
        let ss = build(vec![
            sched_switch(100, 0, 0, 0, 5),
            TraceEvent::new(150, "sys_enter_read", 0).with_field_long("tid", 5),
            TraceEvent::new(250, "sys_exit_read", 0).with_field_long("tid", 5),
        ]);

        let q = ss
            .attributes()
            .quark_for(&["Threads", "5", "System_call"])
            .unwrap();
        assert_eq!(
            ss.query_single_state(200, q).unwrap().value,
            StateValue::Str("sys_enter_read".to_string())
        );
        assert!(ss.query_single_state(300, q).unwrap().value.is_null());
        assert_eq!(thread_status(&ss, 5, 200), status::RUN_SYSCALL);
        assert_eq!(thread_status(&ss, 5, 300), status::RUN_USERMODE);
    }

    #[test]
    fn test_switch_into_open_syscall_resumes_run_syscall() {
        // Thread 5 enters a syscall, is switched out mid-call, then switched
        // back in: it must resume in RUN_SYSCALL, not RUN_USERMODE.
        let ss = build(vec![
            sched_switch(100, 0, 0, 0, 5),
            TraceEvent::new(150, "sys_enter_futex", 0).with_field_long("tid", 5),
            sched_switch(200, 0, 5, 2, 6),
            sched_switch(300, 0, 6, 0, 5),
        ]);
        assert_eq!(thread_status(&ss, 5, 350), status::RUN_SYSCALL);
    }

    #[test]
    fn test_irq_nests_over_cpu_status() {
        let ss = build(vec![
            sched_switch(100, 0, 0, 0, 5),
            TraceEvent::new(200, "irq_handler_entry", 0).with_field_long("irq", 19),
            TraceEvent::new(250, "irq_handler_exit", 0).with_field_long("irq", 19),
        ]);

        let q = ss
            .attributes()
            .quark_for(&["Resources", "IRQs", "19"])
            .unwrap();
        assert_eq!(
            ss.query_single_state(225, q).unwrap().value,
            StateValue::Int(0)
        );
        assert!(ss.query_single_state(300, q).unwrap().value.is_null());

        let cpu = ss.attributes().quark_for(&["CPUs", "0", "Status"]).unwrap();
        assert_eq!(
            ss.query_single_state(225, cpu).unwrap().value,
            StateValue::Int(status::CPU_IRQ)
        );
        assert_eq!(
            ss.query_single_state(300, cpu).unwrap().value,
            StateValue::Int(status::CPU_RUN_USERMODE)
        );
    }

    #[test]
    fn test_softirq_tracks_vector() {
        let ss = build(vec![
            TraceEvent::new(100, "softirq_entry", 2).with_field_long("vec", 9),
            TraceEvent::new(180, "softirq_exit", 2).with_field_long("vec", 9),
        ]);
        let q = ss
            .attributes()
            .quark_for(&["Resources", "Soft_IRQs", "9"])
            .unwrap();
        assert_eq!(
            ss.query_single_state(150, q).unwrap().value,
            StateValue::Int(2)
        );
        assert!(ss.query_single_state(200, q).unwrap().value.is_null());
    }

    #[test]
    fn test_fork_creates_child_subtree() {
        let ss = build(vec![TraceEvent::new(100, "sched_process_fork", 0)
            .with_field_long("parent_tid", 1)
            .with_field_long("child_tid", 42)
            .with_field_str("child_comm", "worker")]);

        let q = ss
            .attributes()
            .quark_for(&["Threads", "42", "Exec_name"])
            .unwrap();
        assert_eq!(
            ss.query_single_state(150, q).unwrap().value,
            StateValue::Str("worker".to_string())
        );
        let q = ss.attributes().quark_for(&["Threads", "42", "PPID"]).unwrap();
        assert_eq!(
            ss.query_single_state(150, q).unwrap().value,
            StateValue::Int(1)
        );
        assert_eq!(thread_status(&ss, 42, 150), status::WAIT_FOR_CPU);
    }

    #[test]
    fn test_process_free_closes_subtree() {
        let ss = build(vec![
            sched_switch(100, 0, 0, 0, 42),
            TraceEvent::new(500, "sched_process_free", 0).with_field_long("tid", 42),
        ]);
        let q = ss
            .attributes()
            .quark_for(&["Threads", "42", "Status"])
            .unwrap();
        assert_eq!(
            ss.query_single_state(200, q).unwrap().value,
            StateValue::Int(status::RUN_USERMODE)
        );
        assert!(ss.query_single_state(600, q).unwrap().value.is_null());
    }

    #[test]
    fn test_unknown_event_is_noop() {
        let ss = build(vec![
            sched_switch(100, 0, 0, 0, 5),
            TraceEvent::new(200, "block_rq_issue", 0).with_field_long("dev", 8),
        ]);
        // Nothing beyond the sched_switch attributes exists.
        assert!(ss.attributes().quark_for(&["block_rq_issue"]).is_err());
        assert_eq!(thread_status(&ss, 5, 250), status::RUN_USERMODE);
    }

    #[test]
    fn test_wakeup_of_running_thread_is_noop() {
        let ss = build(vec![
            sched_switch(100, 0, 0, 0, 5),
            TraceEvent::new(200, "sched_wakeup", 1).with_field_long("tid", 5),
        ]);
        assert_eq!(thread_status(&ss, 5, 250), status::RUN_USERMODE);
    }
}
