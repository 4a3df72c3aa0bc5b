//! The process table
//!
//! Global registry of live processes, keyed by pid. A fixed array of
//! `PROC_MAX + 1` slots (index 0 is the kernel process) behind a spin-style
//! mutex: lookups happen from contexts that must not sleep, and every
//! critical section here is a few loads and stores.
//!
//! Pid allocation is circular first-fit: the scan starts just past the last
//! assigned pid and wraps around, skipping index 0, so freed pids are
//! reused promptly and allocation stays O(PROC_MAX) in the worst case.

use super::process::{Pid, Process};
use std::sync::Arc;

/// Maximum number of simultaneously live user processes.
pub const PROC_MAX: usize = 100;

enum Slot {
    Free,
    /// Pid handed out, process not yet installed (fork in flight).
    Reserved,
    Live(Arc<Process>),
}

impl Slot {
    fn is_free(&self) -> bool {
        matches!(self, Slot::Free)
    }
}

struct TableState {
    /// Index 0 is the kernel process; user pids run 1..=PROC_MAX.
    slots: Vec<Slot>,
    /// Most recently assigned pid, where the next scan starts.
    last_pid: usize,
}

pub struct ProcTable {
    state: spin::Mutex<TableState>,
}

impl ProcTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(PROC_MAX + 1);
        for _ in 0..=PROC_MAX {
            slots.push(Slot::Free);
        }
        Self {
            state: spin::Mutex::new(TableState { slots, last_pid: 0 }),
        }
    }

    /// Register the always-resident kernel process at index 0.
    pub fn install_kernel(&self, proc: Arc<Process>) {
        let mut st = self.state.lock();
        assert!(st.slots[0].is_free(), "kernel process installed twice");
        st.slots[0] = Slot::Live(proc);
    }

    /// Reserve a free pid, advancing the allocation cursor. `None` when
    /// the whole range is in use.
    pub fn reserve(&self) -> Option<Pid> {
        let mut st = self.state.lock();
        let first = if st.last_pid >= PROC_MAX {
            1
        } else {
            st.last_pid + 1
        };
        let mut index = first;
        loop {
            if st.slots[index].is_free() {
                st.slots[index] = Slot::Reserved;
                st.last_pid = index;
                return Some(Pid(index as u32));
            }
            index = if index >= PROC_MAX { 1 } else { index + 1 };
            if index == first {
                return None;
            }
        }
    }

    /// Fill a previously reserved slot.
    pub fn install(&self, pid: Pid, proc: Arc<Process>) {
        let mut st = self.state.lock();
        let slot = &mut st.slots[pid.0 as usize];
        assert!(
            matches!(*slot, Slot::Reserved),
            "install into unreserved slot {}",
            pid
        );
        *slot = Slot::Live(proc);
    }

    /// Give back a reservation that never became a process.
    pub fn cancel(&self, pid: Pid) {
        let mut st = self.state.lock();
        let slot = &mut st.slots[pid.0 as usize];
        assert!(
            matches!(*slot, Slot::Reserved),
            "cancel of unreserved slot {}",
            pid
        );
        *slot = Slot::Free;
    }

    /// Clear a slot unconditionally.
    pub fn remove(&self, pid: Pid) {
        let index = pid.0 as usize;
        if index == 0 || index > PROC_MAX {
            return;
        }
        self.state.lock().slots[index] = Slot::Free;
    }

    /// Range-check the pid and return the live occupant. The occupant's
    /// own recorded pid must agree with the slot index.
    pub fn lookup(&self, pid: Pid) -> Option<Arc<Process>> {
        let index = pid.0 as usize;
        if index > PROC_MAX {
            return None;
        }
        let st = self.state.lock();
        match &st.slots[index] {
            Slot::Live(proc) if proc.pid() == pid => Some(Arc::clone(proc)),
            _ => None,
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lookup(pid).is_some()
    }

    /// Live user processes (the kernel process does not count).
    pub fn live_count(&self) -> usize {
        let st = self.state.lock();
        st.slots[1..]
            .iter()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }

    /// Pids of all live user processes, ascending.
    pub fn live_pids(&self) -> Vec<Pid> {
        let st = self.state.lock();
        st.slots[1..]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Live(_) => Some(Pid((i + 1) as u32)),
                _ => None,
            })
            .collect()
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}
