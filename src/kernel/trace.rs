//! Instrumentation and tracing
//!
//! Lightweight syscall tracing: per-call counters, error counts, and a
//! bounded ring of recent events. Disabled by default and cheap when off;
//! the syscall layer records one event per completed operation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Maximum number of events kept in the trace ring.
pub const TRACE_BUFFER_SIZE: usize = 1000;

/// One recorded syscall completion.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub name: &'static str,
    pub pid: u32,
    pub ok: bool,
}

/// Counters for one syscall.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfCounters {
    pub calls: u64,
    pub errors: u64,
}

impl PerfCounters {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            (self.calls - self.errors) as f64 / self.calls as f64
        }
    }
}

/// Aggregated view across all syscalls.
#[derive(Debug, Clone, Default)]
pub struct TraceSummary {
    pub total_calls: u64,
    pub total_errors: u64,
    /// Per-syscall counters, sorted by name.
    pub by_call: Vec<(&'static str, PerfCounters)>,
}

struct TraceState {
    enabled: bool,
    events: VecDeque<TraceEvent>,
    counters: HashMap<&'static str, PerfCounters>,
}

pub struct Tracer {
    state: Mutex<TraceState>,
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TraceState {
                enabled: false,
                events: VecDeque::new(),
                counters: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TraceState> {
        self.state.lock().expect("tracer poisoned")
    }

    pub fn enable(&self) {
        self.state().enabled = true;
    }

    pub fn disable(&self) {
        self.state().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    /// Record one syscall completion. A no-op while disabled.
    pub fn record(&self, name: &'static str, pid: u32, ok: bool) {
        let mut st = self.state();
        if !st.enabled {
            return;
        }
        if st.events.len() >= TRACE_BUFFER_SIZE {
            st.events.pop_front();
        }
        st.events.push_back(TraceEvent { name, pid, ok });
        let c = st.counters.entry(name).or_default();
        c.calls += 1;
        if !ok {
            c.errors += 1;
        }
    }

    /// Recent events, oldest first.
    pub fn recent(&self) -> Vec<TraceEvent> {
        self.state().events.iter().cloned().collect()
    }

    pub fn summary(&self) -> TraceSummary {
        let st = self.state();
        let mut by_call: Vec<_> = st.counters.iter().map(|(&n, &c)| (n, c)).collect();
        by_call.sort_by_key(|(n, _)| *n);
        TraceSummary {
            total_calls: by_call.iter().map(|(_, c)| c.calls).sum(),
            total_errors: by_call.iter().map(|(_, c)| c.errors).sum(),
            by_call,
        }
    }

    pub fn reset(&self) {
        let mut st = self.state();
        st.events.clear();
        st.counters.clear();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracer_records_nothing() {
        let tracer = Tracer::new();
        tracer.record("open", 1, true);
        assert!(tracer.recent().is_empty());
        assert_eq!(tracer.summary().total_calls, 0);
    }

    #[test]
    fn counters_accumulate_per_call() {
        let tracer = Tracer::new();
        tracer.enable();
        tracer.record("open", 1, true);
        tracer.record("open", 1, false);
        tracer.record("write", 2, true);

        let summary = tracer.summary();
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.total_errors, 1);
        let open = summary
            .by_call
            .iter()
            .find(|(n, _)| *n == "open")
            .unwrap()
            .1;
        assert_eq!(open.calls, 2);
        assert_eq!(open.errors, 1);
        assert_eq!(open.success_rate(), 0.5);
    }

    #[test]
    fn ring_is_bounded() {
        let tracer = Tracer::new();
        tracer.enable();
        for i in 0..(TRACE_BUFFER_SIZE + 10) {
            tracer.record("getpid", i as u32, true);
        }
        let events = tracer.recent();
        assert_eq!(events.len(), TRACE_BUFFER_SIZE);
        // Oldest events were dropped.
        assert_eq!(events[0].pid, 10);
    }

    #[test]
    fn reset_clears_everything() {
        let tracer = Tracer::new();
        tracer.enable();
        tracer.record("fork", 1, true);
        tracer.reset();
        assert!(tracer.recent().is_empty());
        assert_eq!(tracer.summary().total_calls, 0);
        assert!(tracer.is_enabled());
    }
}
