//! Scoped timing hooks consumed by an external profiler.
//!
//! The engine brackets every node invocation and every pool allocation with
//! a start/stop timestamp pair; aggregation and formatting live outside the
//! core. A sink is installed process-wide; when none is installed every hook
//! is a no-op. Scope guards fire their stop event on drop, so the stop side
//! is delivered on error paths too.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use once_cell::sync::Lazy;

/// What a scope brackets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// One graph-node kernel invocation.
    Node,
    /// One pool allocation.
    Allocation,
    /// One optimizer pass.
    Pass,
}

/// Receiver for profile events. Implementations must tolerate concurrent
/// callers; the engine reports from every worker thread.
pub trait ProfileSink: Send + Sync {
    fn scope_started(&self, kind: ScopeKind, name: &str, at: Instant);
    fn scope_finished(&self, kind: ScopeKind, name: &str, started: Instant, finished: Instant);
    fn counter(&self, _name: &'static str, _value: u64) {}
}

static SINK: Lazy<RwLock<Option<Arc<dyn ProfileSink>>>> = Lazy::new(|| RwLock::new(None));

/// Installs the process-wide sink, replacing any previous one.
pub fn set_sink(sink: Arc<dyn ProfileSink>) {
    *SINK.write().expect("profile sink lock poisoned") = Some(sink);
}

/// Removes the installed sink.
pub fn clear_sink() {
    *SINK.write().expect("profile sink lock poisoned") = None;
}

fn current_sink() -> Option<Arc<dyn ProfileSink>> {
    SINK.read().expect("profile sink lock poisoned").clone()
}

/// Guard that reports the stop timestamp when dropped.
pub struct ScopeGuard {
    sink: Arc<dyn ProfileSink>,
    kind: ScopeKind,
    name: String,
    started: Instant,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.sink
            .scope_finished(self.kind, &self.name, self.started, Instant::now());
    }
}

/// Opens a scope if a sink is installed.
pub fn scope(kind: ScopeKind, name: &str) -> Option<ScopeGuard> {
    let sink = current_sink()?;
    let started = Instant::now();
    sink.scope_started(kind, name, started);
    Some(ScopeGuard {
        sink,
        kind,
        name: name.to_string(),
        started,
    })
}

/// Reports bytes handed out by the pool.
pub fn alloc_event(bytes: usize) {
    if let Some(sink) = current_sink() {
        sink.counter("pool_alloc_bytes", bytes as u64);
    }
}

/// Bumps a named counter (plan-cache hits, optimizer fallbacks, ...).
pub fn cache_event(name: &'static str) {
    if let Some(sink) = current_sink() {
        sink.counter(name, 1);
    }
}

/// In-memory aggregating sink, handy for tests and ad-hoc profiling runs.
#[cfg(feature = "profiler")]
pub mod recorder {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use super::{ProfileSink, ScopeKind};

    #[derive(Default, Clone)]
    pub struct ScopeStat {
        pub calls: u64,
        pub total: Duration,
    }

    #[derive(Default)]
    pub struct Recorder {
        scopes: Mutex<HashMap<(ScopeKind, String), ScopeStat>>,
        counters: Mutex<HashMap<&'static str, u64>>,
    }

    impl Recorder {
        pub fn new() -> Self {
            Recorder::default()
        }

        pub fn scope_stat(&self, kind: ScopeKind, name: &str) -> Option<ScopeStat> {
            self.scopes
                .lock()
                .expect("recorder lock poisoned")
                .get(&(kind, name.to_string()))
                .cloned()
        }

        pub fn counter_value(&self, name: &'static str) -> u64 {
            *self
                .counters
                .lock()
                .expect("recorder lock poisoned")
                .get(name)
                .unwrap_or(&0)
        }
    }

    impl ProfileSink for Recorder {
        fn scope_started(&self, _kind: ScopeKind, _name: &str, _at: Instant) {}

        fn scope_finished(&self, kind: ScopeKind, name: &str, started: Instant, finished: Instant) {
            let mut scopes = self.scopes.lock().expect("recorder lock poisoned");
            let stat = scopes.entry((kind, name.to_string())).or_default();
            stat.calls += 1;
            stat.total += finished.duration_since(started);
        }

        fn counter(&self, name: &'static str, value: u64) {
            let mut counters = self.counters.lock().expect("recorder lock poisoned");
            *counters.entry(name).or_insert(0) += value;
        }
    }
}
