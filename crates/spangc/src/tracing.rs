//! Collector tracing support.
//!
//! With the `tracing` feature, cycles and their phases get spans and the
//! heap reports growth, scavenging, sweep completion, assists and queued
//! finalizers as events.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of a collection cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CyclePhase {
        /// World stopped: sweep finished, roots scanned.
        Start,
        /// Concurrent marking.
        Mark,
        /// World stopped: marking finished, sweep armed.
        Termination,
    }

    /// Identifier correlating the events of one cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Next cycle identifier.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole cycle.
    pub fn trace_gc_cycle(mode: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_cycle", mode = mode, gc_id = gc_id.0).entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: CyclePhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// End of a cycle.
    pub fn log_cycle_end(gc_id: GcId, heap_marked: u64, next_gc: u64) {
        tracing::debug!(gc_id = gc_id.0, heap_marked, next_gc, "cycle_end");
    }

    /// The page heap took more memory from the arena.
    pub fn log_heap_grow(pages: usize, committed: usize) {
        tracing::debug!(pages, committed, "heap_grow");
    }

    /// Idle pages went back to the OS.
    pub fn log_scavenge(released: usize) {
        tracing::debug!(released, "scavenge");
    }

    /// The sweeper ran out of spans.
    pub fn log_sweep_done(pages_swept: u64) {
        tracing::trace!(pages_swept, "sweep_done");
    }

    /// A mutator paid assist debt by scanning.
    pub fn log_assist(done: i64, owed: i64) {
        tracing::trace!(done, owed, "assist");
    }

    /// A sweep found objects with finalizers dead.
    pub fn log_finalizers_queued(count: usize) {
        tracing::debug!(count, "finalizers_queued");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
