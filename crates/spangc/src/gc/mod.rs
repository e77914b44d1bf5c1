//! Concurrent mark-sweep collection.
//!
//! This module provides:
//! - the cycle driver and background collector thread ([`collector`])
//! - gray-object work buffers and the global work queue ([`work`])
//! - object marking, scanning, root scanning and mark assists ([`mark`])
//! - lazy, proportional and background sweeping ([`sweep`])
//! - finalizer registration and the finalizer queue ([`finalizer`])
//! - the pacer that sizes the heap goal and assist ratio ([`pacer`])
//! - lock ordering discipline for deadlock prevention ([`sync`])

pub mod collector;
pub mod finalizer;
pub mod mark;
pub mod pacer;
pub mod sweep;
pub mod sync;
pub mod work;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

pub use collector::CollectMode;

use self::collector::CollectorSignal;
use self::pacer::Pacer;
use self::sync::{LockOrder, OrderedMutex};
use self::work::WorkState;

/// Collector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcPhase {
    /// No cycle is running; sweeping may be in progress.
    Off = 0,
    /// Concurrent marking with the write barrier on.
    Mark = 1,
    /// The world is stopped to finish marking. Allocation is forbidden.
    MarkTermination = 2,
}

impl GcPhase {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Mark,
            2 => Self::MarkTermination,
            _ => Self::Off,
        }
    }
}

/// Stored growth percent meaning "collection off".
const GC_PERCENT_OFF: u32 = u32::MAX;

/// Wakes the background drainer once every marking participant is idle.
#[derive(Debug, Default)]
pub(crate) struct MarkSignal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl MarkSignal {
    pub(crate) fn complete(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }

    /// Waits up to `timeout` for a completion signal and consumes it.
    pub(crate) fn wait(&self, timeout: std::time::Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.cv.wait_for(&mut done, timeout);
        }
        std::mem::take(&mut *done)
    }

    pub(crate) fn reset(&self) {
        *self.done.lock() = false;
    }
}

/// Collector state shared by the heap.
#[derive(Debug)]
pub(crate) struct GcState {
    phase: AtomicU8,
    write_barrier: AtomicBool,
    blacken: AtomicBool,
    /// Set from the moment a cycle is requested until it has finished.
    pub(crate) running: AtomicBool,
    /// Serialises cycles.
    pub(crate) cycle: OrderedMutex<()>,
    pub(crate) work: WorkState,
    pub(crate) pacer: Pacer,
    pub(crate) mark_done: MarkSignal,
    /// Shared with the background collector thread, which must not keep
    /// the heap alive while it waits.
    pub(crate) collector: Arc<CollectorSignal>,
    cycles: AtomicU32,
    gc_percent: AtomicU32,
}

impl GcState {
    pub(crate) fn new(gc_percent: Option<u32>) -> Self {
        Self {
            phase: AtomicU8::new(GcPhase::Off as u8),
            write_barrier: AtomicBool::new(false),
            blacken: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cycle: OrderedMutex::new(LockOrder::Cycle, ()),
            work: WorkState::new(),
            pacer: Pacer::new(),
            mark_done: MarkSignal::default(),
            collector: Arc::default(),
            cycles: AtomicU32::new(0),
            gc_percent: AtomicU32::new(gc_percent.unwrap_or(GC_PERCENT_OFF)),
        }
    }

    #[inline]
    pub(crate) fn phase(&self) -> GcPhase {
        GcPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: GcPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn write_barrier_enabled(&self) -> bool {
        self.write_barrier.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_barrier(&self, on: bool) {
        self.write_barrier.store(on, Ordering::Release);
    }

    /// Mutators may be asked to assist.
    #[inline]
    pub(crate) fn blacken_enabled(&self) -> bool {
        self.blacken.load(Ordering::Acquire)
    }

    pub(crate) fn set_blacken(&self, on: bool) {
        self.blacken.store(on, Ordering::Release);
    }

    /// Completed cycles.
    pub(crate) fn cycles(&self) -> u32 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub(crate) fn finish_cycle(&self) -> u32 {
        self.cycles.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn gc_percent(&self) -> Option<u32> {
        match self.gc_percent.load(Ordering::Relaxed) {
            GC_PERCENT_OFF => None,
            pct => Some(pct),
        }
    }

    pub(crate) fn swap_gc_percent(&self, percent: Option<u32>) -> Option<u32> {
        match self
            .gc_percent
            .swap(percent.unwrap_or(GC_PERCENT_OFF), Ordering::AcqRel)
        {
            GC_PERCENT_OFF => None,
            pct => Some(pct),
        }
    }

    /// Growth percent to use in pacing arithmetic; 100 when collection is
    /// off.
    pub(crate) fn pacing_percent(&self) -> u32 {
        self.gc_percent().unwrap_or(100)
    }
}
