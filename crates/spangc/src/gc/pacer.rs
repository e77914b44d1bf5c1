//! The GC pacer.
//!
//! Decides when the next cycle triggers and how much mark work each
//! allocated byte owes. The trigger ratio is tuned after every background
//! cycle from how far the heap actually grew and how much CPU marking took,
//! aiming for a quarter of the available parallelism spent on marking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::heap::Heap;

/// Fraction of CPU marking should use.
pub const GOAL_UTILIZATION: f64 = 0.25;

/// Trigger ratio before any feedback.
pub const INITIAL_TRIGGER_RATIO: f64 = 7.0 / 8.0;

const TRIGGER_GAIN: f64 = 0.5;

/// Smallest heap distance used for the assist ratio.
const MIN_HEAP_DISTANCE: u64 = 1 << 20;

/// An `f64` stored in an `AtomicU64`.
#[derive(Debug)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) const fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    #[inline]
    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Release);
    }
}

#[derive(Debug)]
pub(crate) struct Pacer {
    pub(crate) trigger_ratio: AtomicF64,
    /// Scan work owed per allocated byte.
    pub(crate) assist_ratio: AtomicF64,
    pub(crate) heap_goal: AtomicU64,
    pub(crate) initial_heap_live: AtomicU64,
    /// Nanoseconds spent in assists this cycle.
    pub(crate) assist_time: AtomicU64,
    /// Nanoseconds spent by the background drainer this cycle.
    pub(crate) mark_time: AtomicU64,
    cycle_start: Mutex<Option<Instant>>,
}

impl Pacer {
    pub(crate) const fn new() -> Self {
        Self {
            trigger_ratio: AtomicF64::new(INITIAL_TRIGGER_RATIO),
            assist_ratio: AtomicF64::new(0.0),
            heap_goal: AtomicU64::new(0),
            initial_heap_live: AtomicU64::new(0),
            assist_time: AtomicU64::new(0),
            mark_time: AtomicU64::new(0),
            cycle_start: Mutex::new(None),
        }
    }
}

impl Heap {
    /// Sets up pacing for a new cycle. The world is stopped.
    pub(crate) fn start_pacer_cycle(&self) {
        let pacer = &self.gc.pacer;
        let stats = &self.stats;
        let percent = u64::from(self.gc.pacing_percent());
        pacer.assist_time.store(0, Ordering::Relaxed);
        pacer.mark_time.store(0, Ordering::Relaxed);
        *pacer.cycle_start.lock() = Some(Instant::now());

        let heap_live = stats.heap_live.load(Ordering::Relaxed);
        pacer.initial_heap_live.store(heap_live, Ordering::Relaxed);

        // On the first cycle, or a heap below the minimum, pretend the last
        // cycle marked exactly enough for next_gc to be its trigger.
        let next_gc = stats.next_gc.load(Ordering::Relaxed);
        if next_gc <= self.config.scaled_heap_minimum(self.gc.pacing_percent()) {
            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            let marked = (next_gc as f64 / (1.0 + pacer.trigger_ratio.load())) as u64;
            stats.heap_marked.store(marked, Ordering::Relaxed);
            stats.heap_reachable.store(marked, Ordering::Relaxed);
        }

        let reachable = stats.heap_reachable.load(Ordering::Relaxed);
        let goal = (reachable + reachable.saturating_mul(percent) / 100).max(heap_live + (1 << 20));
        pacer.heap_goal.store(goal, Ordering::Relaxed);
        self.revise_pacer();
    }

    /// Recomputes the assist ratio from the current scannable heap.
    pub(crate) fn revise_pacer(&self) {
        let pacer = &self.gc.pacer;
        let expected = self.stats.heap_scan.load(Ordering::Relaxed);
        let distance = pacer
            .heap_goal
            .load(Ordering::Relaxed)
            .saturating_sub(pacer.initial_heap_live.load(Ordering::Relaxed))
            .max(MIN_HEAP_DISTANCE);
        #[allow(clippy::cast_precision_loss)]
        pacer.assist_ratio.store(expected as f64 / distance as f64);
    }

    /// Feeds the cycle's outcome back into the trigger ratio. `heap_marked`
    /// is the previous cycle's marked bytes.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn end_pacer_cycle(&self, heap_marked: u64) {
        let pacer = &self.gc.pacer;
        if heap_marked == 0 {
            return;
        }
        let Some(start) = pacer.cycle_start.lock().take() else {
            return;
        };
        let h_t = pacer.trigger_ratio.load();
        let h_a = self.stats.heap_live.load(Ordering::Relaxed) as f64 / heap_marked as f64 - 1.0;

        let procs = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        let elapsed = start.elapsed().as_nanos().max(1) as f64 * procs as f64;
        let busy = (pacer.assist_time.load(Ordering::Relaxed)
            + pacer.mark_time.load(Ordering::Relaxed)) as f64;
        let u_a = busy / elapsed;

        let goal_growth = f64::from(self.gc.pacing_percent()) / 100.0;
        let error = goal_growth - h_t - u_a / GOAL_UTILIZATION * (h_a - h_t);
        let ratio = (h_t + TRIGGER_GAIN * error).clamp(0.0, goal_growth * 0.95);
        pacer.trigger_ratio.store(ratio);
    }

    /// `next_gc` for a cycle that marked `heap_marked` bytes.
    pub(crate) fn compute_next_gc(&self, heap_marked: u64) -> u64 {
        let Some(percent) = self.gc.gc_percent() else {
            return u64::MAX;
        };
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let trigger = (heap_marked as f64 * (1.0 + self.gc.pacer.trigger_ratio.load())) as u64;
        trigger.max(self.config.scaled_heap_minimum(percent))
    }

    /// Current trigger ratio.
    pub fn trigger_ratio(&self) -> f64 {
        self.gc.pacer.trigger_ratio.load()
    }

    /// Current assist ratio: scan work owed per allocated byte.
    pub fn assist_ratio(&self) -> f64 {
        self.gc.pacer.assist_ratio.load()
    }
}
