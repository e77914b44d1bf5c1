//! The collection cycle and the background collector thread.
//!
//! A cycle runs in three steps:
//!
//! 1. Stop the world, finish the previous sweep, reset mark state, turn on
//!    the write barrier and scan every root.
//! 2. Mark concurrently: the collector drains gray objects while mutators
//!    run, shade through the write barrier and pay assist debt. A blocking
//!    cycle keeps the world stopped and drains in place.
//! 3. Stop the world again, flush every worker, rescan the roots written
//!    since the first scan, drain what is left, publish the new heap goal
//!    and arm the sweeper.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use super::sync::OrderedGuard;
use super::work::GcWork;
use super::GcPhase;
use crate::fatal::{throw, FatalKind};
use crate::heap::Heap;
use crate::metrics::{CycleMetrics, PhaseTimer};
use crate::worker::{WorkerLocal, WorkerShared};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_cycle_end, next_gc_id, trace_gc_cycle, trace_phase, CyclePhase};

/// How the collector waits between requests.
const BACKGROUND_TICK: Duration = Duration::from_millis(10);

/// How long the concurrent drainer sleeps when assists still hold work.
const MARK_POLL: Duration = Duration::from_micros(100);

/// How a cycle marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    /// Mark concurrently with the mutators.
    Background,
    /// Keep the world stopped for the whole cycle and finish sweeping
    /// before returning.
    Blocking,
}

impl CollectMode {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Blocking => "blocking",
        }
    }
}

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    shutdown: bool,
    alive: bool,
}

/// Why the collector thread woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Collect,
    Idle,
    Shutdown,
}

/// Requests from mutators to the background collector thread.
#[derive(Debug, Default)]
pub(crate) struct CollectorSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl CollectorSignal {
    /// Asks the collector thread for a cycle.
    pub(crate) fn request(&self) {
        self.state.lock().pending = true;
        self.cv.notify_one();
    }

    /// Waits up to `timeout` for a request.
    pub(crate) fn wait(&self, timeout: Duration) -> Wake {
        let mut state = self.state.lock();
        if !state.pending && !state.shutdown {
            self.cv.wait_for(&mut state, timeout);
        }
        if state.shutdown {
            state.alive = false;
            return Wake::Shutdown;
        }
        if std::mem::take(&mut state.pending) {
            Wake::Collect
        } else {
            Wake::Idle
        }
    }

    /// Tells the collector thread to exit. Does not wait for it.
    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cv.notify_all();
    }

    /// A collector thread is serving requests.
    pub(crate) fn is_alive(&self) -> bool {
        let state = self.state.lock();
        state.alive && !state.shutdown
    }

    fn set_alive(&self, alive: bool) {
        self.state.lock().alive = alive;
    }
}

/// Starts the background collector thread of `heap`.
///
/// The thread holds the heap weakly and exits once the heap is dropped.
pub(crate) fn spawn_background(heap: &Arc<Heap>) -> io::Result<()> {
    let weak = Arc::downgrade(heap);
    let signal = Arc::clone(&heap.gc.collector);
    signal.set_alive(true);
    let spawned = std::thread::Builder::new()
        .name("spangc-collector".into())
        .spawn(move || background_loop(&weak, &signal));
    if let Err(e) = spawned {
        heap.gc.collector.set_alive(false);
        return Err(e);
    }
    Ok(())
}

fn background_loop(weak: &Weak<Heap>, signal: &CollectorSignal) {
    let mut last_scavenge = Instant::now();
    loop {
        let wake = signal.wait(BACKGROUND_TICK);
        if wake == Wake::Shutdown {
            return;
        }
        let Some(heap) = weak.upgrade() else {
            signal.set_alive(false);
            return;
        };
        if wake == Wake::Collect {
            heap.collect_with(CollectMode::Background);
        }

        while heap.sweep_one().is_some() {
            heap.sweep.background_swept.fetch_add(1, Ordering::Relaxed);
            if signal.state.lock().pending {
                break;
            }
            std::thread::yield_now();
        }

        if heap.pending_finalizers() > 0 {
            heap.register_worker().run_finalizers();
        }

        let delay = heap.config.scavenge_delay;
        if last_scavenge.elapsed() >= delay / 2 {
            heap.scavenge(delay);
            last_scavenge = Instant::now();
        }
    }
}

/// Every worker's local lock, held while the world is stopped.
type StoppedWorld<'a> = Vec<OrderedGuard<'a, WorkerLocal>>;

impl Heap {
    /// Runs a full blocking collection and finishes sweeping.
    pub fn collect(&self) {
        self.collect_with(CollectMode::Blocking);
    }

    /// Runs one collection cycle.
    ///
    /// Must not be called by a thread that holds a [`Worker`](crate::Worker)
    /// lock, which only happens inside the crate.
    pub fn collect_with(&self, mode: CollectMode) {
        let _cycle = self.gc.cycle.lock();
        self.gc.running.store(true, Ordering::Release);

        #[cfg(feature = "tracing")]
        let gc_id = next_gc_id();
        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_cycle(mode.as_str(), gc_id);

        // Sweep the previous cycle's spans concurrently before stopping
        // anybody.
        self.finish_sweep();

        let started = Instant::now();
        let mut timer = PhaseTimer::new();
        let mut gcw = GcWork::new();
        let heap_live_before = self.stats.heap_live.load(Ordering::Relaxed);

        timer.start();
        let marking = self.with_world_stopped(|locals, workers| {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(CyclePhase::Start);

            self.finish_sweep_stopped();
            self.gc.work.reset();
            for local in locals.iter_mut() {
                local.gcw.reset();
                local.assist_alloc = 0;
                local.assist_scan_work = 0;
            }
            self.start_pacer_cycle();
            self.gc.set_phase(GcPhase::Mark);
            self.gc.set_write_barrier(true);
            self.scan_roots(&mut gcw, workers, false);
            self.gc.mark_done.reset();

            if mode == CollectMode::Background {
                self.gc.set_blacken(true);
                timer.end_start_pause();
                return None;
            }
            self.drain(&mut gcw, false);
            timer.end_start_pause();
            Some(self.mark_termination(&mut gcw, locals, workers, mode, &mut timer))
        });

        let result = match marking {
            Some(result) => result,
            None => {
                #[cfg(feature = "tracing")]
                let _phase = trace_phase(CyclePhase::Mark);

                timer.start();
                self.concurrent_mark(&mut gcw);
                timer.end_mark();
                let nanos = u64::try_from(timer.mark.as_nanos()).unwrap_or(u64::MAX);
                self.gc.pacer.mark_time.fetch_add(nanos, Ordering::Relaxed);

                self.with_world_stopped(|locals, workers| {
                    self.mark_termination(&mut gcw, locals, workers, mode, &mut timer)
                })
            }
        };

        if mode == CollectMode::Blocking {
            self.finish_sweep();
        }
        self.gc.running.store(false, Ordering::Release);

        let assist_ns = self.gc.pacer.assist_time.load(Ordering::Relaxed);
        let metrics = CycleMetrics {
            cycle: result.cycle,
            mode,
            duration: started.elapsed(),
            start_pause: timer.start_pause,
            mark_duration: timer.mark,
            termination_pause: timer.termination,
            heap_live_before,
            heap_marked: result.heap_marked,
            heap_scan: result.heap_scan,
            next_gc: result.next_gc,
            assist_time: Duration::from_nanos(assist_ns),
            trigger_ratio: self.trigger_ratio(),
        };
        self.metrics.record(metrics);

        #[cfg(feature = "tracing")]
        log_cycle_end(gc_id, result.heap_marked, result.next_gc);
    }

    /// Stops every registered worker at an allocation boundary, runs `f`,
    /// and restarts them.
    fn with_world_stopped<R>(
        &self,
        f: impl FnOnce(&mut StoppedWorld<'_>, &[Arc<WorkerShared>]) -> R,
    ) -> R {
        let registry = self.registry.lock();
        let workers: Vec<Arc<WorkerShared>> = registry.to_vec();
        let mut locals: StoppedWorld<'_> = workers.iter().map(|w| w.local.lock()).collect();
        let out = f(&mut locals, &workers);
        drop(locals);
        drop(registry);
        out
    }

    /// Sweeps what is left and waits for sweepers still in flight. The
    /// world is stopped.
    fn finish_sweep_stopped(&self) {
        while self.sweep_one().is_some() {}
        let backoff = Backoff::new();
        while self.sweep.active() != 0 {
            backoff.snooze();
        }
    }

    /// Shades the globals, the finalizer roots, every worker's shadow stack
    /// and fresh object. With `rescan`, only stack slots written since the
    /// last scan are visited.
    fn scan_roots(&self, gcw: &mut GcWork, workers: &[Arc<WorkerShared>], rescan: bool) {
        self.scan_globals(gcw);
        if !rescan {
            self.scan_finalizers(gcw);
        }
        for w in workers {
            let stack = &w.stack;
            let from = if rescan { stack.rescan_from() } else { 0 };
            self.scan_stack(stack, from, gcw);
            stack.set_rescan_from(stack.len());
            let fresh = stack.fresh();
            if fresh != 0 {
                self.shade(fresh, gcw);
            }
        }
    }

    /// Drains alongside the mutators until every participant is idle and
    /// no gray object is queued.
    fn concurrent_mark(&self, gcw: &mut GcWork) {
        let work = &self.gc.work;
        loop {
            work.begin_work();
            self.drain(gcw, true);
            gcw.dispose(work);
            if work.end_work() {
                break;
            }
            self.gc.mark_done.wait(MARK_POLL);
        }
    }

    /// Finishes marking with the world stopped and arms the sweeper.
    fn mark_termination(
        &self,
        gcw: &mut GcWork,
        locals: &mut StoppedWorld<'_>,
        workers: &[Arc<WorkerShared>],
        mode: CollectMode,
        timer: &mut PhaseTimer,
    ) -> CycleResult {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(CyclePhase::Termination);

        timer.start();
        let work = &self.gc.work;
        self.gc.set_phase(GcPhase::MarkTermination);
        self.gc.set_blacken(false);

        for local in locals.iter_mut() {
            let local = &mut **local;
            local.cache.release_all(self);
            local.gcw.dispose(work);
        }
        self.scan_roots(gcw, workers, true);
        self.drain(gcw, false);
        gcw.dispose(work);
        if !work.is_empty() || !gcw.is_empty() {
            throw(FatalKind::InvariantViolation, "mark termination left gray objects");
        }

        let stats = &self.stats;
        if mode == CollectMode::Background {
            self.end_pacer_cycle(stats.heap_marked.load(Ordering::Relaxed));
        }
        let heap_marked = work.bytes_marked.load(Ordering::Acquire);
        let heap_scan = u64::try_from(work.scan_work.load(Ordering::Acquire)).unwrap_or(0);
        let next_gc = self.compute_next_gc(heap_marked);
        stats.heap_live.store(heap_marked, Ordering::Relaxed);
        stats.heap_marked.store(heap_marked, Ordering::Relaxed);
        stats.heap_reachable.store(heap_marked, Ordering::Relaxed);
        stats.heap_scan.store(heap_scan, Ordering::Relaxed);
        stats.next_gc.store(next_gc, Ordering::Relaxed);

        self.gc.set_write_barrier(false);
        self.gc.set_phase(GcPhase::Off);
        self.profile.rotate();
        self.start_sweep();
        let cycle = self.gc.finish_cycle();
        timer.end_termination();

        CycleResult {
            cycle,
            heap_marked,
            heap_scan,
            next_gc,
        }
    }

    /// Starts a cycle on behalf of an allocating worker, unless one is
    /// already underway.
    pub(crate) fn trigger_cycle(&self) {
        if self
            .gc
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if self.gc.collector.is_alive() {
            self.gc.collector.request();
        } else {
            self.collect_with(CollectMode::Background);
        }
    }

    /// Sets the heap growth percent that triggers collection, `None` to turn
    /// automatic collection off. Waits for a running cycle to finish and
    /// returns the previous setting.
    pub fn set_gc_percent(&self, percent: Option<u32>) -> Option<u32> {
        let _cycle = self.gc.cycle.lock();
        let old = self.gc.swap_gc_percent(percent);
        let next_gc = self.compute_next_gc(self.stats.heap_marked.load(Ordering::Relaxed));
        self.stats.next_gc.store(next_gc, Ordering::Relaxed);
        old
    }

    /// Current heap growth percent, `None` when collection is off.
    pub fn gc_percent(&self) -> Option<u32> {
        self.gc.gc_percent()
    }

    /// Current collector phase.
    pub fn gc_phase(&self) -> GcPhase {
        self.gc.phase()
    }

    /// A cycle has been requested or is running.
    pub fn is_collecting(&self) -> bool {
        self.gc.running.load(Ordering::Acquire)
    }

    /// Collects, then returns every idle page to the OS. Returns the bytes
    /// released.
    pub fn free_os_memory(&self) -> usize {
        self.collect();
        self.release_unused()
    }
}

struct CycleResult {
    cycle: u32,
    heap_marked: u64,
    heap_scan: u64,
    next_gc: u64,
}
