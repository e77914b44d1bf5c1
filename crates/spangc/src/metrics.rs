//! Collector metrics and memory statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::gc::CollectMode;

/// Cycles kept in a heap's history.
pub const HISTORY_SIZE: usize = 64;

/// Statistics of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleMetrics {
    /// Cycle number, starting at 1.
    pub cycle: u32,
    /// How the cycle was run.
    pub mode: CollectMode,
    /// Wall time from start to the end of mark termination.
    pub duration: Duration,
    /// Time the world was stopped to start the cycle.
    pub start_pause: Duration,
    /// Concurrent mark time. Zero for a blocking cycle.
    pub mark_duration: Duration,
    /// Time the world was stopped for mark termination.
    pub termination_pause: Duration,
    /// `heap_live` when the cycle started.
    pub heap_live_before: u64,
    /// Bytes marked live.
    pub heap_marked: u64,
    /// Scannable bytes found live.
    pub heap_scan: u64,
    /// Trigger for the next cycle.
    pub next_gc: u64,
    /// Time mutators spent in assists.
    pub assist_time: Duration,
    /// Trigger ratio after feedback.
    pub trigger_ratio: f64,
}

impl CycleMetrics {
    /// Total stop-the-world time of the cycle.
    #[must_use]
    pub fn pause(&self) -> Duration {
        self.start_pause + self.termination_pause
    }
}

/// Times the phases of one cycle.
///
/// # Example
///
/// ```
/// use spangc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... stop the world, scan roots ...
/// timer.end_start_pause();
/// timer.start();
/// // ... concurrent mark ...
/// timer.end_mark();
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Cycle start pause.
    pub start_pause: Duration,
    /// Concurrent mark.
    pub mark: Duration,
    /// Mark termination pause.
    pub termination: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// A timer with every duration zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            start_pause: Duration::ZERO,
            mark: Duration::ZERO,
            termination: Duration::ZERO,
            current_start: None,
        }
    }

    /// Starts timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Ends the cycle start pause.
    pub fn end_start_pause(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.start_pause = start.elapsed();
        }
    }

    /// Ends the concurrent mark phase.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark = start.elapsed();
        }
    }

    /// Ends the mark termination pause.
    pub fn end_termination(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.termination = start.elapsed();
        }
    }
}

/// Cumulative collector statistics of one heap.
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    background_collections: AtomicUsize,
    blocking_collections: AtomicUsize,
    pause_ns: AtomicU64,
    bytes_marked: AtomicU64,
    history: Mutex<VecDeque<CycleMetrics>>,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// All counters zero, empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            background_collections: AtomicUsize::new(0),
            blocking_collections: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            bytes_marked: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Completed cycles.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Cycles run with concurrent marking.
    #[inline]
    #[must_use]
    pub fn total_background_collections(&self) -> usize {
        self.background_collections.load(Ordering::Relaxed)
    }

    /// Cycles run entirely stop-the-world.
    #[inline]
    #[must_use]
    pub fn total_blocking_collections(&self) -> usize {
        self.blocking_collections.load(Ordering::Relaxed)
    }

    /// Total stop-the-world time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Bytes marked over all cycles.
    #[inline]
    #[must_use]
    pub fn total_bytes_marked(&self) -> u64 {
        self.bytes_marked.load(Ordering::Relaxed)
    }

    /// The most recent cycle, if any ran.
    #[must_use]
    pub fn last_cycle(&self) -> Option<CycleMetrics> {
        self.history.lock().back().copied()
    }

    /// Up to `n` most recent cycles, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<CycleMetrics> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).copied().collect()
    }

    /// Average pause of the last `n` cycles.
    #[must_use]
    pub fn average_pause(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = recent.iter().map(CycleMetrics::pause).sum();
        total / u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    /// Longest pause of the last `n` cycles.
    #[must_use]
    pub fn max_pause(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(CycleMetrics::pause)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn record(&self, metrics: CycleMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        match metrics.mode {
            CollectMode::Background => self.background_collections.fetch_add(1, Ordering::Relaxed),
            CollectMode::Blocking => self.blocking_collections.fetch_add(1, Ordering::Relaxed),
        };
        self.pause_ns.fetch_add(
            metrics.pause().as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.bytes_marked.fetch_add(metrics.heap_marked, Ordering::Relaxed);

        let mut history = self.history.lock();
        if history.len() == HISTORY_SIZE {
            history.pop_front();
        }
        history.push_back(metrics);
    }
}

/// Snapshot of a heap's memory statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemStats {
    /// Bytes obtained from the arena for spans.
    pub heap_sys: usize,
    /// Bytes in in-use spans.
    pub heap_inuse: usize,
    /// Bytes in free spans.
    pub heap_idle: usize,
    /// Bytes of free spans returned to the OS.
    pub heap_released: usize,
    /// Bytes believed live.
    pub heap_live: u64,
    /// Bytes marked by the last cycle.
    pub heap_marked: u64,
    /// Scannable bytes of the live heap.
    pub heap_scan: u64,
    /// `heap_live` that triggers the next cycle.
    pub next_gc: u64,
    /// Pages held by in-use spans.
    pub pages_in_use: usize,
    /// Objects allocated, counting flushed caches only.
    pub mallocs: u64,
    /// Objects freed by sweeping.
    pub frees: u64,
    /// Large objects allocated.
    pub large_allocs: u64,
    /// Bytes of large objects allocated.
    pub large_alloc_bytes: u64,
    /// Large objects freed.
    pub large_frees: u64,
    /// Bytes of large objects freed.
    pub large_free_bytes: u64,
    /// Completed cycles.
    pub num_gc: u32,
    /// Pages swept since the last cycle armed the sweeper.
    pub pages_swept: u64,
    /// Arena bytes committed.
    pub arena_committed: usize,
    /// Arena capacity in pages.
    pub arena_pages: usize,
    /// Objects carrying a finalizer that has not been queued.
    pub finalizers: usize,
    /// Finalizers waiting to run.
    pub finalizers_queued: usize,
    /// Finalizers run so far.
    pub finalizers_run: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(n: u32, pause_ms: u64) -> CycleMetrics {
        CycleMetrics {
            cycle: n,
            mode: CollectMode::Blocking,
            duration: Duration::from_millis(pause_ms),
            start_pause: Duration::from_millis(pause_ms),
            mark_duration: Duration::ZERO,
            termination_pause: Duration::ZERO,
            heap_live_before: 0,
            heap_marked: 100,
            heap_scan: 0,
            next_gc: 0,
            assist_time: Duration::ZERO,
            trigger_ratio: 0.5,
        }
    }

    #[test]
    fn test_global_metrics_new() {
        let metrics = GlobalMetrics::new();
        assert_eq!(metrics.total_collections(), 0);
        assert_eq!(metrics.total_pause_ns(), 0);
        assert!(metrics.last_cycle().is_none());
        assert_eq!(metrics.average_pause(10), Duration::ZERO);
    }

    #[test]
    fn test_record_accumulates() {
        let metrics = GlobalMetrics::new();
        metrics.record(cycle(1, 2));
        metrics.record(cycle(2, 4));
        assert_eq!(metrics.total_collections(), 2);
        assert_eq!(metrics.total_blocking_collections(), 2);
        assert_eq!(metrics.total_bytes_marked(), 200);
        assert_eq!(metrics.last_cycle().map(|m| m.cycle), Some(2));
        assert_eq!(metrics.average_pause(10), Duration::from_millis(3));
        assert_eq!(metrics.max_pause(1), Duration::from_millis(4));
    }

    #[test]
    fn test_history_is_bounded() {
        let metrics = GlobalMetrics::new();
        for n in 0..(HISTORY_SIZE as u32 + 5) {
            metrics.record(cycle(n, 1));
        }
        let recent = metrics.recent(usize::MAX);
        assert_eq!(recent.len(), HISTORY_SIZE);
        assert_eq!(recent[0].cycle, 5);
    }

    #[test]
    fn test_phase_timer_captures_durations() {
        let mut timer = PhaseTimer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_start_pause();
        assert!(timer.start_pause > Duration::ZERO);
        assert!(timer.current_start.is_none());

        timer.start();
        timer.end_termination();
        assert_eq!(timer.mark, Duration::ZERO);
    }
}
