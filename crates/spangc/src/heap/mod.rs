//! The heap: arena, span pool, page heap, central lists and statistics.
//!
//! A [`Heap`] is an ordinary value. Nothing here is global, so tests create
//! as many independent heaps as they like. Worker threads allocate through
//! [`Worker`](crate::Worker) handles registered on a heap.

pub(crate) mod arena;
pub(crate) mod bitmap;
pub(crate) mod cache;
pub(crate) mod central;
pub(crate) mod pageheap;
pub(crate) mod span;
pub(crate) mod special;

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::CachePadded;

pub use bitmap::HeapBits;
pub use central::CentralFreeList;
pub use pageheap::{HEAP_ALLOC_CHUNK, MAX_HEAP_LIST};
pub use span::{SpanId, SpanState};
pub use special::Finalizer;

use self::arena::Arena;
use self::pageheap::PageHeap;
use self::span::SpanPool;
use crate::config::HeapConfig;
use crate::fatal::{throw, FatalKind};
use crate::gc::finalizer::FinalizerQueue;
use crate::gc::sweep::SweepState;
use crate::gc::sync::{LockOrder, OrderedMutex};
use crate::gc::GcState;
use crate::metrics::{GlobalMetrics, MemStats};
use crate::profile::Profiler;
use crate::sizeclass::{NUM_SIZE_CLASSES, PAGE_SHIFT};
use crate::worker::WorkerShared;

/// Heap-wide allocation statistics.
#[derive(Debug)]
pub(crate) struct HeapStats {
    /// Bytes in objects believed live: marked at the last cycle plus
    /// allocated since.
    pub(crate) heap_live: CachePadded<AtomicU64>,
    /// Bytes marked by the last cycle.
    pub(crate) heap_marked: AtomicU64,
    pub(crate) heap_reachable: AtomicU64,
    /// Scannable bytes of the live heap.
    pub(crate) heap_scan: AtomicU64,
    /// `heap_live` value that triggers the next cycle.
    pub(crate) next_gc: AtomicU64,
    pub(crate) pages_in_use: AtomicUsize,
    pub(crate) tiny_allocs: AtomicU64,
    pub(crate) nsmallalloc: [AtomicU64; NUM_SIZE_CLASSES],
    pub(crate) nsmallfree: [AtomicU64; NUM_SIZE_CLASSES],
    pub(crate) nlargealloc: AtomicU64,
    pub(crate) largealloc: AtomicU64,
    pub(crate) nlargefree: AtomicU64,
    pub(crate) largefree: AtomicU64,
}

impl HeapStats {
    fn new(next_gc: u64) -> Self {
        Self {
            heap_live: CachePadded::new(AtomicU64::new(0)),
            heap_marked: AtomicU64::new(0),
            heap_reachable: AtomicU64::new(0),
            heap_scan: AtomicU64::new(0),
            next_gc: AtomicU64::new(next_gc),
            pages_in_use: AtomicUsize::new(0),
            tiny_allocs: AtomicU64::new(0),
            nsmallalloc: std::array::from_fn(|_| AtomicU64::new(0)),
            nsmallfree: std::array::from_fn(|_| AtomicU64::new(0)),
            nlargealloc: AtomicU64::new(0),
            largealloc: AtomicU64::new(0),
            nlargefree: AtomicU64::new(0),
            largefree: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_heap_live(&self, bytes: usize) {
        self.heap_live.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_pages_in_use(&self, n: usize) {
        self.pages_in_use.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn sub_pages_in_use(&self, n: usize) {
        self.pages_in_use.fetch_sub(n, Ordering::Relaxed);
    }
}

/// A garbage-collected heap.
///
/// # Examples
///
/// ```
/// use spangc::{AllocFlags, Heap, HeapConfig};
///
/// let heap = Heap::new(HeapConfig::default().arena_size(16 << 20));
/// let worker = heap.register_worker();
/// let p = worker.allocate(64, None, AllocFlags::NO_SCAN);
/// assert!(heap.contains(p.as_ptr() as usize));
/// ```
#[derive(Debug)]
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) arena: Arena,
    pub(crate) spans: SpanPool,
    pub(crate) pages: OrderedMutex<PageHeap>,
    pub(crate) central: Box<[CentralFreeList]>,
    sweepgen: AtomicU32,
    pub(crate) sweep: SweepState,
    pub(crate) stats: HeapStats,
    pub(crate) gc: GcState,
    pub(crate) registry: OrderedMutex<Vec<Arc<WorkerShared>>>,
    pub(crate) globals: Box<[AtomicUsize]>,
    pub(crate) finq: FinalizerQueue,
    pub(crate) profile: Profiler,
    pub(crate) metrics: GlobalMetrics,
    epoch: Instant,
}

impl Heap {
    /// Creates a heap.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses the arena reservation.
    #[must_use]
    pub fn new(config: HeapConfig) -> Arc<Self> {
        match Self::try_new(config) {
            Ok(heap) => heap,
            Err(e) => throw(FatalKind::OutOfMemory, &format!("cannot reserve heap: {e}")),
        }
    }

    /// Creates a heap, reporting a failed arena reservation.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the arena or its bitmap cannot be reserved.
    pub fn try_new(config: HeapConfig) -> io::Result<Arc<Self>> {
        let arena = Arena::reserve(config.arena_size)?;
        let pages = arena.total_pages();
        let next_gc = config
            .gc_percent
            .map_or(u64::MAX, |pct| config.scaled_heap_minimum(pct));
        let heap = Arc::new(Self {
            spans: SpanPool::new(pages),
            arena,
            pages: OrderedMutex::new(LockOrder::PageHeap, PageHeap::new()),
            central: (0..NUM_SIZE_CLASSES).map(CentralFreeList::new).collect(),
            sweepgen: AtomicU32::new(0),
            sweep: SweepState::new(),
            stats: HeapStats::new(next_gc),
            gc: GcState::new(config.gc_percent),
            registry: OrderedMutex::new(LockOrder::Registry, Vec::new()),
            globals: (0..config.global_slots).map(|_| AtomicUsize::new(0)).collect(),
            finq: FinalizerQueue::new(),
            profile: Profiler::new(config.mem_profile_rate),
            metrics: GlobalMetrics::new(),
            epoch: Instant::now(),
            config,
        });
        if heap.config.background_collector {
            crate::gc::collector::spawn_background(&heap)?;
        }
        Ok(heap)
    }

    /// Configuration the heap was built with.
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Current sweep generation. Advances by 2 per cycle.
    #[inline]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    pub(crate) fn advance_sweepgen(&self) {
        self.sweepgen.fetch_add(2, Ordering::AcqRel);
    }

    /// Nanoseconds since the heap was created.
    pub(crate) fn nanotime(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// `true` if `addr` lies in committed heap memory.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.arena.contains(addr)
    }

    /// Bitmap cursor for the heap word at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the committed heap.
    pub fn heap_bits(&self, addr: usize) -> HeapBits<'_> {
        if !self.contains(addr) {
            throw(FatalKind::Misuse, "heap bits of an address outside the heap");
        }
        HeapBits::new(&self.arena, addr & !(crate::sizeclass::PTR_SIZE - 1))
    }

    /// Span holding `addr`, if `addr` is in the heap and mapped.
    pub fn span_of(&self, addr: usize) -> Option<SpanId> {
        if !self.contains(addr) {
            return None;
        }
        self.spans.span_at_page(self.arena.page_index(addr))
    }

    /// Snapshot of span `id`.
    pub fn span_info(&self, id: SpanId) -> SpanInfo {
        let s = self.spans.get(id);
        SpanInfo {
            start: s.start(),
            npages: s.npages(),
            state: s.state(),
            size_class: s.size_class(),
            elem_size: s.elem_size(),
            allocated: s.ref_count.load(Ordering::Relaxed),
            sweepgen: s.sweepgen.load(Ordering::Acquire),
            cached: s.in_cache.load(Ordering::Relaxed),
        }
    }

    /// Central free list of size class `class`.
    pub fn central(&self, class: usize) -> &CentralFreeList {
        &self.central[class]
    }

    /// Cumulative collector counters.
    pub const fn metrics(&self) -> &GlobalMetrics {
        &self.metrics
    }

    /// Current memory statistics.
    pub fn mem_stats(&self) -> MemStats {
        let (heap_sys, heap_inuse, heap_idle, heap_released) = {
            let h = self.pages.lock();
            (h.heap_sys, h.heap_inuse, h.heap_idle, h.heap_released)
        };
        let stats = &self.stats;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let nsmallalloc: u64 = stats.nsmallalloc.iter().map(load).sum();
        let nsmallfree: u64 = stats.nsmallfree.iter().map(load).sum();
        let mallocs = nsmallalloc + load(&stats.nlargealloc) + load(&stats.tiny_allocs);
        let frees = nsmallfree + load(&stats.nlargefree) + load(&stats.tiny_allocs);
        MemStats {
            heap_sys,
            heap_inuse,
            heap_idle,
            heap_released,
            heap_live: load(&stats.heap_live),
            heap_marked: load(&stats.heap_marked),
            heap_scan: load(&stats.heap_scan),
            next_gc: load(&stats.next_gc),
            pages_in_use: stats.pages_in_use.load(Ordering::Relaxed),
            mallocs,
            frees: frees.min(mallocs),
            large_allocs: load(&stats.nlargealloc),
            large_alloc_bytes: load(&stats.largealloc),
            large_frees: load(&stats.nlargefree),
            large_free_bytes: load(&stats.largefree),
            num_gc: self.gc.cycles(),
            pages_swept: self.sweep.pages_swept.load(Ordering::Relaxed),
            arena_committed: self.arena.committed(),
            arena_pages: self.arena.total_pages(),
            finalizers: self.finq.registered.load(Ordering::Relaxed),
            finalizers_queued: self.finq.len(),
            finalizers_run: self.finq.ran.load(Ordering::Relaxed),
        }
    }

    /// Bytes a span of `npages` pages covers.
    pub const fn pages_to_bytes(npages: usize) -> usize {
        npages << PAGE_SHIFT
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.gc.collector.shutdown();
    }
}

/// Point-in-time view of one span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanInfo {
    /// First byte.
    pub start: usize,
    /// Length in pages.
    pub npages: usize,
    /// Lifecycle state.
    pub state: SpanState,
    /// Size class, 0 for a large object or a free span.
    pub size_class: usize,
    /// Object size.
    pub elem_size: usize,
    /// Objects currently allocated.
    pub allocated: usize,
    /// Sweep generation stamp.
    pub sweepgen: u32,
    /// Owned by a thread cache.
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_heap_stats() {
        let heap = Heap::new(HeapConfig::default().arena_size(8 << 20));
        let stats = heap.mem_stats();
        assert_eq!(stats.heap_sys, 0);
        assert_eq!(stats.heap_live, 0);
        assert_eq!(stats.num_gc, 0);
        assert_eq!(stats.next_gc, crate::config::DEFAULT_HEAP_MINIMUM as u64);
        assert_eq!(heap.sweepgen(), 0);
    }

    #[test]
    fn test_gc_off_never_triggers() {
        let heap = Heap::new(HeapConfig::default().arena_size(8 << 20).gc_percent(None));
        assert_eq!(heap.mem_stats().next_gc, u64::MAX);
    }

    #[test]
    fn test_span_of_and_info() {
        let heap = Heap::new(HeapConfig::default().arena_size(8 << 20).gc_percent(None));
        let id = heap.alloc_span(3, 0, true, true).expect("span");
        let info = heap.span_info(id);
        assert_eq!(info.npages, 3);
        assert_eq!(info.state, SpanState::InUse);
        assert_eq!(heap.span_of(info.start + 2 * crate::sizeclass::PAGE_SIZE + 17), Some(id));
        assert_eq!(heap.span_of(0x10), None);
    }

    #[test]
    fn test_try_new_rejects_absurd_arena() {
        let result = Heap::try_new(HeapConfig::default().arena_size(usize::MAX / 2));
        assert!(result.is_err());
    }
}
