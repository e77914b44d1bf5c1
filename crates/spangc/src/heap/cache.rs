//! Per-worker thread cache.
//!
//! Holds one span per size class and the tiny-object block. Only the owning
//! worker touches it, under its own (uncontended) lock, so the fast path
//! takes no shared lock at all.

use std::sync::atomic::Ordering;

use super::span::SpanId;
use super::Heap;
use crate::fatal::{throw, FatalKind};
use crate::sizeclass::NUM_SIZE_CLASSES;

#[derive(Debug)]
pub struct ThreadCache {
    alloc: [Option<SpanId>; NUM_SIZE_CLASSES],
    /// Current tiny block, 0 when there is none.
    pub(crate) tiny: usize,
    pub(crate) tiny_offset: usize,
    /// Bytes handed out from cached spans since the last flush.
    pub(crate) local_cachealloc: u64,
    /// Scannable bytes allocated since the last flush.
    pub(crate) local_scan: u64,
    pub(crate) local_tinyallocs: u64,
    pub(crate) local_nsmallalloc: [u64; NUM_SIZE_CLASSES],
    pub(crate) local_nlargealloc: u64,
    pub(crate) local_largealloc: u64,
    /// Bytes left to allocate before the next profile sample.
    pub(crate) next_sample: usize,
    /// Xorshift state of the sample interval generator.
    sample_state: u64,
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            alloc: [None; NUM_SIZE_CLASSES],
            tiny: 0,
            tiny_offset: 0,
            local_cachealloc: 0,
            local_scan: 0,
            local_tinyallocs: 0,
            local_nsmallalloc: [0; NUM_SIZE_CLASSES],
            local_nlargealloc: 0,
            local_largealloc: 0,
            next_sample: 0,
            sample_state: 0x853c_49e6_748f_ea9b,
        }
    }

    /// Seeds the profile sampler and draws the first sample point.
    pub(crate) fn seed_sampler(&mut self, seed: u64, rate: usize) {
        // SplitMix64 finaliser; xorshift needs a non-zero state.
        let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        self.sample_state = (z ^ (z >> 31)) | 1;
        if rate > 0 {
            self.next_sample = self.draw_sample_interval(rate) / 2;
        }
    }

    /// Uniform draw from `[0, 2 * rate)`, averaging `rate`.
    pub(crate) fn draw_sample_interval(&mut self, rate: usize) -> usize {
        let mut x = self.sample_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.sample_state = x;
        #[allow(clippy::cast_possible_truncation)]
        let n = (x % (2 * rate as u64)) as usize;
        n
    }

    /// Pops an object of `class` from the cached span, if it has one.
    #[inline]
    pub(crate) fn next_free(&self, heap: &Heap, class: usize) -> Option<usize> {
        let id = self.alloc[class]?;
        heap.spans.get(id).pop_free()
    }

    /// The span currently cached for `class`.
    pub fn span(&self, class: usize) -> Option<SpanId> {
        self.alloc[class]
    }

    /// Replaces the exhausted span of `class` with one from the central
    /// list.
    pub(crate) fn refill(&mut self, heap: &Heap, class: usize) {
        self.flush_stats(heap);

        // The old span stays on the central empty list; dropping the cache
        // flag is all that is needed to give it up.
        if let Some(old) = self.alloc[class].take() {
            let s = heap.spans.get(old);
            if s.free_list.load(Ordering::Relaxed) != 0 {
                throw(FatalKind::InvariantViolation, "refill on a nonempty span");
            }
            s.in_cache.store(false, Ordering::Release);
        }

        let Some(id) = heap.central[class].cache_span(heap) else {
            throw(FatalKind::OutOfMemory, "out of memory");
        };
        self.alloc[class] = Some(id);
    }

    /// Gives every cached span back to its central list and forgets the tiny
    /// block.
    pub(crate) fn release_all(&mut self, heap: &Heap) {
        self.flush_stats(heap);
        for (class, slot) in self.alloc.iter_mut().enumerate() {
            if let Some(id) = slot.take() {
                heap.central[class].uncache_span(heap, id);
            }
        }
        self.tiny = 0;
        self.tiny_offset = 0;
    }

    /// Moves the local counters into the heap statistics.
    pub(crate) fn flush_stats(&mut self, heap: &Heap) {
        let stats = &heap.stats;
        stats.heap_live.fetch_add(self.local_cachealloc, Ordering::Relaxed);
        stats.heap_scan.fetch_add(self.local_scan, Ordering::Relaxed);
        stats.tiny_allocs.fetch_add(self.local_tinyallocs, Ordering::Relaxed);
        stats.nlargealloc.fetch_add(self.local_nlargealloc, Ordering::Relaxed);
        stats.largealloc.fetch_add(self.local_largealloc, Ordering::Relaxed);
        for (total, local) in stats.nsmallalloc.iter().zip(self.local_nsmallalloc.iter_mut()) {
            if *local != 0 {
                total.fetch_add(*local, Ordering::Relaxed);
                *local = 0;
            }
        }
        self.local_cachealloc = 0;
        self.local_scan = 0;
        self.local_tinyallocs = 0;
        self.local_nlargealloc = 0;
        self.local_largealloc = 0;
    }
}
