//! Sweeping.
//!
//! After mark termination every in-use span is unswept (`sweepgen ==
//! heap sweepgen - 2`). Spans are swept lazily: by the central lists before
//! they hand a span out, by the page heap before it grows, by allocations
//! paying off their sweep debt and by the background collector thread.
//! Whoever wins the `sweepgen` CAS sweeps; everyone else skips the span.
//!
//! Threads that are not stopped with the world may be inside `sweep_one`
//! when a cycle ends. Rearming the sweeper closes a gate and waits for them
//! to leave, so no sweeper mixes one cycle's generation with the next
//! cycle's span range.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

use super::pacer::AtomicF64;
use crate::fatal::{throw, FatalKind};
use crate::heap::bitmap::{clear_range, HeapBits};
use crate::heap::central::claim;
use crate::heap::span::SpanState;
use crate::heap::{Heap, SpanId};
use crate::sizeclass::{PAGE_SIZE, PTR_SIZE};

/// Word 1 of a freed object larger than two words: the object needs zeroing
/// before reuse.
#[cfg(target_pointer_width = "64")]
pub const NEEDS_ZEROING: usize = 0xdead_dead_dead_dead;
#[cfg(not(target_pointer_width = "64"))]
pub const NEEDS_ZEROING: usize = 0xdead_dead;

/// Sweep progress of the current cycle.
#[derive(Debug)]
pub(crate) struct SweepState {
    /// Next span pool index the sweeper looks at.
    index: AtomicU32,
    /// Pool high-water mark when the cycle's sweep started.
    limit: AtomicU32,
    done: AtomicBool,
    /// Threads inside `sweep_one`.
    active: AtomicUsize,
    /// Set while the sweeper is being rearmed; keeps new sweepers out.
    rearming: AtomicBool,
    /// Pages swept this cycle.
    pub(crate) pages_swept: AtomicU64,
    /// Span bytes allocated this cycle, for proportional sweep.
    span_bytes_alloc: AtomicU64,
    pages_per_byte: AtomicF64,
    /// Spans swept by the background collector.
    pub(crate) background_swept: AtomicU64,
}

impl SweepState {
    pub(crate) const fn new() -> Self {
        Self {
            index: AtomicU32::new(0),
            limit: AtomicU32::new(0),
            done: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            rearming: AtomicBool::new(false),
            pages_swept: AtomicU64::new(0),
            span_bytes_alloc: AtomicU64::new(0),
            pages_per_byte: AtomicF64::new(0.0),
            background_swept: AtomicU64::new(0),
        }
    }

    /// Threads currently inside `sweep_one`.
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Registers a sweeper, waiting while the sweeper is rearmed.
    fn enter(&self) {
        let backoff = Backoff::new();
        loop {
            self.active.fetch_add(1, Ordering::SeqCst);
            if !self.rearming.load(Ordering::SeqCst) {
                return;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            while self.rearming.load(Ordering::Acquire) {
                backoff.snooze();
            }
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Heap {
    /// All spans of the current cycle are swept.
    #[inline]
    pub fn sweep_done(&self) -> bool {
        self.sweep.done.load(Ordering::Acquire)
    }

    /// Advances `sweepgen` and arms sweeping for the cycle that just
    /// finished marking. The world is stopped; sweepers running on other
    /// threads are drained first.
    pub(crate) fn start_sweep(&self) {
        let sweep = &self.sweep;
        sweep.rearming.store(true, Ordering::SeqCst);
        let backoff = Backoff::new();
        while sweep.active.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }

        self.advance_sweepgen();
        sweep.index.store(0, Ordering::Relaxed);
        sweep.limit.store(self.spans.high_water(), Ordering::Relaxed);
        sweep.pages_swept.store(0, Ordering::Relaxed);
        sweep.span_bytes_alloc.store(0, Ordering::Relaxed);
        sweep.done.store(false, Ordering::Release);

        // Sweep every in-use page before heap_live reaches next_gc, with a
        // 1 MiB margin.
        let live = self.stats.heap_live.load(Ordering::Relaxed);
        let next_gc = self.stats.next_gc.load(Ordering::Relaxed);
        let distance = next_gc.saturating_sub(live).saturating_sub(1 << 20).max(PAGE_SIZE as u64);
        let pages = self.stats.pages_in_use.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        sweep.pages_per_byte.store(pages as f64 / distance as f64);
        sweep.rearming.store(false, Ordering::Release);
    }

    /// Proportional sweep ratio: pages owed per span byte allocated.
    pub fn sweep_pages_per_byte(&self) -> f64 {
        self.sweep.pages_per_byte.load()
    }

    /// Sweeps one unswept span. Returns the pages it returned to the heap
    /// (0 if it kept live objects), or `None` once nothing is left.
    pub fn sweep_one(&self) -> Option<usize> {
        let sweep = &self.sweep;
        sweep.enter();
        let sg = self.sweepgen();
        let limit = sweep.limit.load(Ordering::Acquire);
        let result = loop {
            let idx = sweep.index.fetch_add(1, Ordering::AcqRel);
            if idx >= limit {
                if !sweep.done.swap(true, Ordering::AcqRel) {
                    sweep.pages_per_byte.store(0.0);
                    #[cfg(feature = "tracing")]
                    crate::tracing::internal::log_sweep_done(
                        sweep.pages_swept.load(Ordering::Relaxed),
                    );
                }
                break None;
            }
            let id = self.spans.id_at(idx);
            let s = self.spans.get(id);
            if s.state() != SpanState::InUse {
                continue;
            }
            if s.sweepgen.load(Ordering::Acquire) != sg.wrapping_sub(2) || !claim(s, sg) {
                continue;
            }
            let npages = s.npages();
            break Some(if self.sweep_span(id, false) { npages } else { 0 });
        };
        sweep.leave();
        result
    }

    /// Sweeps until no unswept span is left.
    pub fn finish_sweep(&self) {
        while self.sweep_one().is_some() {}
    }

    /// In-use spans still waiting to be swept this cycle.
    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn unswept_spans(&self) -> usize {
        let stale = self.sweepgen().wrapping_sub(2);
        (0..self.spans.high_water())
            .map(|i| self.spans.get(self.spans.id_at(i)))
            .filter(|s| s.state() == SpanState::InUse && s.sweepgen.load(Ordering::Acquire) == stale)
            .count()
    }

    /// Pays the proportional sweep debt of allocating `span_bytes`.
    /// `caller_sweep_pages` is sweeping the caller is about to do itself.
    pub(crate) fn deduct_sweep_credit(&self, span_bytes: usize, caller_sweep_pages: usize) {
        let sweep = &self.sweep;
        let ratio = sweep.pages_per_byte.load();
        if ratio == 0.0 {
            return;
        }
        let alloc = sweep.span_bytes_alloc.fetch_add(span_bytes as u64, Ordering::AcqRel)
            + span_bytes as u64;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let owed = (ratio * alloc as f64) as i64;
        #[allow(clippy::cast_possible_wrap)]
        while owed - sweep.pages_swept.load(Ordering::Acquire) as i64 > caller_sweep_pages as i64 {
            if self.sweep_one().is_none() {
                break;
            }
        }
    }

    /// Sweeps span `id`, which the caller claimed (`sweepgen == sg - 1`).
    ///
    /// Unmarked objects are freed; marked ones lose their mark. With
    /// `preserve` the span is kept by the caller instead of being moved
    /// between lists or returned to the heap. Returns `true` if the span
    /// went back to the page heap.
    pub(crate) fn sweep_span(&self, id: SpanId, preserve: bool) -> bool {
        let s = self.spans.get(id);
        let sg = self.sweepgen();
        if s.state() != SpanState::InUse || s.sweepgen.load(Ordering::Acquire) != sg.wrapping_sub(1)
        {
            throw(FatalKind::InvariantViolation, "sweeping a span in a bad state");
        }
        self.sweep.pages_swept.fetch_add(s.npages() as u64, Ordering::Relaxed);

        let class = s.size_class();
        let size = s.elem_size();
        let start = s.start();

        // Free objects count as marked so they are not freed twice.
        for obj in s.free_objects() {
            if obj < start || obj >= s.limit() {
                throw(FatalKind::InvariantViolation, "free list corrupted");
            }
            HeapBits::new(&self.arena, obj).set_marked();
        }

        // Dead objects with a finalizer are marked here and kept.
        let dying = self.sweep_specials(s);
        self.queue_finalizers(dying.finalizers);
        self.profile.record_frees(&dying.profile_frees);

        let mut nfree = 0;
        let mut head = 0;
        let mut tail = 0;
        let mut free_to_heap = false;
        for i in 0..s.nelems() {
            let obj = s.object_addr(i);
            let hb = HeapBits::new(&self.arena, obj);
            if hb.is_marked() {
                hb.clear_marked();
                continue;
            }
            hb.clear();
            if size > PTR_SIZE {
                hb.next().clear();
            }

            if class == 0 {
                if preserve {
                    throw(FatalKind::InvariantViolation, "can't preserve large span");
                }
                clear_range(&self.arena, start, s.bytes());
                s.needzero.store(true, Ordering::Relaxed);
                free_to_heap = true;
                continue;
            }

            // SAFETY: `obj` is a dead object of a span this thread claimed.
            unsafe {
                let word1 = (obj + PTR_SIZE) as *mut usize;
                if size > 2 * PTR_SIZE {
                    word1.write(NEEDS_ZEROING);
                } else if size > PTR_SIZE {
                    word1.write(0);
                }
                (obj as *mut usize).write(0);
                if tail != 0 {
                    (s.object_addr(tail - 1) as *mut usize).write(i + 1);
                }
            }
            if head == 0 {
                head = i + 1;
            }
            tail = i + 1;
            nfree += 1;
        }

        if free_to_heap || nfree == 0 {
            // Still ours until the new sweepgen is published.
            if s.state() != SpanState::InUse
                || s.sweepgen.load(Ordering::Acquire) != sg.wrapping_sub(1)
            {
                throw(FatalKind::InvariantViolation, "bad span state after sweep");
            }
            s.sweepgen.store(sg, Ordering::Release);
        }

        if nfree > 0 {
            self.stats.nsmallfree[class].fetch_add(nfree as u64, Ordering::Relaxed);
            self.central[class].free_span(self, id, nfree, head, tail, preserve)
        } else if free_to_heap {
            self.stats.nlargefree.fetch_add(1, Ordering::Relaxed);
            self.stats.largefree.fetch_add(size as u64, Ordering::Relaxed);
            self.free_span(id);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::HeapConfig;

    fn heap() -> std::sync::Arc<Heap> {
        Heap::new(HeapConfig::default().arena_size(16 << 20).gc_percent(None))
    }

    /// Advances the generation so every in-use span is unswept.
    fn new_generation(heap: &Heap) {
        heap.start_sweep();
    }

    #[test]
    fn test_unmarked_large_span_is_freed() {
        let heap = heap();
        let id = heap.alloc_span(2, 0, true, true).expect("span");
        heap.spans.get(id).set_limit(heap.spans.get(id).start() + 2 * PAGE_SIZE);
        new_generation(&heap);
        assert_eq!(heap.sweep_one(), Some(2));
        assert_eq!(heap.spans.get(id).state(), SpanState::Free);
        assert_eq!(heap.sweep_one(), None);
        assert!(heap.sweep_done());
    }

    #[test]
    fn test_marked_large_span_survives_and_loses_mark() {
        let heap = heap();
        let id = heap.alloc_span(1, 0, true, true).expect("span");
        let start = heap.spans.get(id).start();
        HeapBits::new(&heap.arena, start).set_marked();
        new_generation(&heap);
        assert_eq!(heap.sweep_one(), Some(0));
        assert_eq!(heap.spans.get(id).state(), SpanState::InUse);
        assert_eq!(heap.spans.get(id).sweepgen.load(Ordering::Relaxed), heap.sweepgen());
        assert!(!HeapBits::new(&heap.arena, start).is_marked());
    }

    #[test]
    fn test_small_span_frees_unmarked_objects() {
        let heap = heap();
        let class = 6;
        let central = &heap.central[class];
        let id = central.cache_span(&heap).expect("span");
        let s = heap.spans.get(id);
        let objs: Vec<usize> = (0..4).map(|_| s.pop_free().expect("object")).collect();
        central.uncache_span(&heap, id);
        HeapBits::new(&heap.arena, objs[1]).set_marked();

        new_generation(&heap);
        heap.finish_sweep();
        assert_eq!(s.ref_count.load(Ordering::Relaxed), 1);
        assert_eq!(s.free_objects().count(), s.nelems() - 1);
        assert!(!s.free_objects().any(|o| o == objs[1]));
        assert_eq!(heap.stats.nsmallfree[class].load(Ordering::Relaxed), 3);
        if s.elem_size() > 2 * PTR_SIZE {
            let word1 = unsafe { ((objs[0] + PTR_SIZE) as *const usize).read() };
            assert_eq!(word1, NEEDS_ZEROING);
        }
    }

    #[test]
    fn test_fully_free_small_span_returns_to_heap() {
        let heap = heap();
        let central = &heap.central[3];
        let id = central.cache_span(&heap).expect("span");
        let s = heap.spans.get(id);
        s.pop_free().expect("object");
        central.uncache_span(&heap, id);

        new_generation(&heap);
        heap.finish_sweep();
        assert_eq!(s.state(), SpanState::Free);
        assert_eq!(central.list_lens(), (0, 0));
    }

    #[test]
    fn test_sweep_credit_sweeps_proportionally() {
        let heap = heap();
        let ids: Vec<_> = (0..8).map(|_| heap.alloc_span(1, 0, true, true).expect("span")).collect();
        for &id in &ids {
            HeapBits::new(&heap.arena, heap.spans.get(id).start()).set_marked();
        }
        new_generation(&heap);
        assert!(heap.sweep_pages_per_byte() > 0.0);
        heap.sweep.pages_per_byte.store(1.0 / PAGE_SIZE as f64);
        heap.deduct_sweep_credit(3 * PAGE_SIZE, 0);
        assert!(heap.sweep.pages_swept.load(Ordering::Relaxed) >= 3);
        heap.deduct_sweep_credit(64 * PAGE_SIZE, 0);
        assert!(heap.sweep_done());
        assert_eq!(heap.sweep_pages_per_byte(), 0.0);
    }

    #[test]
    fn test_rearming_waits_for_sweepers_in_flight() {
        let heap = heap();
        let id = heap.alloc_span(1, 0, true, true).expect("span");
        HeapBits::new(&heap.arena, heap.spans.get(id).start()).set_marked();
        new_generation(&heap);

        // A sweeper of the old cycle is still inside `sweep_one`.
        heap.sweep.enter();
        std::thread::scope(|scope| {
            let rearm = scope.spawn(|| heap.start_sweep());
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!rearm.is_finished(), "rearming must wait for the sweeper");
            let sg = heap.sweepgen();
            heap.sweep.leave();
            rearm.join().unwrap();
            assert_eq!(heap.sweepgen(), sg + 2);
        });
        assert!(!heap.sweep_done());
        assert_eq!(heap.sweep.active(), 0);
    }

    #[test]
    fn test_sweep_done_is_never_reported_early() {
        let heap = heap();
        let ids: Vec<_> = (0..32).map(|_| heap.alloc_span(1, 0, true, true).expect("span")).collect();
        let stop = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    heap.sweep_one();
                    heap.deduct_sweep_credit(PAGE_SIZE, 0);
                }
            });
            for _ in 0..200 {
                for &id in &ids {
                    HeapBits::new(&heap.arena, heap.spans.get(id).start()).set_marked();
                }
                new_generation(&heap);
                while !heap.sweep_done() {
                    std::thread::yield_now();
                }
                assert_eq!(heap.unswept_spans(), 0);
            }
            stop.store(true, Ordering::Relaxed);
        });
    }

    #[test]
    fn test_sweepgen_claim_is_exclusive() {
        let heap = heap();
        let id = heap.alloc_span(1, 0, true, true).expect("span");
        new_generation(&heap);
        let s = heap.spans.get(id);
        assert!(claim(s, heap.sweepgen()));
        assert!(!claim(s, heap.sweepgen()));
    }
}
