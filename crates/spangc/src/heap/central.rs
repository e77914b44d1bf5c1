//! Central free lists, one per size class.
//!
//! `nonempty` holds spans with at least one free object once swept, `empty`
//! holds spans with none, and spans a thread cache currently owns. Both
//! lists keep swept spans at the back so a scan for unswept spans can stop
//! at the first swept one.

use std::sync::atomic::{AtomicU64, Ordering};

use super::bitmap::clear_range;
use super::span::{ListKind, SpanId, SpanList};
use super::Heap;
use crate::fatal::{throw, FatalKind};
use crate::gc::sync::{LockOrder, OrderedMutex};
use crate::sizeclass::{table, PAGE_SHIFT};

#[derive(Debug)]
pub(crate) struct CentralLists {
    pub(crate) nonempty: SpanList,
    pub(crate) empty: SpanList,
}

/// Span lists of one size class.
#[derive(Debug)]
pub struct CentralFreeList {
    class: usize,
    pub(crate) lists: OrderedMutex<CentralLists>,
    spans_obtained: AtomicU64,
}

impl CentralFreeList {
    pub(crate) const fn new(class: usize) -> Self {
        Self {
            class,
            lists: OrderedMutex::new(
                LockOrder::Central,
                CentralLists {
                    nonempty: SpanList::new(ListKind::CentralNonempty),
                    empty: SpanList::new(ListKind::CentralEmpty),
                },
            ),
            spans_obtained: AtomicU64::new(0),
        }
    }

    /// Size class served by this list.
    pub const fn class(&self) -> usize {
        self.class
    }

    /// Spans handed to thread caches so far.
    pub fn spans_obtained(&self) -> u64 {
        self.spans_obtained.load(Ordering::Relaxed)
    }

    /// Lengths of the nonempty and empty lists.
    pub fn list_lens(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.nonempty.len(), lists.empty.len())
    }

    /// Finds a span with a free object for a thread cache. The span stays on
    /// `empty` while it is cached.
    pub(crate) fn cache_span(&self, heap: &Heap) -> Option<SpanId> {
        let pages = table().class_pages(self.class);
        heap.deduct_sweep_credit(pages << PAGE_SHIFT, 0);

        let id = self.find_span(heap).or_else(|| {
            let id = self.grow(heap)?;
            self.lists.lock().empty.push_back(&heap.spans, id);
            Some(id)
        })?;

        let s = heap.spans.get(id);
        let n = s.nelems() - s.ref_count.load(Ordering::Relaxed);
        if n == 0 {
            throw(FatalKind::InvariantViolation, "empty span");
        }
        if s.free_list.load(Ordering::Relaxed) == 0 {
            throw(FatalKind::InvariantViolation, "freelist empty");
        }
        s.in_cache.store(true, Ordering::Release);
        self.spans_obtained.fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    /// Takes a swept nonempty span, sweeping on the way if needed. Falls back
    /// to sweeping empty spans in the hope they free something.
    fn find_span(&self, heap: &Heap) -> Option<SpanId> {
        let sg = heap.sweepgen();
        let mut lists = self.lists.lock();
        'retry: loop {
            let mut cur = lists.nonempty.first();
            while let Some(id) = cur {
                let s = heap.spans.get(id);
                let gen = s.sweepgen.load(Ordering::Acquire);
                if gen == sg.wrapping_sub(2) && claim(s, sg) {
                    lists.nonempty.remove(&heap.spans, id);
                    lists.empty.push_back(&heap.spans, id);
                    drop(lists);
                    heap.sweep_span(id, true);
                    return Some(id);
                }
                if gen == sg.wrapping_sub(1) {
                    // Being swept by someone else.
                    cur = SpanList::next_of(&heap.spans, id);
                    continue;
                }
                lists.nonempty.remove(&heap.spans, id);
                lists.empty.push_back(&heap.spans, id);
                return Some(id);
            }

            let mut cur = lists.empty.first();
            while let Some(id) = cur {
                let s = heap.spans.get(id);
                let gen = s.sweepgen.load(Ordering::Acquire);
                if gen == sg.wrapping_sub(2) && claim(s, sg) {
                    lists.empty.remove(&heap.spans, id);
                    lists.empty.push_back(&heap.spans, id);
                    drop(lists);
                    heap.sweep_span(id, true);
                    if s.free_list.load(Ordering::Relaxed) != 0 {
                        return Some(id);
                    }
                    lists = self.lists.lock();
                    continue 'retry;
                }
                if gen == sg.wrapping_sub(1) {
                    cur = SpanList::next_of(&heap.spans, id);
                    continue;
                }
                // The rest of the list is swept.
                break;
            }
            return None;
        }
    }

    /// Gives a cached span back.
    pub(crate) fn uncache_span(&self, heap: &Heap, id: SpanId) {
        let s = heap.spans.get(id);
        let mut lists = self.lists.lock();
        s.in_cache.store(false, Ordering::Release);
        if s.ref_count.load(Ordering::Relaxed) == 0 {
            throw(FatalKind::InvariantViolation, "uncaching full span");
        }
        if s.nelems() > s.ref_count.load(Ordering::Relaxed) {
            lists.empty.remove(&heap.spans, id);
            lists.nonempty.push_front(&heap.spans, id);
        }
    }

    /// Returns `n` swept objects to span `id`. `head` and `tail` are the
    /// free-list links (object index + 1) of the first and last of them.
    /// With `preserve` the span stays where it is and belongs to the
    /// caller; otherwise it moves to `nonempty` and is handed back to the
    /// page heap when no object is left. Returns `true` in that last case.
    pub(crate) fn free_span(
        &self,
        heap: &Heap,
        id: SpanId,
        n: usize,
        head: usize,
        tail: usize,
        preserve: bool,
    ) -> bool {
        let s = heap.spans.get(id);
        if s.in_cache.load(Ordering::Acquire) {
            throw(FatalKind::InvariantViolation, "freeing into a cached span");
        }

        // The sweeper owns the span, so the chain can be linked unlocked.
        let old = s.free_list.load(Ordering::Relaxed);
        let was_empty = old == 0;
        // SAFETY: `tail` is a freed object of this span.
        unsafe { (s.object_addr(tail - 1) as *mut usize).write(old) };
        s.free_list.store(head, Ordering::Relaxed);
        s.ref_count.fetch_sub(n, Ordering::Relaxed);

        if preserve {
            if s.list_kind() == ListKind::Unlinked {
                throw(FatalKind::InvariantViolation, "can't preserve unlinked span");
            }
            s.sweepgen.store(heap.sweepgen(), Ordering::Release);
            return false;
        }

        let mut lists = self.lists.lock();
        if was_empty {
            lists.empty.remove(&heap.spans, id);
            lists.nonempty.push_front(&heap.spans, id);
        }
        // Publishing the sweepgen lets caches take the span; it must follow
        // the list update.
        s.sweepgen.store(heap.sweepgen(), Ordering::Release);
        if s.ref_count.load(Ordering::Relaxed) != 0 {
            return false;
        }

        lists.nonempty.remove(&heap.spans, id);
        s.needzero.store(true, Ordering::Relaxed);
        s.free_list.store(0, Ordering::Relaxed);
        drop(lists);

        clear_range(&heap.arena, s.start(), s.bytes());
        heap.free_span(id);
        true
    }

    /// Allocates a fresh span from the page heap and threads a free list
    /// through its objects.
    fn grow(&self, heap: &Heap) -> Option<SpanId> {
        let class = table().class(self.class);
        let id = heap.alloc_span(class.pages, self.class, false, true)?;
        let s = heap.spans.get(id);
        let n = class.objects_per_span();
        s.set_limit(s.start() + n * class.size);

        for i in 0..n {
            let next = if i + 1 < n { i + 2 } else { 0 };
            // SAFETY: the span is fresh, committed and owned by this thread.
            unsafe { (s.object_addr(i) as *mut usize).write(next) };
        }
        s.free_list.store(1, Ordering::Relaxed);
        clear_range(&heap.arena, s.start(), s.bytes());
        Some(id)
    }
}

/// Claims span `s` for sweeping in generation `sg`.
#[inline]
pub(crate) fn claim(s: &super::span::Span, sg: u32) -> bool {
    s.sweepgen
        .compare_exchange(
            sg.wrapping_sub(2),
            sg.wrapping_sub(1),
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .is_ok()
}
