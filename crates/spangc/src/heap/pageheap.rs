//! The page heap.
//!
//! Free runs of pages are kept on exact-size lists for runs shorter than
//! [`MAX_HEAP_LIST`] pages and on one best-fit list above that. Spans of
//! large objects sit on matching busy lists so allocation can reclaim them
//! first. Freed spans coalesce with free neighbours found through the
//! page-to-span map, and runs idle for long enough are scavenged.
//!
//! The heap lock is never held across a call into the OS. Spans whose pages
//! are being committed, recommitted or released sit off every list in the
//! `Reserved` state until the lock is taken again.

use std::time::Duration;

use super::span::{ListKind, SpanId, SpanList, SpanState};
use super::Heap;
use crate::fatal::{throw, FatalKind};
use crate::gc::sync::OrderedGuard;
use crate::sizeclass::{table, PAGE_SHIFT};

/// Runs of at least this many pages share the large lists.
pub const MAX_HEAP_LIST: usize = 128;

/// Smallest amount the arena is grown by.
pub const HEAP_ALLOC_CHUNK: usize = 1 << 20;

/// Growth requests are rounded to this many bytes.
const HEAP_GROW_ROUND: usize = 64 << 10;

/// Span lists and page accounting. Guarded by the page heap lock.
#[derive(Debug)]
pub struct PageHeap {
    free: [SpanList; MAX_HEAP_LIST],
    free_large: SpanList,
    busy: [SpanList; MAX_HEAP_LIST],
    busy_large: SpanList,
    pub(crate) free_ids: Vec<SpanId>,
    /// Bytes obtained from the arena.
    pub(crate) heap_sys: usize,
    /// Bytes in in-use spans.
    pub(crate) heap_inuse: usize,
    /// Bytes in free spans.
    pub(crate) heap_idle: usize,
    /// Bytes of free spans returned to the OS.
    pub(crate) heap_released: usize,
}

/// A busy list, named so it can be found again after the lock was dropped.
#[derive(Debug, Clone, Copy)]
enum BusyList {
    Exact(usize),
    Large,
}

impl PageHeap {
    pub fn new() -> Self {
        Self {
            free: std::array::from_fn(|_| SpanList::new(ListKind::HeapFree)),
            free_large: SpanList::new(ListKind::HeapFree),
            busy: std::array::from_fn(|_| SpanList::new(ListKind::HeapBusy)),
            busy_large: SpanList::new(ListKind::HeapBusy),
            free_ids: Vec::new(),
            heap_sys: 0,
            heap_inuse: 0,
            heap_idle: 0,
            heap_released: 0,
        }
    }

    fn free_list(&mut self, npages: usize) -> &mut SpanList {
        if npages < MAX_HEAP_LIST {
            &mut self.free[npages]
        } else {
            &mut self.free_large
        }
    }

    fn busy_list(&mut self, npages: usize) -> &mut SpanList {
        if npages < MAX_HEAP_LIST {
            &mut self.busy[npages]
        } else {
            &mut self.busy_large
        }
    }

    fn busy_named(&mut self, which: BusyList) -> &mut SpanList {
        match which {
            BusyList::Exact(n) => &mut self.busy[n],
            BusyList::Large => &mut self.busy_large,
        }
    }

    /// Number of spans on the free lists.
    pub fn free_span_count(&self) -> usize {
        self.free.iter().map(SpanList::len).sum::<usize>() + self.free_large.len()
    }

    /// Number of large-object spans on the busy lists.
    pub fn busy_span_count(&self) -> usize {
        self.busy.iter().map(SpanList::len).sum::<usize>() + self.busy_large.len()
    }
}

type HeapGuard<'a> = OrderedGuard<'a, PageHeap>;

impl Heap {
    /// Allocates a span of `npages` pages for size class `class` (0 for a
    /// large object). Returns `None` when the arena is exhausted.
    pub(crate) fn alloc_span(
        &self,
        npages: usize,
        class: usize,
        large: bool,
        needzero: bool,
    ) -> Option<SpanId> {
        let id = {
            let mut h = self.pages.lock();
            // Sweep at least as many pages as we take, so the heap does not
            // grow while garbage is waiting to be swept.
            if !self.sweep_done() {
                self.reclaim(&mut h, npages);
            }
            let id = self.alloc_span_locked(&mut h, npages)?;
            let span = self.spans.get(id);
            span.sweepgen.store(self.sweepgen(), std::sync::atomic::Ordering::Release);
            let elem_size = if class == 0 {
                span.bytes()
            } else {
                table().class_size(class)
            };
            span.set_layout(class, elem_size);
            span.free_list.store(0, std::sync::atomic::Ordering::Relaxed);
            span.ref_count.store(0, std::sync::atomic::Ordering::Relaxed);
            self.stats.add_pages_in_use(npages);
            if large {
                self.stats.add_heap_live(span.bytes());
                h.busy_list(npages).push_back(&self.spans, id);
            }
            span.set_state(SpanState::InUse);
            id
        };
        if self.gc.blacken_enabled() {
            self.revise_pacer();
        }

        let span = self.spans.get(id);
        if needzero && span.needzero.load(std::sync::atomic::Ordering::Relaxed) {
            // SAFETY: the span is committed and owned by the caller.
            unsafe { std::ptr::write_bytes(span.start() as *mut u8, 0, span.bytes()) };
        }
        span.needzero.store(false, std::sync::atomic::Ordering::Relaxed);
        Some(id)
    }

    fn alloc_span_locked(&self, h: &mut HeapGuard<'_>, npages: usize) -> Option<SpanId> {
        let id = loop {
            let found = (npages..MAX_HEAP_LIST)
                .find_map(|i| h.free[i].first())
                .or_else(|| self.alloc_large_locked(&**h, npages));
            if let Some(id) = found {
                break id;
            }
            // Someone else may take the new pages while the lock is dropped.
            if !self.grow(h, npages) {
                return None;
            }
        };

        let s = self.spans.get(id);
        if s.state() != SpanState::Free {
            throw(FatalKind::InvariantViolation, "allocating a span that is not free");
        }
        if s.npages() < npages {
            throw(FatalKind::InvariantViolation, "free span too small");
        }
        h.free_list(s.npages()).remove(&self.spans, id);

        let released = s.npreleased.swap(0, std::sync::atomic::Ordering::Relaxed);
        if released > 0 {
            h.heap_released -= released << PAGE_SHIFT;
            s.set_state(SpanState::Reserved);
            let (start, bytes) = (s.start(), s.bytes());
            let recommitted = OrderedGuard::unlocked(h, || self.arena.reuse(start, bytes).is_ok());
            s.set_state(SpanState::Free);
            if !recommitted {
                throw(FatalKind::OutOfMemory, "cannot recommit released pages");
            }
        }

        if s.npages() > npages {
            // Split off the tail and give it back.
            let tid = self.spans.alloc_id(&mut h.free_ids);
            let t = self.spans.get(tid);
            t.init(s.start() + (npages << PAGE_SHIFT), s.npages() - npages);
            s.set_npages(npages);
            let p = self.arena.page_index(t.start());
            if p > 0 {
                self.spans.set_page(p - 1, id);
            }
            self.spans.set_page(p, tid);
            self.spans.set_page(p + t.npages() - 1, tid);
            t.needzero.store(
                s.needzero.load(std::sync::atomic::Ordering::Relaxed),
                std::sync::atomic::Ordering::Relaxed,
            );
            // Keep `s` out of coalescing while the tail is freed.
            s.set_state(SpanState::Reserved);
            t.set_state(SpanState::Reserved);
            let since = s.unused_since.load(std::sync::atomic::Ordering::Relaxed);
            self.free_span_locked(&mut **h, tid, false, false, since);
            s.set_state(SpanState::Free);
        }
        s.unused_since.store(0, std::sync::atomic::Ordering::Relaxed);

        let p = self.arena.page_index(s.start());
        for n in 0..npages {
            self.spans.set_page(p + n, id);
        }
        h.heap_inuse += npages << PAGE_SHIFT;
        h.heap_idle -= npages << PAGE_SHIFT;
        Some(id)
    }

    /// Best fit among the large free spans: fewest pages, then lowest
    /// address.
    fn alloc_large_locked(&self, h: &PageHeap, npages: usize) -> Option<SpanId> {
        h.free_large
            .iter(&self.spans)
            .filter(|&id| self.spans.get(id).npages() >= npages)
            .min_by_key(|&id| {
                let s = self.spans.get(id);
                (s.npages(), s.start())
            })
    }

    /// Extends the heap by at least `npages` pages. The arena commits with
    /// the heap lock dropped.
    fn grow(&self, h: &mut HeapGuard<'_>, npages: usize) -> bool {
        let want = (npages << PAGE_SHIFT).next_multiple_of(HEAP_GROW_ROUND);
        let chunk = want.max(HEAP_ALLOC_CHUNK);
        let grown = OrderedGuard::unlocked(h, || {
            self.arena.grow(chunk).map(|base| (base, chunk)).or_else(|| {
                if chunk > want {
                    self.arena.grow(want).map(|base| (base, want))
                } else {
                    None
                }
            })
        });
        let Some((base, ask)) = grown else {
            return false;
        };
        h.heap_sys += ask;

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_heap_grow(ask, self.arena.committed());

        // Free a fake in-use span so the new pages coalesce with the old.
        let id = self.spans.alloc_id(&mut h.free_ids);
        let s = self.spans.get(id);
        s.init(base, ask >> PAGE_SHIFT);
        let p = self.arena.page_index(base);
        for i in p..p + s.npages() {
            self.spans.set_page(i, id);
        }
        s.sweepgen.store(self.sweepgen(), std::sync::atomic::Ordering::Release);
        s.set_state(SpanState::InUse);
        self.stats.add_pages_in_use(s.npages());
        self.free_span_locked(&mut **h, id, false, true, 0);
        true
    }

    /// Returns an in-use span to the heap.
    pub(crate) fn free_span(&self, id: SpanId) {
        let mut h = self.pages.lock();
        self.free_span_locked(&mut h, id, true, true, 0);
    }

    fn free_span_locked(
        &self,
        h: &mut PageHeap,
        id: SpanId,
        acct_inuse: bool,
        acct_idle: bool,
        unused_since: u64,
    ) {
        use std::sync::atomic::Ordering::Relaxed;

        let s = self.spans.get(id);
        match s.state() {
            SpanState::Reserved => {
                if s.ref_count.load(Relaxed) != 0 {
                    throw(FatalKind::InvariantViolation, "invalid free of reserved span");
                }
            }
            SpanState::InUse => {
                if s.ref_count.load(Relaxed) != 0
                    || s.sweepgen.load(std::sync::atomic::Ordering::Acquire) != self.sweepgen()
                {
                    throw(FatalKind::InvariantViolation, "invalid free");
                }
                self.stats.sub_pages_in_use(s.npages());
            }
            SpanState::Free | SpanState::Dead => {
                throw(FatalKind::InvariantViolation, "freeing a span in a bad state");
            }
        }
        if acct_inuse {
            h.heap_inuse -= s.bytes();
        }
        if acct_idle {
            h.heap_idle += s.bytes();
        }
        s.set_state(SpanState::Free);
        match s.list_kind() {
            ListKind::Unlinked => {}
            ListKind::HeapBusy => h.busy_list(s.npages()).remove(&self.spans, id),
            _ => throw(FatalKind::InvariantViolation, "freeing a span still on a central list"),
        }

        let since = if unused_since == 0 {
            self.nanotime().max(1)
        } else {
            unused_since
        };
        s.unused_since.store(since, Relaxed);
        s.npreleased.store(0, Relaxed);

        // Coalesce with the run before.
        let mut p = self.arena.page_index(s.start());
        if p > 0 {
            if let Some(tid) = self.spans.span_at_page(p - 1) {
                let t = self.spans.get(tid);
                if tid != id && t.state() == SpanState::Free {
                    h.free_list(t.npages()).remove(&self.spans, tid);
                    s.set_start(t.start());
                    s.set_npages(s.npages() + t.npages());
                    s.npreleased.store(t.npreleased.load(Relaxed), Relaxed);
                    if t.needzero.load(Relaxed) {
                        s.needzero.store(true, Relaxed);
                    }
                    p -= t.npages();
                    self.spans.set_page(p, id);
                    t.set_state(SpanState::Dead);
                    h.free_ids.push(tid);
                }
            }
        }
        // And with the run after.
        if let Some(tid) = self.spans.span_at_page(p + s.npages()) {
            let t = self.spans.get(tid);
            if tid != id && t.state() == SpanState::Free {
                h.free_list(t.npages()).remove(&self.spans, tid);
                s.set_npages(s.npages() + t.npages());
                s.npreleased.fetch_add(t.npreleased.load(Relaxed), Relaxed);
                if t.needzero.load(Relaxed) {
                    s.needzero.store(true, Relaxed);
                }
                self.spans.set_page(p + s.npages() - 1, id);
                t.set_state(SpanState::Dead);
                h.free_ids.push(tid);
            }
        }

        h.free_list(s.npages()).push_front(&self.spans, id);
    }

    /// Sweeps large-object spans, then anything else, until `npages` pages
    /// were reclaimed. Drops the heap lock around each sweep.
    fn reclaim(&self, h: &mut HeapGuard<'_>, npages: usize) {
        // Large spans of at least the size we need are the best bet.
        for i in npages..MAX_HEAP_LIST {
            if self.reclaim_list(h, BusyList::Exact(i), npages) != 0 {
                return;
            }
        }
        if self.reclaim_list(h, BusyList::Large, npages) != 0 {
            return;
        }

        // Then smaller ones; several of them are needed.
        let mut reclaimed = 0;
        for i in 1..npages.min(MAX_HEAP_LIST) {
            reclaimed += self.reclaim_list(h, BusyList::Exact(i), npages - reclaimed);
            if reclaimed >= npages {
                return;
            }
        }

        OrderedGuard::unlocked(h, || {
            while let Some(n) = self.sweep_one() {
                reclaimed += n;
                if reclaimed >= npages {
                    break;
                }
            }
        });
    }

    fn reclaim_list(&self, h: &mut HeapGuard<'_>, which: BusyList, npages: usize) -> usize {
        use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

        let sg = self.sweepgen();
        let mut reclaimed = 0;
        'retry: loop {
            let mut cur = h.busy_named(which).first();
            while let Some(id) = cur {
                let s = self.spans.get(id);
                let gen = s.sweepgen.load(Acquire);
                if gen == sg.wrapping_sub(2)
                    && s.sweepgen
                        .compare_exchange(gen, sg.wrapping_sub(1), AcqRel, Relaxed)
                        .is_ok()
                {
                    // Swept spans go to the back.
                    let list = h.busy_named(which);
                    list.remove(&self.spans, id);
                    list.push_back(&self.spans, id);
                    let pages = s.npages();
                    if OrderedGuard::unlocked(h, || self.sweep_span(id, false)) {
                        reclaimed += pages;
                    }
                    if reclaimed >= npages {
                        return reclaimed;
                    }
                    continue 'retry;
                }
                if gen == sg.wrapping_sub(1) {
                    // Someone else is sweeping it.
                    cur = SpanList::next_of(&self.spans, id);
                    continue;
                }
                // Everything after a swept span is swept too.
                break 'retry;
            }
            break;
        }
        reclaimed
    }

    /// Returns the pages of free spans idle for at least `older_than` to the
    /// OS. Returns the number of bytes released.
    pub fn scavenge(&self, older_than: Duration) -> usize {
        use std::sync::atomic::Ordering::Relaxed;

        let now = self.nanotime();
        let limit = u64::try_from(older_than.as_nanos()).unwrap_or(u64::MAX);
        let mut h = self.pages.lock();
        let idle: Vec<SpanId> = h
            .free
            .iter()
            .chain(std::iter::once(&h.free_large))
            .flat_map(|list| list.iter(&self.spans))
            .filter(|&id| {
                let s = self.spans.get(id);
                now.saturating_sub(s.unused_since.load(Relaxed)) >= limit
                    && s.npreleased.load(Relaxed) != s.npages()
            })
            .collect();
        if idle.is_empty() {
            return 0;
        }
        for &id in &idle {
            let s = self.spans.get(id);
            h.free_list(s.npages()).remove(&self.spans, id);
            s.set_state(SpanState::Reserved);
        }

        let outcome: Vec<bool> = OrderedGuard::unlocked(&mut h, || {
            idle.iter()
                .map(|&id| {
                    let s = self.spans.get(id);
                    self.arena.release(s.start(), s.bytes()).is_ok()
                })
                .collect()
        });

        // Neighbours freed in the meantime did not coalesce with these; they
        // merge the next time either side is freed.
        let mut released = 0;
        for (&id, ok) in idle.iter().zip(outcome) {
            let s = self.spans.get(id);
            if ok {
                released += (s.npages() - s.npreleased.load(Relaxed)) << PAGE_SHIFT;
                s.npreleased.store(s.npages(), Relaxed);
            }
            s.set_state(SpanState::Free);
            h.free_list(s.npages()).push_front(&self.spans, id);
        }
        h.heap_released += released;
        drop(h);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_scavenge(released);

        released
    }

    /// Releases every idle page regardless of age.
    pub fn release_unused(&self) -> usize {
        self.scavenge(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use crate::config::HeapConfig;
    use crate::heap::span::SpanState;
    use crate::heap::Heap;
    use crate::sizeclass::PAGE_SIZE;

    fn heap() -> std::sync::Arc<Heap> {
        Heap::new(HeapConfig::default().arena_size(16 << 20).gc_percent(None))
    }

    #[test]
    fn test_alloc_span_grows_by_a_chunk() {
        let heap = heap();
        let id = heap.alloc_span(1, 0, true, true).expect("span");
        let span = heap.spans.get(id);
        assert_eq!(span.npages(), 1);
        assert_eq!(span.state(), SpanState::InUse);
        let h = heap.pages.lock();
        assert_eq!(h.heap_sys, super::HEAP_ALLOC_CHUNK);
        assert_eq!(h.heap_inuse, PAGE_SIZE);
        assert_eq!(h.heap_idle, super::HEAP_ALLOC_CHUNK - PAGE_SIZE);
        assert_eq!(h.free_span_count(), 1, "the tail is one free span");
        assert_eq!(h.busy_span_count(), 1);
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let heap = heap();
        let a = heap.alloc_span(2, 0, true, true).expect("a");
        let b = heap.alloc_span(3, 0, true, true).expect("b");
        let c = heap.alloc_span(1, 0, true, true).expect("c");
        let start_a = heap.spans.get(a).start();
        assert_eq!(heap.spans.get(b).start(), start_a + 2 * PAGE_SIZE);

        heap.free_span(a);
        heap.free_span(c);
        assert_eq!(heap.pages.lock().free_span_count(), 2);
        heap.free_span(b);
        let h = heap.pages.lock();
        assert_eq!(h.free_span_count(), 1, "everything merged back into one run");
        assert_eq!(h.heap_inuse, 0);
        assert_eq!(h.heap_idle, h.heap_sys);
    }

    #[test]
    fn test_freed_pages_are_reused() {
        let heap = heap();
        let a = heap.alloc_span(4, 0, true, true).expect("a");
        let start = heap.spans.get(a).start();
        heap.free_span(a);
        let b = heap.alloc_span(4, 0, true, true).expect("b");
        assert_eq!(heap.spans.get(b).start(), start);
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn test_double_free_is_fatal() {
        let heap = heap();
        let a = heap.alloc_span(1, 0, true, true).expect("a");
        heap.spans.get(a).ref_count.store(1, Ordering::Relaxed);
        heap.free_span(a);
    }

    #[test]
    fn test_scavenge_and_reuse() {
        let heap = heap();
        let a = heap.alloc_span(8, 0, true, true).expect("a");
        let start = heap.spans.get(a).start();
        unsafe { (start as *mut u64).write(7) };
        heap.free_span(a);
        let released = heap.release_unused();
        assert!(released >= 8 * PAGE_SIZE);
        assert_eq!(heap.pages.lock().heap_released, released);

        let b = heap.alloc_span(8, 0, true, true).expect("b");
        let span = heap.spans.get(b);
        assert_eq!(span.npreleased.load(Ordering::Relaxed), 0);
        unsafe {
            (span.start() as *mut u64).write(9);
            assert_eq!((span.start() as *const u64).read(), 9);
        }
        assert!(heap.pages.lock().heap_released < released);
    }

    #[test]
    fn test_scavenge_races_span_allocation() {
        let heap = Heap::new(HeapConfig::default().arena_size(64 << 20).gc_percent(None));
        std::thread::scope(|scope| {
            for t in 0..3usize {
                let heap = &heap;
                scope.spawn(move || {
                    for i in 0..200usize {
                        let id = heap.alloc_span(1 + (i + t) % 40, 0, true, true).expect("span");
                        let p = heap.spans.get(id).start() as *mut u64;
                        // SAFETY: the span is committed and owned by this thread.
                        unsafe {
                            p.write(i as u64);
                            assert_eq!(p.read(), i as u64);
                        }
                        heap.free_span(id);
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..200 {
                    heap.release_unused();
                }
            });
        });
        let h = heap.pages.lock();
        assert_eq!(h.heap_inuse, 0);
        assert_eq!(h.heap_idle, h.heap_sys);
        assert!(h.heap_released <= h.heap_idle);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "page heap lock held")]
    fn test_os_calls_refuse_the_heap_lock() {
        let heap = heap();
        let _h = heap.pages.lock();
        heap.arena.grow(PAGE_SIZE);
    }

    #[test]
    fn test_arena_exhaustion_returns_none() {
        let heap = Heap::new(HeapConfig::default().arena_size(1 << 20).gc_percent(None));
        assert!(heap.alloc_span(200, 0, true, true).is_none());
        assert!(heap.alloc_span(64, 0, true, true).is_some());
    }
}
