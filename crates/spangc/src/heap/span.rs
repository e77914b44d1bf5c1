//! Spans, span lists and the span pool.
//!
//! A span is a run of contiguous arena pages. Span records live in a fixed
//! pool addressed by [`SpanId`]; every field is atomic so shared references
//! can be handed around freely. Which tier may write a field is governed by
//! ownership: the page heap lock for free spans, the central lock for list
//! links of small spans, the owning thread cache for the free list of a
//! cached span, and the sweep claim (`sweepgen`) while a span is swept.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use super::special::Specials;
use crate::fatal::{throw, FatalKind};
use crate::sizeclass::PAGE_SHIFT;

/// Index of a span record in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u32);

impl SpanId {
    pub(crate) const NIL: u32 = u32::MAX;

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    const fn from_raw(raw: u32) -> Option<Self> {
        if raw == Self::NIL {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[inline]
    const fn raw(id: Option<Self>) -> u32 {
        match id {
            Some(SpanId(i)) => i,
            None => Self::NIL,
        }
    }
}

/// Lifecycle state of a span record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpanState {
    /// Unused record.
    Dead = 0,
    /// Holds objects (small or large).
    InUse = 1,
    /// On a page heap free list.
    Free = 2,
    /// Being split off under the heap lock; never coalesced.
    Reserved = 3,
}

impl SpanState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::InUse,
            2 => Self::Free,
            3 => Self::Reserved,
            _ => Self::Dead,
        }
    }
}

/// Which kind of list a span is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListKind {
    Unlinked = 0,
    HeapFree = 1,
    HeapBusy = 2,
    CentralNonempty = 3,
    CentralEmpty = 4,
}

impl ListKind {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::HeapFree,
            2 => Self::HeapBusy,
            3 => Self::CentralNonempty,
            4 => Self::CentralEmpty,
            _ => Self::Unlinked,
        }
    }
}

/// One span record.
#[derive(Debug)]
pub struct Span {
    start: AtomicUsize,
    npages: AtomicUsize,
    state: AtomicU8,
    size_class: AtomicU8,
    elem_size: AtomicUsize,
    limit: AtomicUsize,
    /// Object index + 1 of the first free object; 0 when empty.
    pub(crate) free_list: AtomicUsize,
    /// Allocated objects.
    pub(crate) ref_count: AtomicUsize,
    pub(crate) sweepgen: AtomicU32,
    pub(crate) needzero: AtomicBool,
    pub(crate) in_cache: AtomicBool,
    /// Nanoseconds since heap creation when the span became free.
    pub(crate) unused_since: AtomicU64,
    /// Pages handed back to the OS.
    pub(crate) npreleased: AtomicUsize,
    /// Finalizer and profile records of the span's objects.
    pub(crate) specials: Specials,
    next: AtomicU32,
    prev: AtomicU32,
    list: AtomicU8,
}

impl Span {
    const fn new() -> Self {
        Self {
            start: AtomicUsize::new(0),
            npages: AtomicUsize::new(0),
            state: AtomicU8::new(SpanState::Dead as u8),
            size_class: AtomicU8::new(0),
            elem_size: AtomicUsize::new(0),
            limit: AtomicUsize::new(0),
            free_list: AtomicUsize::new(0),
            ref_count: AtomicUsize::new(0),
            sweepgen: AtomicU32::new(0),
            needzero: AtomicBool::new(false),
            in_cache: AtomicBool::new(false),
            unused_since: AtomicU64::new(0),
            npreleased: AtomicUsize::new(0),
            specials: Specials::new(),
            next: AtomicU32::new(SpanId::NIL),
            prev: AtomicU32::new(SpanId::NIL),
            list: AtomicU8::new(ListKind::Unlinked as u8),
        }
    }

    /// Resets the record for a fresh run of pages.
    pub(crate) fn init(&self, start: usize, npages: usize) {
        self.start.store(start, Ordering::Relaxed);
        self.npages.store(npages, Ordering::Relaxed);
        self.size_class.store(0, Ordering::Relaxed);
        self.elem_size.store(0, Ordering::Relaxed);
        self.limit.store(0, Ordering::Relaxed);
        self.free_list.store(0, Ordering::Relaxed);
        self.ref_count.store(0, Ordering::Relaxed);
        self.needzero.store(false, Ordering::Relaxed);
        self.in_cache.store(false, Ordering::Relaxed);
        self.unused_since.store(0, Ordering::Relaxed);
        self.npreleased.store(0, Ordering::Relaxed);
        self.specials.clear();
        self.next.store(SpanId::NIL, Ordering::Relaxed);
        self.prev.store(SpanId::NIL, Ordering::Relaxed);
        self.list.store(ListKind::Unlinked as u8, Ordering::Relaxed);
        self.state.store(SpanState::Dead as u8, Ordering::Release);
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start.load(Ordering::Relaxed)
    }

    pub(crate) fn set_start(&self, start: usize) {
        self.start.store(start, Ordering::Relaxed);
    }

    #[inline]
    pub fn npages(&self) -> usize {
        self.npages.load(Ordering::Relaxed)
    }

    pub(crate) fn set_npages(&self, npages: usize) {
        self.npages.store(npages, Ordering::Relaxed);
    }

    /// Bytes covered by the span.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.npages() << PAGE_SHIFT
    }

    #[inline]
    pub fn state(&self) -> SpanState {
        SpanState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SpanState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn size_class(&self) -> usize {
        self.size_class.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size.load(Ordering::Relaxed)
    }

    /// End of the last object in the span.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Records the class layout of a span that now holds objects.
    pub(crate) fn set_layout(&self, size_class: usize, elem_size: usize) {
        #[allow(clippy::cast_possible_truncation)]
        self.size_class.store(size_class as u8, Ordering::Relaxed);
        self.elem_size.store(elem_size, Ordering::Relaxed);
    }

    /// Number of objects the span is carved into.
    #[inline]
    pub fn nelems(&self) -> usize {
        match self.elem_size() {
            0 => 0,
            size => self.bytes() / size,
        }
    }

    /// Address of object `index`.
    #[inline]
    pub fn object_addr(&self, index: usize) -> usize {
        self.start() + index * self.elem_size()
    }

    /// Index of the object containing `addr`.
    #[inline]
    pub fn object_index(&self, addr: usize) -> usize {
        (addr - self.start()) / self.elem_size()
    }

    pub(crate) fn list_kind(&self) -> ListKind {
        ListKind::from_u8(self.list.load(Ordering::Relaxed))
    }

    /// Pops the first object off the free list.
    ///
    /// Only the owner of the free list (the caching thread) may call this.
    pub(crate) fn pop_free(&self) -> Option<usize> {
        let head = self.free_list.load(Ordering::Relaxed);
        if head == 0 {
            return None;
        }
        let addr = self.object_addr(head - 1);
        // SAFETY: free objects are committed heap memory owned by this span;
        // their first word holds the next link.
        let next = unsafe { (addr as *const usize).read() };
        if next > self.nelems() {
            throw(FatalKind::InvariantViolation, "free list corrupted");
        }
        self.free_list.store(next, Ordering::Relaxed);
        self.ref_count.fetch_add(1, Ordering::Relaxed);
        Some(addr)
    }

    /// Free object addresses, validating every link.
    pub(crate) fn free_objects(&self) -> FreeObjects<'_> {
        FreeObjects {
            span: self,
            next: self.free_list.load(Ordering::Relaxed),
            steps: 0,
        }
    }
}

/// Iterator over a span's free list.
pub(crate) struct FreeObjects<'a> {
    span: &'a Span,
    next: usize,
    steps: usize,
}

impl Iterator for FreeObjects<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == 0 {
            return None;
        }
        let n = self.span.nelems();
        if self.next > n || self.steps >= n {
            throw(FatalKind::InvariantViolation, "free list corrupted");
        }
        self.steps += 1;
        let addr = self.span.object_addr(self.next - 1);
        // SAFETY: see `Span::pop_free`.
        self.next = unsafe { (addr as *const usize).read() };
        Some(addr)
    }
}

// ============================================================================
// Span lists
// ============================================================================

/// Intrusive doubly linked list of spans. The owning lock serialises all
/// mutation.
#[derive(Debug)]
pub struct SpanList {
    head: Option<SpanId>,
    tail: Option<SpanId>,
    len: usize,
    kind: ListKind,
}

impl SpanList {
    pub(crate) const fn new(kind: ListKind) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            kind,
        }
    }

    pub const fn first(&self) -> Option<SpanId> {
        self.head
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_front(&mut self, pool: &SpanPool, id: SpanId) {
        let span = pool.get(id);
        self.check_unlinked(span);
        span.prev.store(SpanId::NIL, Ordering::Relaxed);
        span.next.store(SpanId::raw(self.head), Ordering::Relaxed);
        match self.head {
            Some(h) => pool.get(h).prev.store(id.0, Ordering::Relaxed),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        span.list.store(self.kind as u8, Ordering::Relaxed);
        self.len += 1;
    }

    pub fn push_back(&mut self, pool: &SpanPool, id: SpanId) {
        let span = pool.get(id);
        self.check_unlinked(span);
        span.next.store(SpanId::NIL, Ordering::Relaxed);
        span.prev.store(SpanId::raw(self.tail), Ordering::Relaxed);
        match self.tail {
            Some(t) => pool.get(t).next.store(id.0, Ordering::Relaxed),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        span.list.store(self.kind as u8, Ordering::Relaxed);
        self.len += 1;
    }

    pub fn remove(&mut self, pool: &SpanPool, id: SpanId) {
        let span = pool.get(id);
        if span.list_kind() != self.kind {
            throw(FatalKind::InvariantViolation, "span removed from a list it is not on");
        }
        let prev = SpanId::from_raw(span.prev.load(Ordering::Relaxed));
        let next = SpanId::from_raw(span.next.load(Ordering::Relaxed));
        match prev {
            Some(p) => pool.get(p).next.store(SpanId::raw(next), Ordering::Relaxed),
            None => self.head = next,
        }
        match next {
            Some(n) => pool.get(n).prev.store(SpanId::raw(prev), Ordering::Relaxed),
            None => self.tail = prev,
        }
        span.next.store(SpanId::NIL, Ordering::Relaxed);
        span.prev.store(SpanId::NIL, Ordering::Relaxed);
        span.list.store(ListKind::Unlinked as u8, Ordering::Relaxed);
        self.len -= 1;
    }

    /// Span after `id` on this list.
    pub fn next_of(pool: &SpanPool, id: SpanId) -> Option<SpanId> {
        SpanId::from_raw(pool.get(id).next.load(Ordering::Relaxed))
    }

    pub fn iter<'a>(&self, pool: &'a SpanPool) -> impl Iterator<Item = SpanId> + 'a {
        std::iter::successors(self.head, move |&id| Self::next_of(pool, id))
    }

    fn check_unlinked(&self, span: &Span) {
        if span.list_kind() != ListKind::Unlinked {
            throw(FatalKind::InvariantViolation, "span is already on a list");
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Fixed pool of span records plus the page-to-span map.
pub struct SpanPool {
    spans: Box<[Span]>,
    /// Arena page index to span id, `SpanId::NIL` when unmapped.
    by_page: Box<[AtomicU32]>,
    /// Records handed out at least once.
    high_water: AtomicU32,
}

impl SpanPool {
    pub fn new(pages: usize) -> Self {
        // A span covers at least one page, plus one record for a trim split.
        let spans = (0..=pages).map(|_| Span::new()).collect();
        let by_page = (0..pages).map(|_| AtomicU32::new(SpanId::NIL)).collect();
        Self {
            spans,
            by_page,
            high_water: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn get(&self, id: SpanId) -> &Span {
        &self.spans[id.index()]
    }

    /// Takes a record from `free_ids` or the untouched tail of the pool.
    /// Called with the page heap lock held.
    pub fn alloc_id(&self, free_ids: &mut Vec<SpanId>) -> SpanId {
        if let Some(id) = free_ids.pop() {
            return id;
        }
        let next = self.high_water.load(Ordering::Relaxed);
        if next as usize >= self.spans.len() {
            throw(FatalKind::OutOfMemory, "span pool exhausted");
        }
        self.high_water.store(next + 1, Ordering::Release);
        SpanId(next)
    }

    /// Records in use or used before; the sweeper's iteration bound.
    pub fn high_water(&self) -> u32 {
        self.high_water.load(Ordering::Acquire)
    }

    /// Span id at pool index `i`.
    pub fn id_at(&self, i: u32) -> SpanId {
        SpanId(i)
    }

    #[inline]
    pub fn span_at_page(&self, page: usize) -> Option<SpanId> {
        self.by_page
            .get(page)
            .and_then(|slot| SpanId::from_raw(slot.load(Ordering::Acquire)))
    }

    #[inline]
    pub fn set_page(&self, page: usize, id: SpanId) {
        self.by_page[page].store(id.0, Ordering::Release);
    }

    pub fn page_count(&self) -> usize {
        self.by_page.len()
    }
}

impl std::fmt::Debug for SpanPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanPool")
            .field("capacity", &self.spans.len())
            .field("high_water", &self.high_water())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(n: usize) -> (SpanPool, Vec<SpanId>) {
        let pool = SpanPool::new(n);
        let mut free = Vec::new();
        let ids = (0..n).map(|_| pool.alloc_id(&mut free)).collect();
        (pool, ids)
    }

    #[test]
    fn test_list_push_and_remove() {
        let (pool, ids) = pool_with(4);
        let mut list = SpanList::new(ListKind::HeapFree);
        list.push_back(&pool, ids[0]);
        list.push_back(&pool, ids[1]);
        list.push_front(&pool, ids[2]);
        assert_eq!(list.iter(&pool).collect::<Vec<_>>(), vec![ids[2], ids[0], ids[1]]);

        list.remove(&pool, ids[0]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter(&pool).collect::<Vec<_>>(), vec![ids[2], ids[1]]);
        assert_eq!(pool.get(ids[0]).list_kind(), ListKind::Unlinked);

        list.remove(&pool, ids[2]);
        list.remove(&pool, ids[1]);
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
    }

    #[test]
    #[should_panic(expected = "span is already on a list")]
    fn test_double_insert_is_fatal() {
        let (pool, ids) = pool_with(1);
        let mut a = SpanList::new(ListKind::HeapFree);
        let mut b = SpanList::new(ListKind::HeapBusy);
        a.push_back(&pool, ids[0]);
        b.push_back(&pool, ids[0]);
    }

    #[test]
    fn test_ids_are_recycled() {
        let pool = SpanPool::new(2);
        let mut free = Vec::new();
        let a = pool.alloc_id(&mut free);
        free.push(a);
        assert_eq!(pool.alloc_id(&mut free), a);
        assert_eq!(pool.high_water(), 1);
    }

    #[test]
    fn test_page_map() {
        let (pool, ids) = pool_with(3);
        assert_eq!(pool.span_at_page(1), None);
        pool.set_page(1, ids[2]);
        assert_eq!(pool.span_at_page(1), Some(ids[2]));
        assert_eq!(pool.span_at_page(10), None);
    }

    #[test]
    fn test_free_list_walk() {
        let mut words = vec![0usize; 4];
        let span = Span::new();
        span.init(words.as_mut_ptr() as usize, 1);
        span.set_layout(1, 8);
        // Chain objects 2 -> 0 -> end.
        words[2] = 1;
        words[0] = 0;
        span.free_list.store(3, Ordering::Relaxed);
        let addrs: Vec<_> = span.free_objects().collect();
        assert_eq!(addrs, vec![span.object_addr(2), span.object_addr(0)]);
        assert_eq!(span.pop_free(), Some(span.object_addr(2)));
        assert_eq!(span.ref_count.load(Ordering::Relaxed), 1);
    }
}
