//! Worker handles and their roots.
//!
//! A [`Worker`] is one mutator thread's view of a heap: its thread cache,
//! its gray object buffer and its shadow stack of root slots. The collector
//! reaches a worker's state through the heap's registry and stops the world
//! by taking every worker's local lock.
//!
//! Roots held only in ordinary Rust locals are invisible to the collector;
//! anything that must survive a collection goes into a root slot, a global
//! slot, or a heap object reachable from one. The one exception is the
//! worker's most recent allocation: it stays live until the worker reaches
//! its next safepoint (any root operation, another allocation, or an
//! explicit [`Worker::safepoint`]), so it can be stored somewhere first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::fatal::{throw, FatalKind};
use crate::gc::sync::{LockOrder, OrderedMutex};
use crate::gc::work::GcWork;
use crate::heap::cache::ThreadCache;
use crate::heap::Heap;

/// State only the owning worker and a stopped-world collector touch.
#[derive(Debug)]
pub(crate) struct WorkerLocal {
    pub(crate) cache: ThreadCache,
    pub(crate) gcw: GcWork,
    /// Bytes allocated during this cycle's mark phase.
    pub(crate) assist_alloc: u64,
    /// Scan work done or stolen by this worker's assists this cycle.
    pub(crate) assist_scan_work: i64,
}

impl WorkerLocal {
    const fn new() -> Self {
        Self {
            cache: ThreadCache::new(),
            gcw: GcWork::new(),
            assist_alloc: 0,
            assist_scan_work: 0,
        }
    }
}

/// Root slots standing in for a worker's execution stack.
///
/// Slots are read concurrently by the collector; every mutation happens
/// with the worker's local lock held.
#[derive(Debug)]
pub(crate) struct ShadowStack {
    slots: Box<[AtomicUsize]>,
    len: AtomicUsize,
    /// Slots below this index were scanned at cycle start and not written
    /// since. Mark termination rescans from here.
    rescan_from: AtomicUsize,
    /// Last object allocated since the worker's previous safepoint, 0 if
    /// none.
    fresh: AtomicUsize,
}

impl ShadowStack {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            len: AtomicUsize::new(0),
            rescan_from: AtomicUsize::new(0),
            fresh: AtomicUsize::new(0),
        }
    }

    /// Pushes `value` and returns its slot. The local lock is held.
    pub(crate) fn push(&self, value: usize) -> usize {
        let i = self.len();
        if i >= self.slots.len() {
            throw(FatalKind::OutOfMemory, "shadow stack overflow");
        }
        self.slots[i].store(value, Ordering::Release);
        self.len.store(i + 1, Ordering::Release);
        i
    }

    /// The unrooted allocation the collector must still treat as live.
    pub(crate) fn fresh(&self) -> usize {
        self.fresh.load(Ordering::Acquire)
    }

    pub(crate) fn set_fresh(&self, obj: usize) {
        self.fresh.store(obj, Ordering::Release);
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self, i: usize) -> usize {
        self.slots[i].load(Ordering::Acquire)
    }

    pub(crate) fn rescan_from(&self) -> usize {
        self.rescan_from.load(Ordering::Acquire)
    }

    pub(crate) fn set_rescan_from(&self, i: usize) {
        self.rescan_from.store(i, Ordering::Release);
    }

    pub(crate) fn lower_rescan_from(&self, i: usize) {
        self.rescan_from.fetch_min(i, Ordering::AcqRel);
    }

    /// Slot index of `addr`, if it lies inside the slot array.
    pub(crate) fn slot_of(&self, addr: usize) -> Option<usize> {
        let base = self.slots.as_ptr() as usize;
        let end = base + self.slots.len() * std::mem::size_of::<AtomicUsize>();
        (base..end)
            .contains(&addr)
            .then(|| (addr - base) / std::mem::size_of::<AtomicUsize>())
    }

    fn slot_ptr(&self, i: usize) -> *mut usize {
        self.slots[i].as_ptr()
    }
}

/// The part of a worker the heap's registry holds on to.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    pub(crate) id: usize,
    pub(crate) local: OrderedMutex<WorkerLocal>,
    pub(crate) stack: ShadowStack,
}

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(1);

/// A mutator's handle on a heap.
///
/// Obtained from [`Heap::register_worker`]. Dropping it hands its cached
/// spans and gray objects back and unregisters it.
#[derive(Debug)]
pub struct Worker {
    pub(crate) heap: Arc<Heap>,
    pub(crate) shared: Arc<WorkerShared>,
}

impl Heap {
    /// Registers a new worker.
    pub fn register_worker(self: &Arc<Self>) -> Worker {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let mut local = WorkerLocal::new();
        local.cache.seed_sampler(id as u64, self.profile.rate());
        let shared = Arc::new(WorkerShared {
            id,
            local: OrderedMutex::new(LockOrder::WorkerLocal, local),
            stack: ShadowStack::new(self.config.stack_slots),
        });
        self.registry.lock().push(Arc::clone(&shared));
        Worker {
            heap: Arc::clone(self),
            shared,
        }
    }

    /// Registered workers.
    pub fn worker_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Value of global root slot `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    pub fn global(&self, i: usize) -> usize {
        self.globals[i].load(Ordering::Acquire)
    }
}

impl Worker {
    /// Heap this worker allocates from.
    pub const fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Unique id of this worker.
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Pushes a root and returns its slot index.
    ///
    /// # Panics
    ///
    /// Panics when the shadow stack is full.
    pub fn push_root(&self, value: usize) -> usize {
        let _local = self.shared.local.lock();
        let stack = &self.shared.stack;
        let i = stack.push(value);
        stack.set_fresh(0);
        i
    }

    /// Pops the top root.
    ///
    /// # Panics
    ///
    /// Panics when the shadow stack is empty.
    pub fn pop_root(&self) -> usize {
        let _local = self.shared.local.lock();
        let stack = &self.shared.stack;
        let Some(i) = stack.len().checked_sub(1) else {
            throw(FatalKind::Misuse, "shadow stack underflow");
        };
        let value = stack.slots[i].swap(0, Ordering::AcqRel);
        stack.len.store(i, Ordering::Release);
        stack.lower_rescan_from(i);
        stack.set_fresh(0);
        value
    }

    /// Overwrites root slot `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below [`roots_len`](Self::roots_len).
    pub fn set_root(&self, i: usize, value: usize) {
        let _local = self.shared.local.lock();
        let stack = &self.shared.stack;
        if i >= stack.len() {
            throw(FatalKind::Misuse, "root slot out of range");
        }
        stack.slots[i].store(value, Ordering::Release);
        stack.lower_rescan_from(i);
        stack.set_fresh(0);
    }

    /// Value of root slot `i`.
    pub fn root(&self, i: usize) -> usize {
        if i >= self.shared.stack.len() {
            throw(FatalKind::Misuse, "root slot out of range");
        }
        self.shared.stack.get(i)
    }

    /// Number of roots on the shadow stack.
    pub fn roots_len(&self) -> usize {
        self.shared.stack.len()
    }

    /// Drops every root above `len`.
    pub fn truncate_roots(&self, len: usize) {
        let _local = self.shared.local.lock();
        let stack = &self.shared.stack;
        stack.set_fresh(0);
        let old = stack.len();
        if len >= old {
            return;
        }
        for slot in &stack.slots[len..old] {
            slot.store(0, Ordering::Release);
        }
        stack.len.store(len, Ordering::Release);
        stack.lower_rescan_from(len);
    }

    /// Address of root slot `i`, for bulk copies into the shadow stack.
    ///
    /// # Panics
    ///
    /// Panics if `i` is beyond the stack capacity.
    pub fn root_slot_ptr(&self, i: usize) -> *mut usize {
        self.shared.stack.slot_ptr(i)
    }

    /// Stores `value` into global root slot `i` through the write barrier.
    pub fn set_global(&self, i: usize, value: usize) {
        let Some(slot) = self.heap.globals.get(i) else {
            throw(FatalKind::Misuse, "global slot out of range");
        };
        check_pointer(value);
        let mut local = self.shared.local.lock();
        if self.heap.gc.write_barrier_enabled() {
            self.heap.shade(value, &mut local.gcw);
        }
        slot.store(value, Ordering::Release);
        self.shared.stack.set_fresh(0);
    }

    /// Stops protecting the most recent allocation. Every root operation
    /// does this implicitly.
    pub fn safepoint(&self) {
        let _local = self.shared.local.lock();
        self.shared.stack.set_fresh(0);
    }

    /// Bytes allocated by this worker during the current mark phase.
    pub fn assist_debt_bytes(&self) -> u64 {
        self.shared.local.lock().assist_alloc
    }
}

/// Rejects small non-null integers masquerading as pointers.
#[inline]
pub(crate) fn check_pointer(value: usize) {
    if value != 0 && value < 4096 {
        throw(FatalKind::Misuse, "bad pointer in write barrier");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        {
            let mut local = self.shared.local.lock();
            let local = &mut *local;
            local.cache.release_all(&self.heap);
            local.gcw.dispose(&self.heap.gc.work);
            self.shared.stack.set_fresh(0);
        }
        let mut registry = self.heap.registry.lock();
        registry.retain(|w| !Arc::ptr_eq(w, &self.shared));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    fn heap() -> Arc<Heap> {
        Heap::new(HeapConfig::default().arena_size(8 << 20).stack_slots(8).gc_percent(None))
    }

    #[test]
    fn test_register_and_drop() {
        let heap = heap();
        let a = heap.register_worker();
        let b = heap.register_worker();
        assert_ne!(a.id(), b.id());
        assert_eq!(heap.worker_count(), 2);
        drop(a);
        assert_eq!(heap.worker_count(), 1);
    }

    #[test]
    fn test_shadow_stack_ops() {
        let heap = heap();
        let w = heap.register_worker();
        assert_eq!(w.push_root(0x1000_0000), 0);
        assert_eq!(w.push_root(0x2000_0000), 1);
        w.set_root(0, 0x3000_0000);
        assert_eq!(w.root(0), 0x3000_0000);
        assert_eq!(w.pop_root(), 0x2000_0000);
        assert_eq!(w.roots_len(), 1);
        w.truncate_roots(0);
        assert_eq!(w.roots_len(), 0);
    }

    #[test]
    fn test_writes_lower_rescan_watermark() {
        let heap = heap();
        let w = heap.register_worker();
        for i in 0..4 {
            w.push_root(0x1000 * (i + 1));
        }
        w.shared.stack.set_rescan_from(4);
        w.set_root(2, 0);
        assert_eq!(w.shared.stack.rescan_from(), 2);
        w.truncate_roots(1);
        assert_eq!(w.shared.stack.rescan_from(), 1);
    }

    #[test]
    fn test_slot_of() {
        let heap = heap();
        let w = heap.register_worker();
        let p = w.root_slot_ptr(3) as usize;
        assert_eq!(w.shared.stack.slot_of(p), Some(3));
        assert_eq!(w.shared.stack.slot_of(p + 5 * 8 * 100), None);
    }

    #[test]
    fn test_root_operations_clear_the_fresh_object() {
        let heap = heap();
        let w = heap.register_worker();
        w.shared.stack.set_fresh(0x5000_0000);
        w.push_root(0);
        assert_eq!(w.shared.stack.fresh(), 0);

        w.shared.stack.set_fresh(0x5000_0000);
        w.set_root(0, 0x6000_0000);
        assert_eq!(w.shared.stack.fresh(), 0);

        w.shared.stack.set_fresh(0x5000_0000);
        w.truncate_roots(4);
        assert_eq!(w.shared.stack.fresh(), 0, "even when nothing is truncated");

        w.shared.stack.set_fresh(0x5000_0000);
        w.safepoint();
        assert_eq!(w.shared.stack.fresh(), 0);
    }

    #[test]
    #[should_panic(expected = "shadow stack overflow")]
    fn test_stack_overflow_is_fatal() {
        let heap = heap();
        let w = heap.register_worker();
        for _ in 0..9 {
            w.push_root(0);
        }
    }

    #[test]
    #[should_panic(expected = "bad pointer in write barrier")]
    fn test_small_integer_global_is_fatal() {
        let heap = heap();
        let w = heap.register_worker();
        w.set_global(0, 12);
    }
}
