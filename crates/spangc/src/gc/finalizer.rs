//! Finalizers.
//!
//! A finalizer is a special record on its object. While the record exists
//! the collector scans what the object points to but not the object
//! itself, so the object can still die. When a sweep finds it dead, the
//! finalizer moves to the heap's queue and the object is kept for one more
//! cycle: the queue is a root until the finalizer has run.
//!
//! Queued finalizers run on whichever worker calls
//! [`Worker::run_finalizers`], and on the background collector thread when
//! there is one.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::work::GcWork;
use super::GcPhase;
use crate::fatal::{throw, FatalKind};
use crate::heap::special::SpecialRecord;
use crate::heap::{Finalizer, Heap};
use crate::sizeclass::{TINY_SIZE, TINY_SIZE_CLASS};
use crate::worker::Worker;

/// A finalizer whose object was found unreachable.
struct Queued {
    /// Address the finalizer was set on.
    p: usize,
    f: Finalizer,
}

/// Finalizers waiting to run, and counters.
pub(crate) struct FinalizerQueue {
    queue: Mutex<VecDeque<Queued>>,
    /// Finalizer records attached to objects.
    pub(crate) registered: AtomicUsize,
    pub(crate) ran: AtomicU64,
}

impl std::fmt::Debug for FinalizerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerQueue")
            .field("queued", &self.queue.lock().len())
            .field("registered", &self.registered)
            .field("ran", &self.ran)
            .finish()
    }
}

impl FinalizerQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            registered: AtomicUsize::new(0),
            ran: AtomicU64::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    fn pop(&self) -> Option<Queued> {
        self.queue.lock().pop_front()
    }
}

impl Heap {
    /// Queues finalizers a sweep took off dead objects.
    pub(crate) fn queue_finalizers(&self, dying: Vec<(usize, Finalizer)>) {
        if dying.is_empty() {
            return;
        }
        let n = dying.len();
        self.finq
            .queue
            .lock()
            .extend(dying.into_iter().map(|(p, f)| Queued { p, f }));
        self.finq.registered.fetch_sub(n, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_finalizers_queued(n);
    }

    /// Root scan of finalizers: queued objects are shaded, objects still
    /// carrying a finalizer only have their referents shaded.
    pub(crate) fn scan_finalizers(&self, gcw: &mut GcWork) {
        let queued: Vec<usize> = self.finq.queue.lock().iter().map(|q| q.p).collect();
        for p in queued {
            self.shade(p, gcw);
        }
        if self.finq.registered.load(Ordering::Relaxed) == 0 {
            return;
        }
        for (obj, size) in self.finalizer_objects() {
            self.scan_referents(obj, size, gcw);
        }
    }

    /// Finalizers waiting to run.
    pub fn pending_finalizers(&self) -> usize {
        self.finq.len()
    }

    /// Objects that carry a finalizer which has not been queued yet.
    pub fn registered_finalizers(&self) -> usize {
        self.finq.registered.load(Ordering::Relaxed)
    }

    /// Finalizers run so far.
    pub fn finalizers_run(&self) -> u64 {
        self.finq.ran.load(Ordering::Relaxed)
    }
}

impl Worker {
    /// Runs `f` once `obj` is found unreachable.
    ///
    /// The object is kept alive for the finalizer, which may store it
    /// somewhere reachable again; it is freed once unreachable after that.
    /// `obj` must be the start of an object, except for the pointer-free
    /// objects of the tiny class, which share blocks. Zero-sized
    /// allocations never run a finalizer.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a heap object, not at its start, or already
    /// has a finalizer.
    pub fn set_finalizer<F>(&self, obj: NonNull<u8>, f: F)
    where
        F: FnOnce(&Worker, NonNull<u8>) + Send + 'static,
    {
        let p = obj.as_ptr() as usize;
        if p == crate::malloc::zero_base() {
            return;
        }
        let heap = &self.heap;
        let mut local = self.shared.local.lock();
        let Some((base, span)) = heap.find_object(p) else {
            throw(FatalKind::Misuse, "set_finalizer: pointer not in allocated block");
        };
        if base != p {
            let tiny = span.size_class() == TINY_SIZE_CLASS
                && !heap.heap_bits(base).has_pointers(TINY_SIZE);
            if !tiny {
                throw(FatalKind::Misuse, "set_finalizer: pointer not at beginning of allocated block");
            }
        }
        let size = span.elem_size();
        heap.finq.registered.fetch_add(1, Ordering::Relaxed);
        if !heap.add_special(p, SpecialRecord::Finalizer(Box::new(f))) {
            heap.finq.registered.fetch_sub(1, Ordering::Relaxed);
            throw(FatalKind::Misuse, "set_finalizer: finalizer already set");
        }
        // The root scan may have passed already; what the object points to
        // must survive this cycle.
        if heap.gc.phase() == GcPhase::Mark {
            heap.scan_referents(base, size, &mut local.gcw);
        }
    }

    /// Removes the finalizer of `obj`. Returns whether there was one.
    pub fn clear_finalizer(&self, obj: NonNull<u8>) -> bool {
        let _local = self.shared.local.lock();
        let removed = self.heap.remove_finalizer(obj.as_ptr() as usize).is_some();
        if removed {
            self.heap.finq.registered.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Runs every queued finalizer on this worker. Returns how many ran.
    ///
    /// Each object sits in a root slot while its finalizer runs.
    pub fn run_finalizers(&self) -> usize {
        let mut n = 0;
        loop {
            let (q, slot) = {
                let _local = self.shared.local.lock();
                let Some(q) = self.heap.finq.pop() else {
                    break;
                };
                let stack = &self.shared.stack;
                let slot = stack.push(q.p);
                stack.set_fresh(0);
                (q, slot)
            };
            let Queued { p, f } = q;
            if let Some(obj) = NonNull::new(p as *mut u8) {
                f(self, obj);
            }
            self.truncate_roots(slot);
            self.heap.finq.ran.fetch_add(1, Ordering::Relaxed);
            n += 1;
        }
        n
    }
}
