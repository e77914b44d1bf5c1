//! A span-based tiered allocator with a concurrent mark-sweep collector.
//!
//! `spangc` manages one contiguous arena per [`Heap`]. Memory is handed out
//! in three tiers:
//!
//! - **tiny**: pointer-free objects under 16 bytes share 16-byte blocks,
//! - **small**: up to 32 KiB, rounded to one of 66 size classes and carved
//!   from page-multiple spans cached per worker,
//! - **large**: whole pages taken straight from the page heap.
//!
//! A per-word heap bitmap records which words hold pointers and which
//! objects are marked. Collection is a non-moving, non-generational
//! tri-color mark-sweep: roots are scanned with the world stopped, marking
//! runs concurrently behind a Dijkstra-style write barrier, and allocating
//! workers pay for marking in proportion to what they allocate. Sweeping
//! is lazy: spans are swept on demand, in proportion to allocation, and by
//! the optional background collector thread.
//!
//! # Quick Start
//!
//! ```
//! use spangc::{Heap, HeapConfig, TypeDescriptor};
//!
//! let heap = Heap::new(HeapConfig::default().arena_size(16 << 20));
//! let worker = heap.register_worker();
//!
//! // A two-word node whose first word points to the next node.
//! let node = TypeDescriptor::from_pointer_words(16, &[0]);
//! let head = worker.new_object(&node).as_ptr() as usize;
//! let tail = worker.new_object(&node).as_ptr() as usize;
//! // SAFETY: `head` is a live node; its first word is a pointer slot.
//! unsafe { worker.write_pointer(head as *mut usize, tail) };
//!
//! // Only rooted objects survive.
//! worker.push_root(head);
//! heap.collect();
//! assert_eq!(heap.mem_stats().heap_marked, 32);
//! ```
//!
//! # Roots
//!
//! The collector does not scan native stacks. Pointers held across an
//! allocation or a collection must live in a worker's shadow stack
//! ([`Worker::push_root`]), a global slot ([`Worker::set_global`]) or a
//! heap object reachable from one of them.
//!
//! A worker's most recent allocation is treated as live until the worker's
//! next safepoint: another allocation, any root operation, or
//! [`Worker::safepoint`]. That covers the gap between allocating an object
//! and storing it. [`Worker::allocate_rooted`] closes the gap entirely by
//! pushing the object while the allocation still holds the worker's lock.
//!
//! # Fatal errors
//!
//! Heap corruption, exhaustion and contract violations are not reported as
//! `Result`s; they end in [`fatal::throw`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod barrier;
pub mod config;
pub mod fatal;
pub mod gc;
pub mod gcprog;
pub mod heap;
mod malloc;
pub mod metrics;
pub mod profile;
pub mod sizeclass;
pub mod tracing;
pub mod typeinfo;
mod worker;

pub use config::HeapConfig;
pub use fatal::FatalKind;
pub use gc::{CollectMode, GcPhase};
pub use heap::{Finalizer, Heap, HeapBits, SpanId, SpanInfo, SpanState};
pub use metrics::{CycleMetrics, GlobalMetrics, MemStats};
pub use profile::MemProfileRecord;
pub use sizeclass::round_up_size;
pub use tracing::GcId;
pub use typeinfo::{AllocFlags, PointerLayout, TypeDescriptor};
pub use worker::Worker;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use std::sync::Arc;

    use crate::{Heap, HeapConfig, TypeDescriptor, Worker};

    /// A heap with automatic collection off.
    #[must_use]
    pub fn quiet_heap(arena_size: usize) -> Arc<Heap> {
        Heap::new(HeapConfig::default().arena_size(arena_size).gc_percent(None))
    }

    /// Layout of the nodes built by [`build_list`]: a next pointer and a
    /// payload word.
    #[must_use]
    pub fn list_node() -> TypeDescriptor {
        TypeDescriptor::from_pointer_words(16, &[0])
    }

    /// Builds a singly linked list of `n` nodes and pushes its head on the
    /// worker's shadow stack. Returns the root slot holding the head.
    /// Each node's payload is its position.
    pub fn build_list(worker: &Worker, n: usize) -> usize {
        let node = list_node();
        // The partial list stays rooted while it grows.
        let slot = worker.push_root(0);
        for i in (0..n).rev() {
            let head = worker.root(slot);
            let p = worker.new_object(&node).as_ptr() as usize;
            // SAFETY: `p` is a fresh 16-byte node.
            unsafe {
                worker.write_pointer(p as *mut usize, head);
                ((p + 8) as *mut usize).write(i);
            }
            worker.set_root(slot, p);
        }
        slot
    }

    /// Pays the sweep debt of allocating `span_bytes` of spans, the way the
    /// central lists do before handing out a span.
    pub fn deduct_sweep_credit(heap: &Heap, span_bytes: usize) {
        heap.deduct_sweep_credit(span_bytes, 0);
    }

    /// In-use spans the current cycle has not swept yet.
    #[must_use]
    pub fn unswept_spans(heap: &Heap) -> usize {
        heap.unswept_spans()
    }

    /// Walks a list built by [`build_list`], checking each payload.
    ///
    /// # Panics
    ///
    /// Panics if a payload is out of sequence.
    #[must_use]
    pub fn list_len(head: usize) -> usize {
        let mut n = 0;
        let mut p = head;
        while p != 0 {
            // SAFETY: `p` is a live node of the list.
            let (next, payload) = unsafe { ((p as *const usize).read(), ((p + 8) as *const usize).read()) };
            assert_eq!(payload, n, "list payload out of sequence");
            n += 1;
            p = next;
        }
        n
    }
}
