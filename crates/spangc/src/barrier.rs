//! Write barriers.
//!
//! While a cycle marks, every pointer store into a heap object or a global
//! must shade the stored pointer, or an object reachable only from an
//! already-scanned object would be freed. Stores into a worker's own root
//! slots need no shading; they lower the slot's rescan watermark instead.
//!
//! Each barrier runs under the worker's local lock, so a store and its
//! shade are never split by a stop-the-world.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::fatal::{throw, FatalKind};
use crate::sizeclass::PTR_SIZE;
use crate::typeinfo::TypeDescriptor;
use crate::worker::{check_pointer, Worker, WorkerLocal};

impl Worker {
    /// Stores the pointer `value` into `*slot`.
    ///
    /// # Safety
    ///
    /// `slot` must be a valid, aligned word, either inside a live heap
    /// object or in memory the collector does not scan.
    ///
    /// # Panics
    ///
    /// Panics if `value` is a small non-null integer.
    pub unsafe fn write_pointer(&self, slot: *mut usize, value: usize) {
        check_pointer(value);
        let mut local = self.shared.local.lock();
        if self.heap.gc.write_barrier_enabled() && value != 0 {
            self.heap.shade(value, &mut local.gcw);
        }
        // SAFETY: the caller guarantees `slot` is a valid aligned word.
        unsafe { AtomicUsize::from_ptr(slot) }.store(value, Ordering::Release);
    }

    /// Runs the write barrier over `[dst, dst + len)` after its pointer
    /// words were written by other means.
    ///
    /// # Panics
    ///
    /// Panics if `dst` or `len` is not word aligned.
    pub fn bulk_write_barrier(&self, dst: usize, len: usize) {
        let mut local = self.shared.local.lock();
        self.bulk_barrier_locked(&mut local, dst, len);
    }

    fn bulk_barrier_locked(&self, local: &mut WorkerLocal, dst: usize, len: usize) {
        if (dst | len) & (PTR_SIZE - 1) != 0 {
            throw(FatalKind::Misuse, "bulk write barrier: unaligned arguments");
        }
        let heap = &self.heap;
        if !heap.gc.write_barrier_enabled() {
            return;
        }
        if !heap.contains(dst) {
            // A copy into our own root slots only needs those slots
            // rescanned.
            if let Some(slot) = self.shared.stack.slot_of(dst) {
                self.shared.stack.lower_rescan_from(slot);
            }
            return;
        }
        let mut hb = heap.heap_bits(dst);
        for i in (0..len).step_by(PTR_SIZE) {
            if i != 0 {
                hb = hb.next();
                if !hb.high_bit() {
                    break;
                }
            }
            if hb.is_pointer() {
                // SAFETY: `dst + i` is a word of a live heap object.
                let p = unsafe { AtomicUsize::from_ptr((dst + i) as *mut usize) }.load(Ordering::Acquire);
                if p != 0 {
                    heap.shade(p, &mut local.gcw);
                }
            }
        }
    }

    /// Copies one value of type `typ` from `src` to `dst`, running the
    /// write barrier if the type holds pointers.
    ///
    /// # Safety
    ///
    /// `src` and `dst` must be valid for `typ.size()` bytes, word aligned,
    /// and `dst` must be a live heap object, a global, or a root slot
    /// region of this worker.
    pub unsafe fn typed_memmove(&self, typ: &TypeDescriptor, dst: *mut u8, src: *const u8) {
        if dst.cast_const() == src {
            return;
        }
        let size = typ.size();
        let mut local = self.shared.local.lock();
        if size % PTR_SIZE == 0 && (dst as usize | src as usize) % PTR_SIZE == 0 {
            let words = size / PTR_SIZE;
            let copy_word = |i: usize| {
                // SAFETY: both ranges are valid and aligned for `words` words.
                unsafe {
                    let v = (src as *const usize).add(i).read();
                    AtomicUsize::from_ptr((dst as *mut usize).add(i)).store(v, Ordering::Release);
                }
            };
            if (dst as usize) < (src as usize) {
                (0..words).for_each(copy_word);
            } else {
                (0..words).rev().for_each(copy_word);
            }
        } else {
            // SAFETY: the caller guarantees both ranges are valid.
            unsafe { std::ptr::copy(src, dst, size) };
        }
        if !typ.has_pointers() {
            return;
        }
        self.bulk_barrier_locked(&mut local, dst as usize, size);
    }
}
