//! The allocation entry points.
//!
//! Three tiers, picked by size and pointer-freeness:
//!
//! * tiny: pointer-free requests under 16 bytes are packed into a shared
//!   16-byte block owned by the worker's cache,
//! * small: up to 32 KiB, popped from the cached span of the size class,
//! * large: whole pages straight from the page heap.
//!
//! After allocating, the worker may start a cycle (heap over its goal) or
//! pay mark-assist debt (a cycle is marking).

use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

use crate::fatal::{throw, FatalKind};
use crate::gc::GcPhase;
use crate::heap::bitmap::{clear_range, set_type};
use crate::heap::Heap;
use crate::sizeclass::{table, MAX_SMALL_SIZE, PAGE_MASK, PAGE_SHIFT, PTR_SIZE, TINY_SIZE, TINY_SIZE_CLASS};
use crate::typeinfo::{AllocFlags, TypeDescriptor};
use crate::worker::{Worker, WorkerLocal};

/// Address handed out for every zero-byte allocation.
static ZERO_BASE: usize = 0;

pub(crate) fn zero_base() -> usize {
    std::ptr::addr_of!(ZERO_BASE) as usize
}

impl Heap {
    /// Allocates with the worker's local state locked. Returns the object
    /// and whether the caller should try to start a cycle once the lock is
    /// released.
    pub(crate) fn malloc(
        &self,
        local: &mut WorkerLocal,
        size: usize,
        typ: Option<&TypeDescriptor>,
        flags: AllocFlags,
    ) -> (usize, bool) {
        let phase = self.gc.phase();
        if phase == GcPhase::MarkTermination {
            throw(FatalKind::Misuse, "malloc during mark termination");
        }
        if size == 0 {
            return (zero_base(), false);
        }
        if typ.is_none() && !flags.contains(AllocFlags::NO_SCAN) {
            throw(FatalKind::Misuse, "malloc missing type");
        }
        let scan_type = typ.filter(|t| t.has_pointers() && !flags.contains(AllocFlags::NO_SCAN));
        let noscan = scan_type.is_none();
        // Pointer memory is always zeroed.
        let needzero = !flags.contains(AllocFlags::NO_ZERO) || !noscan;

        let data_size = size;
        let mut should_help = false;
        let cache = &mut local.cache;
        let (x, size) = if size <= MAX_SMALL_SIZE {
            if noscan && size < TINY_SIZE {
                let mut off = cache.tiny_offset;
                if size & 7 == 0 {
                    off = off.next_multiple_of(8);
                } else if size & 3 == 0 {
                    off = off.next_multiple_of(4);
                } else if size & 1 == 0 {
                    off = off.next_multiple_of(2);
                }
                if off + size <= TINY_SIZE && cache.tiny != 0 {
                    cache.tiny_offset = off + size;
                    cache.local_tinyallocs += 1;
                    return (cache.tiny + off, false);
                }

                let x = match cache.next_free(self, TINY_SIZE_CLASS) {
                    Some(x) => x,
                    None => {
                        cache.refill(self, TINY_SIZE_CLASS);
                        should_help = true;
                        self.expect_free(cache.next_free(self, TINY_SIZE_CLASS))
                    }
                };
                // SAFETY: `x` is a fresh TINY_SIZE object of a span this cache owns.
                unsafe { std::ptr::write_bytes(x as *mut u8, 0, TINY_SIZE) };
                // Keep whichever block has more room left.
                if size < cache.tiny_offset || cache.tiny == 0 {
                    cache.tiny = x;
                    cache.tiny_offset = size;
                }
                cache.local_nsmallalloc[TINY_SIZE_CLASS] += 1;
                cache.local_cachealloc += TINY_SIZE as u64;
                (x, TINY_SIZE)
            } else {
                let class = table().size_to_class(size);
                let size = table().class_size(class);
                let x = match cache.next_free(self, class) {
                    Some(x) => x,
                    None => {
                        cache.refill(self, class);
                        should_help = true;
                        self.expect_free(cache.next_free(self, class))
                    }
                };
                if needzero {
                    // SAFETY: `x` is a fresh object of `size` bytes. Word 0 held
                    // the free-list link; word 1 is zero unless the sweeper
                    // found garbage in the object.
                    unsafe {
                        (x as *mut usize).write(0);
                        if size > 2 * PTR_SIZE && ((x + PTR_SIZE) as *const usize).read() != 0 {
                            std::ptr::write_bytes(x as *mut u8, 0, size);
                        }
                    }
                }
                cache.local_nsmallalloc[class] += 1;
                cache.local_cachealloc += size as u64;
                (x, size)
            }
        } else {
            should_help = true;
            let Some(rounded) = size.checked_add(PAGE_MASK) else {
                throw(FatalKind::OutOfMemory, "out of memory");
            };
            let npages = rounded >> PAGE_SHIFT;
            self.deduct_sweep_credit(npages << PAGE_SHIFT, npages);
            let Some(id) = self.alloc_span(npages, 0, true, needzero) else {
                throw(FatalKind::OutOfMemory, "out of memory");
            };
            let s = self.spans.get(id);
            s.set_limit(s.start() + size);
            clear_range(&self.arena, s.start(), s.bytes());
            cache.local_nlargealloc += 1;
            cache.local_largealloc += s.bytes() as u64;
            (s.start(), s.bytes())
        };

        if let Some(typ) = scan_type {
            set_type(&self.arena, x, size, data_size, typ);
            let scannable = if data_size > typ.size() {
                data_size - typ.size() + typ.ptr_data()
            } else {
                typ.ptr_data()
            };
            local.cache.local_scan += scannable as u64;
        }
        // Zeroing and type bits must be visible before the pointer is.
        fence(Ordering::Release);

        if phase == GcPhase::Mark {
            self.mark_new_object(x, size);
        }
        self.sample_allocation(&mut local.cache, x, size);

        let trigger = should_help && self.should_trigger();
        if !trigger && self.gc.blacken_enabled() {
            self.assist_alloc(local, size, should_help);
        }
        (x, trigger)
    }

    fn expect_free(&self, x: Option<usize>) -> usize {
        x.unwrap_or_else(|| throw(FatalKind::InvariantViolation, "freelist empty after refill"))
    }

    /// The heap has outgrown its trigger and no cycle is underway.
    pub(crate) fn should_trigger(&self) -> bool {
        self.gc.phase() == GcPhase::Off
            && !self.gc.running.load(Ordering::Acquire)
            && self.stats.heap_live.load(Ordering::Relaxed) >= self.stats.next_gc.load(Ordering::Relaxed)
    }
}

impl Worker {
    /// Allocates `size` bytes.
    ///
    /// `typ` describes the pointer words; it may be `None` only with
    /// [`AllocFlags::NO_SCAN`]. A type allocated with `size` larger than
    /// `typ.size()` is an array of that type. Memory is zeroed unless
    /// `NO_ZERO` is given for pointer-free memory.
    ///
    /// # Panics
    ///
    /// Panics when the heap is exhausted, during mark termination, or when
    /// a pointer-bearing allocation has no type.
    pub fn allocate(&self, size: usize, typ: Option<&TypeDescriptor>, flags: AllocFlags) -> NonNull<u8> {
        let (x, trigger) = {
            let mut local = self.shared.local.lock();
            let (x, trigger) = self.heap.malloc(&mut local, size, typ, flags);
            // Live until the next safepoint, even across an inline cycle.
            self.shared.stack.set_fresh(x);
            (x, trigger)
        };
        if trigger {
            self.heap.trigger_cycle();
        }
        non_null(x)
    }

    /// Allocates like [`allocate`](Self::allocate) and pushes the object
    /// onto the shadow stack before any collection can observe it. Returns
    /// the object and its root slot.
    ///
    /// # Panics
    ///
    /// Panics like `allocate`, and when the shadow stack is full.
    pub fn allocate_rooted(
        &self,
        size: usize,
        typ: Option<&TypeDescriptor>,
        flags: AllocFlags,
    ) -> (NonNull<u8>, usize) {
        let (x, slot, trigger) = {
            let mut local = self.shared.local.lock();
            let (x, trigger) = self.heap.malloc(&mut local, size, typ, flags);
            let stack = &self.shared.stack;
            let slot = stack.push(x);
            stack.set_fresh(0);
            (x, slot, trigger)
        };
        if trigger {
            self.heap.trigger_cycle();
        }
        (non_null(x), slot)
    }

    /// Allocates one zeroed instance of `typ`.
    pub fn new_object(&self, typ: &TypeDescriptor) -> NonNull<u8> {
        self.allocate(typ.size(), Some(typ), scan_flags(typ))
    }

    /// Allocates a zeroed array of `n` instances of `typ`.
    ///
    /// # Panics
    ///
    /// Panics if the array size overflows.
    pub fn new_array(&self, typ: &TypeDescriptor, n: usize) -> NonNull<u8> {
        let Some(size) = typ.size().checked_mul(n) else {
            throw(FatalKind::OutOfMemory, "array size overflows");
        };
        self.allocate(size, Some(typ), scan_flags(typ))
    }

    /// Allocates one zeroed instance of `typ` straight into a new root
    /// slot. Returns the object and the slot.
    pub fn new_object_rooted(&self, typ: &TypeDescriptor) -> (NonNull<u8>, usize) {
        self.allocate_rooted(typ.size(), Some(typ), scan_flags(typ))
    }

    /// Allocates `size` bytes of pointer-free memory, left uninitialised.
    pub fn alloc_bytes(&self, size: usize) -> NonNull<u8> {
        self.allocate(size, None, AllocFlags::NO_SCAN | AllocFlags::NO_ZERO)
    }
}

fn non_null(x: usize) -> NonNull<u8> {
    NonNull::new(x as *mut u8).unwrap_or_else(|| throw(FatalKind::InvariantViolation, "malloc returned null"))
}

fn scan_flags(typ: &TypeDescriptor) -> AllocFlags {
    if typ.has_pointers() {
        AllocFlags::empty()
    } else {
        AllocFlags::NO_SCAN
    }
}
