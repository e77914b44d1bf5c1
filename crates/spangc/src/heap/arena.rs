//! The arena: one contiguous reservation the page heap carves pages from.
//!
//! The arena grows upward from `start`; everything below `used` is committed.
//! The heap bitmap lives in a second reservation whose bytes are indexed
//! backward from its end, one byte per four heap words, and is committed in
//! step with the arena.
//!
//! Every method that talks to the OS must be called without the page heap
//! lock; debug builds check this.

use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::Mmap;

use crate::gc::sync::{max_held_lock, LockOrder};
use crate::sizeclass::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PTR_SIZE};

/// Heap words described by one bitmap byte.
pub const WORDS_PER_BITMAP_BYTE: usize = 4;

/// Address hints tried before letting the OS pick. Addresses in this range
/// are unlikely to collide with integers stored in scalar words.
#[cfg(target_pointer_width = "64")]
fn arena_hints() -> impl Iterator<Item = usize> {
    (0..0x7fusize).map(|i| (i << 40) | (0x00c0 << 32))
}

#[cfg(not(target_pointer_width = "64"))]
fn arena_hints() -> impl Iterator<Item = usize> {
    std::iter::empty()
}

pub struct Arena {
    map: Mmap,
    bitmap: Mmap,
    start: usize,
    end: usize,
    used: AtomicUsize,
    /// Serialises growth. A leaf lock.
    grow_lock: Mutex<()>,
}

#[inline]
fn check_heap_unlocked() {
    debug_assert!(
        max_held_lock() != Some(LockOrder::PageHeap),
        "OS call with the page heap lock held"
    );
}

impl Arena {
    /// Reserves `size` bytes (rounded up to 64 KiB) of address space.
    pub fn reserve(size: usize) -> io::Result<Self> {
        let size = size.max(PAGE_SIZE).next_multiple_of(64 << 10);
        // One extra page so the start can be aligned to PAGE_SIZE.
        let reserve = size + PAGE_SIZE;
        let map = arena_hints()
            .find_map(|hint| sys_alloc::request_memory(hint, reserve))
            .or_else(|| sys_alloc::request_memory(0, reserve))
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "cannot reserve arena"))?;

        let bitmap_len = size / (PTR_SIZE * WORDS_PER_BITMAP_BYTE);
        let bitmap = sys_alloc::request_memory(0, bitmap_len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "cannot reserve heap bitmap"))?;

        let base = map.ptr() as usize;
        let start = (base + PAGE_MASK) & !PAGE_MASK;
        Ok(Self {
            map,
            bitmap,
            start,
            end: start + size,
            used: AtomicUsize::new(start),
            grow_lock: Mutex::new(()),
        })
    }

    #[inline]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// End of the committed region.
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Pages the arena can hold once fully grown.
    pub const fn total_pages(&self) -> usize {
        (self.end - self.start) >> PAGE_SHIFT
    }

    /// Bytes committed so far.
    pub fn committed(&self) -> usize {
        self.used() - self.start
    }

    /// `true` if `addr` lies in the committed part of the arena.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.used()
    }

    /// Arena page holding `addr`.
    #[inline]
    pub const fn page_index(&self, addr: usize) -> usize {
        (addr - self.start) >> PAGE_SHIFT
    }

    /// First address of arena page `page`.
    #[inline]
    pub const fn page_addr(&self, page: usize) -> usize {
        self.start + (page << PAGE_SHIFT)
    }

    /// Commits `bytes` more (a multiple of `PAGE_SIZE`) and returns their
    /// start. Concurrent growers get disjoint ranges.
    pub fn grow(&self, bytes: usize) -> Option<usize> {
        check_heap_unlocked();
        let _grow = self.grow_lock.lock();
        let used = self.used.load(Ordering::Relaxed);
        let new_used = used.checked_add(bytes)?;
        if new_used > self.end {
            return None;
        }
        self.map.commit(used - self.map.ptr() as usize, bytes).ok()?;
        self.commit_bitmap(used, new_used).ok()?;
        self.used.store(new_used, Ordering::Release);
        Some(used)
    }

    fn commit_bitmap(&self, from: usize, to: usize) -> io::Result<()> {
        let per_byte = PTR_SIZE * WORDS_PER_BITMAP_BYTE;
        let len = self.bitmap.len();
        let ps = sys_alloc::page_size();
        let lo = len - (to - self.start) / per_byte;
        let hi = len - (from - self.start) / per_byte;
        let lo = lo & !(ps - 1);
        let hi = hi.next_multiple_of(ps).min(len);
        self.bitmap.commit(lo, hi - lo)
    }

    /// Hands the pages of `[addr, addr + len)` back to the OS.
    pub fn release(&self, addr: usize, len: usize) -> io::Result<()> {
        check_heap_unlocked();
        self.map.release(addr - self.map.ptr() as usize, len)
    }

    /// Makes released pages usable again.
    pub fn reuse(&self, addr: usize, len: usize) -> io::Result<()> {
        check_heap_unlocked();
        self.map.reuse(addr - self.map.ptr() as usize, len)
    }

    /// Bitmap byte describing the heap word at `addr`, and the bit shift of
    /// that word within it.
    #[inline]
    pub fn bitmap_byte(&self, addr: usize) -> (&AtomicU8, u32) {
        let word = (addr - self.start) / PTR_SIZE;
        let index = self.bitmap.len() - 1 - word / WORDS_PER_BITMAP_BYTE;
        // SAFETY: `addr` lies in the committed arena, so its bitmap byte was
        // committed by `grow`; bitmap bytes are only accessed atomically.
        let byte = unsafe { AtomicU8::from_ptr(self.bitmap.ptr().add(index)) };
        #[allow(clippy::cast_possible_truncation)]
        (byte, (word % WORDS_PER_BITMAP_BYTE) as u32)
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("used", &format_args!("{:#x}", self.used()))
            .finish_non_exhaustive()
    }
}
