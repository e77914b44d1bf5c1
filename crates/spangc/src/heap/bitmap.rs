//! The heap bitmap.
//!
//! Every heap word has two bits, packed four words to a byte: the low nibble
//! holds the pointer bits, the high nibble the "high" bits. The high bit of
//! an object's first word is its mark bit. For every later word it means the
//! object description continues at this word; the first word with both bits
//! clear ends the object as far as the scanner is concerned.
//!
//! Bitmap bytes may be shared with neighbouring objects, so every update is
//! an atomic read-modify-write of the bits it owns.

use std::sync::atomic::{AtomicU8, Ordering};

use super::arena::Arena;
use crate::fatal::{throw, FatalKind};
use crate::gcprog::{self, BitSink};
use crate::sizeclass::PTR_SIZE;
use crate::typeinfo::{PointerLayout, TypeDescriptor};

const PTR_BIT: u8 = 0x01;
const HIGH_BIT: u8 = 0x10;

/// Bits of one heap word.
#[derive(Clone, Copy)]
pub struct HeapBits<'a> {
    arena: &'a Arena,
    addr: usize,
}

impl<'a> HeapBits<'a> {
    pub(crate) const fn new(arena: &'a Arena, addr: usize) -> Self {
        Self { arena, addr }
    }

    #[inline]
    fn byte(&self) -> (&'a AtomicU8, u32) {
        self.arena.bitmap_byte(self.addr)
    }

    #[inline]
    fn bits(&self) -> u8 {
        let (byte, shift) = self.byte();
        byte.load(Ordering::Acquire) >> shift & (PTR_BIT | HIGH_BIT)
    }

    /// Address of the described word.
    #[must_use]
    pub const fn addr(&self) -> usize {
        self.addr
    }

    /// Bits of the following word.
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            arena: self.arena,
            addr: self.addr + PTR_SIZE,
        }
    }

    /// The word holds a pointer.
    #[must_use]
    pub fn is_pointer(&self) -> bool {
        self.bits() & PTR_BIT != 0
    }

    /// The high bit: the mark bit on an object's first word, the
    /// "description continues" bit on later words.
    #[must_use]
    pub fn high_bit(&self) -> bool {
        self.bits() & HIGH_BIT != 0
    }

    /// Mark bit, meaningful on an object's first word.
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.high_bit()
    }

    /// Both bits clear: the scanner stops here.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.bits() == 0
    }

    /// Sets the mark bit. Returns `false` if it was already set.
    #[inline]
    pub(crate) fn set_marked(&self) -> bool {
        let (byte, shift) = self.byte();
        let bit = HIGH_BIT << shift;
        byte.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    pub(crate) fn clear_marked(&self) {
        let (byte, shift) = self.byte();
        byte.fetch_and(!(HIGH_BIT << shift), Ordering::AcqRel);
    }

    /// Clears both bits of this word.
    pub(crate) fn clear(&self) {
        let (byte, shift) = self.byte();
        byte.fetch_and(!((PTR_BIT | HIGH_BIT) << shift), Ordering::AcqRel);
    }

    /// Whether an object of `size` bytes starting here may hold pointers.
    pub(crate) fn has_pointers(&self, size: usize) -> bool {
        if self.is_pointer() {
            return true;
        }
        size > PTR_SIZE && self.next().high_bit()
    }
}

impl std::fmt::Debug for HeapBits<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBits")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("pointer", &self.is_pointer())
            .field("high", &self.high_bit())
            .finish()
    }
}

/// Clears all bits of `[start, start + bytes)`. `start` and `bytes` are
/// page aligned, so no byte is shared with another span.
pub fn clear_range(arena: &Arena, start: usize, bytes: usize) {
    let stride = PTR_SIZE * super::arena::WORDS_PER_BITMAP_BYTE;
    let mut addr = start;
    while addr < start + bytes {
        arena.bitmap_byte(addr).0.store(0, Ordering::Release);
        addr += stride;
    }
}

/// Writes word bits of one object, batching updates per bitmap byte.
struct BitmapWriter<'a> {
    arena: &'a Arena,
    base: usize,
    limit: usize,
    len: usize,
    pending: Option<&'a AtomicU8>,
    mask: u8,
    value: u8,
}

impl<'a> BitmapWriter<'a> {
    const fn new(arena: &'a Arena, base: usize, limit: usize) -> Self {
        Self {
            arena,
            base,
            limit,
            len: 0,
            pending: None,
            mask: 0,
            value: 0,
        }
    }

    fn write(&mut self, ptr: bool, high: bool) {
        let (byte, shift) = self.arena.bitmap_byte(self.base + self.len * PTR_SIZE);
        if !self.pending.is_some_and(|p| std::ptr::eq(p, byte)) {
            self.flush();
            self.pending = Some(byte);
        }
        self.mask |= (PTR_BIT | HIGH_BIT) << shift;
        self.value |= (u8::from(ptr) | u8::from(high) << 4) << shift;
        self.len += 1;
    }

    fn flush(&mut self) {
        if let Some(byte) = self.pending.take() {
            byte.fetch_and(!self.mask, Ordering::AcqRel);
            byte.fetch_or(self.value, Ordering::AcqRel);
        }
        self.mask = 0;
        self.value = 0;
    }
}

impl BitSink for BitmapWriter<'_> {
    fn push(&mut self, bit: bool) {
        let high = self.len > 0;
        self.write(bit, high);
    }

    fn get(&self, index: usize) -> bool {
        let (byte, shift) = self.arena.bitmap_byte(self.base + index * PTR_SIZE);
        if self.pending.is_some_and(|p| std::ptr::eq(p, byte)) && self.mask >> shift & PTR_BIT != 0
        {
            return self.value >> shift & PTR_BIT != 0;
        }
        byte.load(Ordering::Acquire) >> shift & PTR_BIT != 0
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_full(&self) -> bool {
        self.len >= self.limit
    }
}

/// Records the pointer layout of a new object.
///
/// `size` is the allocated size, `data_size` the requested one. When
/// `data_size` covers several instances of `typ` the layout is repeated,
/// and the description stops after the last instance's pointer prefix.
/// Word 0 gets its pointer bit and a clear mark bit, described words after
/// it get the continue bit, and the rest of the object is dead.
pub fn set_type(arena: &Arena, addr: usize, size: usize, data_size: usize, typ: &TypeDescriptor) {
    let elem = typ.size();
    let ptr_data = typ.ptr_data();
    if elem == 0 || ptr_data == 0 {
        throw(FatalKind::Misuse, "pointer layout of a pointer-free type");
    }
    let described = if data_size > elem {
        data_size - elem + ptr_data
    } else {
        ptr_data
    };
    let nw = described / PTR_SIZE;
    let words = size / PTR_SIZE;
    if nw > words {
        throw(FatalKind::Misuse, "type larger than its allocation");
    }

    let mut w = BitmapWriter::new(arena, addr, nw);
    match typ.layout() {
        PointerLayout::None => throw(FatalKind::Misuse, "pointer layout of a pointer-free type"),
        PointerLayout::Mask(mask) => {
            let elem_words = elem / PTR_SIZE;
            let ptr_words = ptr_data / PTR_SIZE;
            for i in 0..nw {
                let j = i % elem_words;
                let ptr = j < ptr_words && TypeDescriptor::mask_bit(mask, j);
                w.write(ptr, i > 0);
            }
        }
        PointerLayout::Program(prog) => {
            let scalar_tail = (elem - ptr_data) / PTR_SIZE;
            while !w.is_full() {
                let before = w.len;
                gcprog::run(prog, &mut w);
                if w.len == before {
                    throw(FatalKind::InvariantViolation, "GC program produced no bits");
                }
                for _ in 0..scalar_tail {
                    if w.is_full() {
                        break;
                    }
                    w.push(false);
                }
            }
        }
    }
    for _ in nw..words {
        w.write(false, false);
    }
    w.flush();
}
