//! Type descriptors and allocation flags.
//!
//! The collector never looks at Rust types. Callers describe each allocated
//! type by its size and by which of its leading words hold pointers.

use bitflags::bitflags;

use crate::fatal::{throw, FatalKind};
use crate::gcprog;
use crate::sizeclass::PTR_SIZE;

bitflags! {
    /// Allocation modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// The object holds no pointers and is never scanned.
        const NO_SCAN = 1 << 0;
        /// The caller initialises the memory itself.
        const NO_ZERO = 1 << 1;
    }
}

/// How the pointer words of a type are described.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerLayout {
    /// The type holds no pointers.
    None,
    /// One bit per word for the first `ptr_data / PTR_SIZE` words,
    /// least significant bit first.
    Mask(Box<[u8]>),
    /// A length-prefixed GC program producing the same bits.
    Program(Box<[u8]>),
}

/// Layout of an allocated type as seen by the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    size: usize,
    ptr_data: usize,
    layout: PointerLayout,
}

impl TypeDescriptor {
    /// A pointer-free type of `size` bytes.
    #[must_use]
    pub const fn scalar(size: usize) -> Self {
        Self {
            size,
            ptr_data: 0,
            layout: PointerLayout::None,
        }
    }

    /// A type of `size` bytes whose words at the given indices are pointers.
    ///
    /// # Panics
    ///
    /// Panics if an index lies outside the type.
    #[must_use]
    pub fn from_pointer_words(size: usize, words: &[usize]) -> Self {
        let nwords = size / PTR_SIZE;
        let Some(&last) = words.iter().max() else {
            return Self::scalar(size);
        };
        if last >= nwords {
            throw(FatalKind::Misuse, "pointer word outside of type");
        }
        let mut mask = vec![0u8; (last + 1).div_ceil(8)];
        for &w in words {
            mask[w / 8] |= 1 << (w % 8);
        }
        Self {
            size,
            ptr_data: (last + 1) * PTR_SIZE,
            layout: PointerLayout::Mask(mask.into_boxed_slice()),
        }
    }

    /// A type described by a GC program covering its first `ptr_data` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the program is malformed or describes a different number
    /// of words.
    #[must_use]
    pub fn from_program(size: usize, ptr_data: usize, program: Vec<u8>) -> Self {
        if ptr_data > size || ptr_data % PTR_SIZE != 0 {
            throw(FatalKind::Misuse, "bad pointer data size for GC program");
        }
        let (_, nbits) = gcprog::expand(&program);
        if nbits != ptr_data / PTR_SIZE {
            throw(FatalKind::Misuse, "GC program length does not match type");
        }
        Self {
            size,
            ptr_data,
            layout: PointerLayout::Program(program.into_boxed_slice()),
        }
    }

    /// Size of one instance in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Bytes from the start of an instance to the end of its last pointer.
    #[must_use]
    pub const fn ptr_data(&self) -> usize {
        self.ptr_data
    }

    /// Pointer description.
    #[must_use]
    pub const fn layout(&self) -> &PointerLayout {
        &self.layout
    }

    /// `true` if any word of the type is a pointer.
    #[must_use]
    pub const fn has_pointers(&self) -> bool {
        self.ptr_data != 0
    }

    /// Whether word `i` (below `ptr_data / PTR_SIZE`) of a mask-described
    /// type is a pointer.
    #[inline]
    pub(crate) fn mask_bit(mask: &[u8], i: usize) -> bool {
        mask[i / 8] >> (i % 8) & 1 != 0
    }
}
