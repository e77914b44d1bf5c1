//! Size classes.
//!
//! Small allocations (up to [`MAX_SMALL_SIZE`]) are rounded up to one of
//! [`NUM_SIZE_CLASSES`] - 1 object sizes. Each class is carved out of spans of
//! a fixed number of pages. The table is chosen so that both the rounding
//! waste and the page-chopping waste stay at or below 12.5%.
//!
//! Class 0 is reserved for large objects, which get a span of their own.

use std::sync::LazyLock;

use crate::fatal::{throw, FatalKind};

// ============================================================================
// Constants
// ============================================================================

/// Size of a pointer-sized word.
pub const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// log2 of the heap page size.
pub const PAGE_SHIFT: usize = 13;

/// Heap page size (8 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask of the offset within a heap page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Largest size served from a size class.
pub const MAX_SMALL_SIZE: usize = 32 << 10;

/// Number of size classes, counting the large-object class 0.
pub const NUM_SIZE_CLASSES: usize = 67;

/// Pointer-free objects smaller than this are combined into tiny blocks.
pub const TINY_SIZE: usize = 16;

/// Size class of the tiny blocks.
pub const TINY_SIZE_CLASS: usize = 2;

const SMALL_SIZE_DIV: usize = 8;
const SMALL_SIZE_MAX: usize = 1024;
const LARGE_SIZE_DIV: usize = 128;

// ============================================================================
// Table
// ============================================================================

/// One row of the size class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Class index (1..`NUM_SIZE_CLASSES`).
    pub id: usize,
    /// Object size in bytes.
    pub size: usize,
    /// Pages per span.
    pub pages: usize,
}

impl SizeClass {
    /// Bytes in one span of this class.
    #[must_use]
    pub const fn span_bytes(&self) -> usize {
        self.pages << PAGE_SHIFT
    }

    /// Objects carved from one span.
    #[must_use]
    pub const fn objects_per_span(&self) -> usize {
        self.span_bytes() / self.size
    }

    /// Bytes left over at the end of each span.
    #[must_use]
    pub const fn tail_waste(&self) -> usize {
        self.span_bytes() % self.size
    }
}

/// The size class table plus its byte-size lookup arrays.
#[derive(Debug)]
pub struct SizeClassTable {
    sizes: [usize; NUM_SIZE_CLASSES],
    pages: [usize; NUM_SIZE_CLASSES],
    size_to_class8: [u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1],
    size_to_class128: [u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1],
}

static TABLE: LazyLock<SizeClassTable> = LazyLock::new(SizeClassTable::build);

/// Returns the process-wide size class table.
#[must_use]
pub fn table() -> &'static SizeClassTable {
    &TABLE
}

impl SizeClassTable {
    fn build() -> Self {
        let mut sizes = [0usize; NUM_SIZE_CLASSES];
        let mut pages = [0usize; NUM_SIZE_CLASSES];

        // Class 0 is the large-object class.
        let mut count = 1;
        let mut align = 8;
        let mut size = align;
        while size <= MAX_SMALL_SIZE {
            if size.is_power_of_two() {
                if size >= 2048 {
                    align = 256;
                } else if size >= 128 {
                    align = size / 8;
                } else if size >= 16 {
                    align = 16;
                }
            }
            if align & (align - 1) != 0 {
                throw(FatalKind::InvariantViolation, "size class alignment is not a power of two");
            }

            // Smallest run whose tail waste is at most 1/8 of the run.
            let mut alloc = PAGE_SIZE;
            while alloc % size > alloc / 8 {
                alloc += PAGE_SIZE;
            }
            let npages = alloc >> PAGE_SHIFT;

            // Same run length and same objects per run as the previous
            // class: widen that class instead.
            if count > 1
                && npages == pages[count - 1]
                && alloc / size == alloc / sizes[count - 1]
            {
                sizes[count - 1] = size;
            } else {
                if count == NUM_SIZE_CLASSES {
                    throw(FatalKind::InvariantViolation, "too many size classes");
                }
                sizes[count] = size;
                pages[count] = npages;
                count += 1;
            }
            size += align;
        }

        if count != NUM_SIZE_CLASSES {
            eprintln!("[spangc] size class count {count}, expected {NUM_SIZE_CLASSES}");
            throw(FatalKind::InvariantViolation, "bad size class table");
        }

        let mut size_to_class8 = [0u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1];
        let mut size_to_class128 = [0u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1];
        let mut next = 0usize;
        for (class, &class_size) in sizes.iter().enumerate().skip(1) {
            #[allow(clippy::cast_possible_truncation)]
            let id = class as u8;
            while next < SMALL_SIZE_MAX && next <= class_size {
                size_to_class8[next / SMALL_SIZE_DIV] = id;
                next += SMALL_SIZE_DIV;
            }
            if next >= SMALL_SIZE_MAX {
                while next <= class_size {
                    size_to_class128[(next - SMALL_SIZE_MAX) / LARGE_SIZE_DIV] = id;
                    next += LARGE_SIZE_DIV;
                }
            }
        }

        Self {
            sizes,
            pages,
            size_to_class8,
            size_to_class128,
        }
    }

    /// Size class for a small request. `size` must not exceed
    /// [`MAX_SMALL_SIZE`].
    #[inline]
    #[must_use]
    pub fn size_to_class(&self, size: usize) -> usize {
        if size <= SMALL_SIZE_MAX - SMALL_SIZE_DIV {
            self.size_to_class8[(size + SMALL_SIZE_DIV - 1) / SMALL_SIZE_DIV] as usize
        } else {
            self.size_to_class128[(size - SMALL_SIZE_MAX + LARGE_SIZE_DIV - 1) / LARGE_SIZE_DIV]
                as usize
        }
    }

    /// Object size of `class`.
    #[inline]
    #[must_use]
    pub const fn class_size(&self, class: usize) -> usize {
        self.sizes[class]
    }

    /// Pages per span of `class`.
    #[inline]
    #[must_use]
    pub const fn class_pages(&self, class: usize) -> usize {
        self.pages[class]
    }

    /// Full row for `class`.
    #[must_use]
    pub const fn class(&self, class: usize) -> SizeClass {
        SizeClass {
            id: class,
            size: self.sizes[class],
            pages: self.pages[class],
        }
    }

    /// Iterates the small-object classes (1..`NUM_SIZE_CLASSES`).
    pub fn classes(&self) -> impl Iterator<Item = SizeClass> + '_ {
        (1..NUM_SIZE_CLASSES).map(|c| self.class(c))
    }
}

/// Size actually reserved for a request of `size` bytes.
///
/// Small sizes round to their class, large sizes to whole pages. A size
/// whose page rounding would overflow is returned unchanged.
#[must_use]
pub fn round_up_size(size: usize) -> usize {
    if size < MAX_SMALL_SIZE {
        let t = table();
        return t.class_size(t.size_to_class(size));
    }
    if size.checked_add(PAGE_SIZE).is_none() {
        return size;
    }
    (size + PAGE_MASK) & !PAGE_MASK
}
