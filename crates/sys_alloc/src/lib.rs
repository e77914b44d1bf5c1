//! Operating system memory primitives for the `spangc` heap.
//!
//! The heap reserves one large range of address space up front and then
//! commits it piece by piece as it grows, handing pages back to the OS when
//! they sit idle. This crate wraps the handful of platform calls involved.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// When requesting a specific address, it should be aligned to this granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Makes `[offset, offset + len)` readable and writable.
    ///
    /// Only needed for mappings created with [`MmapOptions::reserve_only`];
    /// committed pages read as zero the first time they are touched.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.commit(offset, len) }
    }

    /// Tells the OS the contents of `[offset, offset + len)` are no longer
    /// needed. The range stays reserved; call [`Mmap::reuse`] before touching
    /// it again.
    pub fn release(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.release(offset, len) }
    }

    /// Makes a range previously passed to [`Mmap::release`] usable again.
    pub fn reuse(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.reuse(offset, len) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range outside of mapping",
            )),
        }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    hint_addr: usize,
    populate: bool,
    no_reserve: bool,
    reserve_only: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            populate: false,
            no_reserve: false,
            reserve_only: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets a hint address for the mapping.
    ///
    /// This is a request to the OS to place the mapping at this specific virtual address.
    /// The OS is not required to honor this request, and the call may fail if the
    /// address is already in use.
    pub fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    pub fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to reserve swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    pub fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Reserves address space without making it accessible.
    ///
    /// Pages must be committed with [`Mmap::commit`] before use.
    pub fn reserve_only(mut self, reserve_only: bool) -> Self {
        self.reserve_only = reserve_only;
        self
    }

    /// Creates an anonymous memory map.
    ///
    /// # Safety
    ///
    /// The returned mapping owns the memory, but pointers derived from
    /// [`Mmap::ptr`] must not outlive it, and a reserved range must be
    /// committed before it is read or written.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe {
            os::MmapInner::map_anon(
                self.hint_addr,
                self.len,
                self.populate,
                self.no_reserve,
                self.reserve_only,
            )?
        };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Asks the OS for `len` bytes of reserved address space at `hint_addr`.
///
/// Returns `None` if the OS refused, or if it placed the mapping somewhere
/// other than a non-zero hint. Callers are expected to try a different hint.
pub fn request_memory(hint_addr: usize, len: usize) -> Option<Mmap> {
    let mmap = unsafe {
        MmapOptions::new()
            .len(len)
            .with_hint(hint_addr)
            .no_reserve(true)
            .reserve_only(true)
            .map_anon()
            .ok()?
    };
    if hint_addr != 0 && mmap.ptr() as usize != hint_addr {
        return None;
    }
    Some(mmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_anon()
                .expect("failed to map")
        };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_reserve_then_commit() {
        let ps = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(ps * 4)
                .reserve_only(true)
                .map_anon()
                .expect("failed to reserve")
        };
        mmap.commit(ps, ps).expect("failed to commit");

        let ptr = unsafe { mmap.ptr().add(ps) };
        unsafe {
            assert_eq!(ptr::read_volatile(ptr), 0, "fresh pages read as zero");
            ptr::write_volatile(ptr, 7);
            assert_eq!(ptr::read_volatile(ptr), 7);
        }
    }

    #[test]
    fn test_release_and_reuse() {
        let ps = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(ps * 2)
                .map_anon()
                .expect("failed to map")
        };
        unsafe { ptr::write_volatile(mmap.ptr(), 1) };
        mmap.release(0, ps).expect("release failed");
        mmap.reuse(0, ps).expect("reuse failed");
        unsafe {
            ptr::write_volatile(mmap.ptr(), 2);
            assert_eq!(ptr::read_volatile(mmap.ptr()), 2);
        }
    }

    #[test]
    fn test_out_of_range_commit_rejected() {
        let ps = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(ps)
                .reserve_only(true)
                .map_anon()
                .expect("failed to reserve")
        };
        assert!(mmap.commit(0, ps * 2).is_err());
        assert!(mmap.commit(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_request_memory_any_address() {
        let len = allocation_granularity();
        let mmap = request_memory(0, len).expect("OS refused a small reservation");
        assert_eq!(mmap.len(), len);
        mmap.commit(0, len).expect("commit failed");
    }

    #[test]
    fn test_request_memory_with_hint() {
        // The hint may be taken already; only a placed mapping is checked.
        let len = allocation_granularity();

        #[cfg(target_pointer_width = "64")]
        let hint_base = 0x6000_0000_0000usize;
        #[cfg(target_pointer_width = "32")]
        let hint_base = 0x4000_0000usize;

        if let Some(mmap) = request_memory(hint_base, len) {
            assert_eq!(mmap.ptr() as usize, hint_base);
        }
    }
}
