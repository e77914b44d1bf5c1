use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new anonymous memory mapping with an optional address hint.
    pub unsafe fn map_anon(
        hint_addr: usize,
        len: usize,
        _populate: bool,
        _no_reserve: bool,
        reserve_only: bool,
    ) -> io::Result<Self> {
        let addr = if hint_addr == 0 {
            ptr::null()
        } else {
            hint_addr as *const std::ffi::c_void
        };

        let (kind, protect) = if reserve_only {
            (MEM_RESERVE, PAGE_NOACCESS)
        } else {
            (MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };

        let mut ptr = unsafe { VirtualAlloc(addr, len, kind, protect) };

        // If strict allocation at hint_addr failed, and we had a hint, try letting the OS decide.
        if ptr.is_null() && !addr.is_null() {
            ptr = unsafe { VirtualAlloc(ptr::null(), len, kind, protect) };
        }

        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        let ptr = unsafe {
            VirtualAlloc(
                addr.cast::<std::ffi::c_void>(),
                len,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn release(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        let ok = unsafe { VirtualFree(addr.cast::<std::ffi::c_void>(), len, MEM_DECOMMIT) };
        if ok == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Decommitted pages have to be committed again before use.
    pub unsafe fn reuse(&self, offset: usize, len: usize) -> io::Result<()> {
        unsafe { self.commit(offset, len) }
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
