//! OS memory primitives
//!
//! Page-granular allocation, protection changes and instruction-cache
//! maintenance. All sizes and addresses are widened to whole pages before
//! touching the OS.

use crate::error::HookError;

bitflags::bitflags! {
    /// Page permission set
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    pub const RW: Protection = Protection::READ.union(Protection::WRITE);
    pub const RX: Protection = Protection::READ.union(Protection::EXECUTE);
    pub const RWX: Protection = Protection::RW.union(Protection::EXECUTE);
}

impl From<Protection> for region::Protection {
    fn from(prot: Protection) -> Self {
        let mut out = region::Protection::NONE;
        if prot.contains(Protection::READ) {
            out |= region::Protection::READ;
        }
        if prot.contains(Protection::WRITE) {
            out |= region::Protection::WRITE;
        }
        if prot.contains(Protection::EXECUTE) {
            out |= region::Protection::EXECUTE;
        }
        out
    }
}

/// System page size
pub fn page_size() -> usize {
    region::page::size()
}

/// Round `addr` down to its page base
pub fn page_floor(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

/// Round `size` up to a whole number of pages
pub fn page_ceil(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

#[cfg(unix)]
fn prot_flags(prot: Protection) -> nix::sys::mman::ProtFlags {
    use nix::sys::mman::ProtFlags;

    let mut flags = ProtFlags::PROT_NONE;
    if prot.contains(Protection::READ) {
        flags |= ProtFlags::PROT_READ;
    }
    if prot.contains(Protection::WRITE) {
        flags |= ProtFlags::PROT_WRITE;
    }
    if prot.contains(Protection::EXECUTE) {
        flags |= ProtFlags::PROT_EXEC;
    }
    flags
}

/// Allocate anonymous pages.
///
/// With `fixed`, the mapping must land exactly at the requested page-aligned
/// address; the call fails rather than displacing an existing mapping.
#[cfg(unix)]
pub fn alloc(size: usize, prot: Protection, fixed: Option<usize>) -> Result<*mut u8, HookError> {
    use nix::sys::mman::{mmap_anonymous, MapFlags};
    use std::num::NonZeroUsize;

    let size = page_ceil(size);
    let length = NonZeroUsize::new(size).ok_or(HookError::InvalidArgument)?;

    let mut flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
    #[cfg(target_os = "linux")]
    if fixed.is_some() {
        flags |= MapFlags::MAP_FIXED_NOREPLACE;
    }

    let addr = fixed.and_then(NonZeroUsize::new);
    let ptr = unsafe { mmap_anonymous(addr, length, prot_flags(prot), flags) }.map_err(|e| {
        tracing::debug!("mmap failed (fixed={:x?}): {}", fixed, e);
        HookError::MemoryAllocation
    })?;

    if let Some(want) = fixed {
        // Without MAP_FIXED_NOREPLACE the address is only a hint.
        if ptr.as_ptr() as usize != want {
            unsafe {
                let _ = nix::sys::mman::munmap(ptr, size);
            }
            return Err(HookError::MemoryAllocation);
        }
    }

    Ok(ptr.as_ptr() as *mut u8)
}

#[cfg(windows)]
pub fn alloc(size: usize, prot: Protection, fixed: Option<usize>) -> Result<*mut u8, HookError> {
    use windows::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
        PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    };

    let size = page_ceil(size);
    let protect = match (prot.contains(Protection::WRITE), prot.contains(Protection::EXECUTE)) {
        (true, true) => PAGE_EXECUTE_READWRITE,
        (true, false) => PAGE_READWRITE,
        (false, true) => PAGE_EXECUTE_READ,
        (false, false) => {
            if prot.contains(Protection::READ) {
                PAGE_READONLY
            } else {
                PAGE_NOACCESS
            }
        }
    };

    let ptr = unsafe {
        VirtualAlloc(
            fixed.map(|a| a as *const core::ffi::c_void),
            size,
            MEM_COMMIT | MEM_RESERVE,
            protect,
        )
    };
    if ptr.is_null() {
        return Err(HookError::MemoryAllocation);
    }
    Ok(ptr as *mut u8)
}

/// Change the protection of the pages covering `[ptr, ptr + size)`
pub fn protect(ptr: *const u8, size: usize, prot: Protection) -> Result<(), HookError> {
    unsafe { region::protect(ptr, size, prot.into()) }.map_err(|e| {
        tracing::error!("protection change failed at {:p}: {}", ptr, e);
        HookError::MemoryProtection
    })
}

/// Release pages previously obtained from [`alloc`]
#[cfg(unix)]
pub fn free(ptr: *mut u8, size: usize) {
    use std::ptr::NonNull;

    if let Some(ptr) = NonNull::new(ptr as *mut core::ffi::c_void) {
        unsafe {
            let _ = nix::sys::mman::munmap(ptr, page_ceil(size));
        }
    }
}

#[cfg(windows)]
pub fn free(ptr: *mut u8, _size: usize) {
    use windows::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    if !ptr.is_null() {
        unsafe {
            let _ = VirtualFree(ptr as *mut core::ffi::c_void, 0, MEM_RELEASE);
        }
    }
}

/// Flush the instruction cache for `[start, start + len)`.
///
/// A no-op on x86, which keeps its i-cache coherent; a fence still orders the
/// code writes against the subsequent first execution.
pub fn clear_icache(start: usize, len: usize) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let _ = (start, len);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(all(unix, any(target_arch = "arm", target_arch = "aarch64")))]
    {
        extern "C" {
            // Provided by compiler-rt / libgcc.
            fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
        }
        unsafe {
            __clear_cache(start as *mut _, (start + len) as *mut _);
        }
    }

    #[cfg(all(windows, not(any(target_arch = "x86", target_arch = "x86_64"))))]
    {
        use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows::Win32::System::Threading::GetCurrentProcess;
        unsafe {
            let _ = FlushInstructionCache(
                GetCurrentProcess(),
                Some(start as *const core::ffi::c_void),
                len,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = page_size();
        assert!(page >= 4096);
        assert_eq!(page & (page - 1), 0);
    }

    #[test]
    fn test_page_rounding() {
        let page = page_size();
        assert_eq!(page_floor(page + 123), page);
        assert_eq!(page_ceil(1), page);
        assert_eq!(page_ceil(page), page);
    }

    #[test]
    fn test_alloc_write_free() {
        let ptr = alloc(64, Protection::RW, None).expect("alloc");
        unsafe {
            ptr.write_bytes(0xAB, 64);
            assert_eq!(*ptr.add(63), 0xAB);
        }
        free(ptr, 64);
    }

    #[test]
    fn test_protect_toggle() {
        let ptr = alloc(page_size(), Protection::RW, None).expect("alloc");
        protect(ptr, page_size(), Protection::RWX).expect("rwx");
        protect(ptr, page_size(), Protection::RX).expect("rx");
        free(ptr, page_size());
    }
}
