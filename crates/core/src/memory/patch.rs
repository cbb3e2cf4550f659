//! Code patching
//!
//! Writes bytes into live executable pages: raise the covered pages to RWX,
//! copy, restore the previous protections best-effort, flush the i-cache.
//! Restore failures are reported but the patch stands.

use crate::error::HookError;
use crate::memory::platform::{self, Protection};

/// Patch `bytes` at `address`.
///
/// # Safety
/// `address` must be mapped for the whole span and no other thread may be
/// executing inside the patched bytes (see the concurrency notes on the crate
/// root: in-flight execution of a partially written span is inherent to
/// inline patching).
pub unsafe fn code_patch(address: *mut u8, bytes: &[u8]) -> Result<(), HookError> {
    if address.is_null() || bytes.is_empty() {
        tracing::error!(
            "code_patch: invalid parameters (address={:p}, len={})",
            address,
            bytes.len()
        );
        return Err(HookError::InvalidArgument);
    }
    if (address as usize).checked_add(bytes.len()).is_none() {
        tracing::error!("code_patch: address + len overflows");
        return Err(HookError::InvalidArgument);
    }

    let span_start = platform::page_floor(address as usize);
    let span_len = platform::page_ceil(address as usize + bytes.len() - span_start);

    // Capture current protections so they can be put back afterwards.
    let previous: Vec<(usize, usize, region::Protection)> =
        match region::query_range(span_start as *const u8, span_len) {
            Ok(iter) => iter
                .filter_map(|r| r.ok())
                .map(|r| (r.as_range().start, r.len(), r.protection()))
                .collect(),
            Err(e) => {
                tracing::error!("code_patch: query failed: {}", e);
                return Err(HookError::MemoryProtection);
            }
        };

    platform::protect(span_start as *const u8, span_len, Protection::RWX)?;

    std::ptr::copy_nonoverlapping(bytes.as_ptr(), address, bytes.len());

    let mut restore_failed = false;
    for (start, len, prot) in previous {
        if unsafe { region::protect(start as *const u8, len, prot) }.is_err() {
            tracing::error!("code_patch: restore failed for page {:#x}", start);
            restore_failed = true;
        }
    }

    platform::clear_icache(address as usize, bytes.len());

    if restore_failed {
        return Err(HookError::MemoryProtection);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator;

    #[test]
    fn test_patch_null_rejected() {
        let err = unsafe { code_patch(std::ptr::null_mut(), &[0x90]) }.unwrap_err();
        assert_eq!(err, HookError::InvalidArgument);
    }

    #[test]
    fn test_patch_empty_rejected() {
        let mut byte = 0u8;
        let err = unsafe { code_patch(&mut byte, &[]) }.unwrap_err();
        assert_eq!(err, HookError::InvalidArgument);
    }

    #[test]
    fn test_patch_exec_block_roundtrip() {
        let block = allocator::shared().alloc_exec_block(16).unwrap();
        let ptr = block.start() as *mut u8;
        let code = [0xDE, 0xAD, 0xBE, 0xEF];
        unsafe {
            code_patch(ptr, &code).expect("patch");
            let written = std::slice::from_raw_parts(ptr, 4);
            assert_eq!(written, &code);
        }
        allocator::shared().free_block(block);
    }
}
