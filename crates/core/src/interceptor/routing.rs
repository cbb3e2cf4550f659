//! Trampoline builder
//!
//! Assembles the three artifacts of an installation: the patch that will be
//! written over the victim head, the forwarder block the patch jumps to, and
//! the relocated head terminated by a branch back past the patch. Block
//! placement policy (near vs. far) lives here; instruction emission is the
//! arch backend's.

use crate::codegen::arch;
use crate::config;
use crate::error::HookError;
use crate::interceptor::Entry;
use crate::memory::{allocator, platform, MemBlock};

/// Upper bound for a relocated head: a handful of re-encoded instructions
/// plus the back branch and literals.
const RELOCATED_BLOCK_SIZE: usize = 128;

fn copy_into(block: MemBlock, bytes: &[u8]) {
    debug_assert!(bytes.len() <= block.size());
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), block.start() as *mut u8, bytes.len());
    }
    platform::clear_icache(block.start(), bytes.len());
}

/// Forwarder placement: ISAs whose patch is range-limited need the block near
/// the victim; ISAs with a far patch only go near when asked to.
fn alloc_forwarder_block(victim: usize, size: usize) -> Result<MemBlock, HookError> {
    if arch::HAS_FAR_PATCH && !config::near_trampoline_enabled() {
        return allocator::shared().alloc_exec_block(size);
    }
    match allocator::shared().alloc_exec_block_near(size, victim, arch::NEAR_JUMP_RANGE) {
        Ok(block) => Ok(block),
        Err(err) if arch::HAS_FAR_PATCH => {
            tracing::debug!("near forwarder unavailable ({err}), falling back to far patch");
            allocator::shared().alloc_exec_block(size)
        }
        Err(err) => Err(err),
    }
}

fn alloc_relocated_block(victim: usize) -> Result<MemBlock, HookError> {
    if arch::RELOCATED_NEEDS_NEAR {
        allocator::shared().alloc_exec_block_near(RELOCATED_BLOCK_SIZE, victim, arch::NEAR_JUMP_RANGE)
    } else {
        allocator::shared().alloc_exec_block(RELOCATED_BLOCK_SIZE)
    }
}

/// Build forwarder, patch and relocated head for `entry`, forwarding to
/// `forward_to` (the substitute or the instrument closure trampoline).
///
/// Returns the patch bytes; writing them is the caller's final step. On
/// error the caller owns cleanup via [`free_entry_blocks`].
///
/// # Safety
/// `entry.victim_addr` must point at readable code.
pub(crate) unsafe fn build_routing(
    entry: &mut Entry,
    forward_to: usize,
) -> Result<Vec<u8>, HookError> {
    let victim = entry.victim_addr;

    let fwd_code = arch::emit_forwarder(forward_to);
    let fwd_block = alloc_forwarder_block(victim, fwd_code.size())?;
    copy_into(fwd_block, fwd_code.bytes());
    entry.forwarder = fwd_block;
    tracing::debug!(
        "forwarder at {:#x} -> {:#x} for victim {:#x}",
        fwd_block.start(),
        forward_to,
        victim
    );

    #[cfg(not(target_arch = "arm"))]
    let mut patch = arch::emit_patch(victim, fwd_block.start())?.to_vec();
    #[cfg(target_arch = "arm")]
    let mut patch = arch::emit_patch(victim, fwd_block.start(), entry.arm_thumb_mode)?.to_vec();

    let rel_block = alloc_relocated_block(victim)?;
    // Recorded up front so a relocation failure still frees the block.
    entry.relocated = rel_block;

    #[cfg(not(target_arch = "arm"))]
    let relocated = arch::relocate_head(victim, patch.len(), rel_block.start())?;
    #[cfg(target_arch = "arm")]
    let relocated = arch::relocate_head(victim, patch.len(), rel_block.start(), entry.arm_thumb_mode)?;

    if relocated.code.len() > rel_block.size() {
        return Err(HookError::RelocationFailed);
    }
    copy_into(rel_block, &relocated.code);
    entry.relocated = MemBlock::new(rel_block.start(), relocated.code.len());
    tracing::debug!(
        "relocated head at {:#x} covering {} victim bytes",
        rel_block.start(),
        relocated.consumed
    );

    entry.patched = MemBlock::new(victim, relocated.consumed);
    entry.origin_bytes =
        std::slice::from_raw_parts(victim as *const u8, relocated.consumed).to_vec();

    // Whole instructions only: the gap between the branch and the last copied
    // instruction is never executed, but keep it as filler, not stale bytes.
    arch::pad_patch(&mut patch, relocated.consumed);

    Ok(patch)
}

/// Release every block an entry owns; safe on partially built entries.
pub(crate) fn free_entry_blocks(entry: &Entry) {
    for block in [entry.relocated, entry.forwarder] {
        if !block.is_null() {
            allocator::shared().free_block(block);
        }
    }
    if let Some(tramp) = &entry.instrument_tramp {
        allocator::shared().free_block(tramp.buffer);
    }
    if let Some(tramp) = &entry.epilogue_tramp {
        allocator::shared().free_block(tramp.buffer);
    }
}

#[cfg(test)]
#[cfg(target_arch = "x86_64")]
mod tests {
    use super::*;

    #[test]
    fn test_build_routing_invariants() {
        // Synthetic victim: mov rax, 42; ret
        let victim_block = allocator::shared().alloc_exec_block(32).unwrap();
        unsafe {
            crate::memory::patch::code_patch(
                victim_block.start() as *mut u8,
                &[0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, 0xC3],
            )
            .unwrap();
        }

        let mut entry = Entry::new(victim_block.start());
        let patch = unsafe { build_routing(&mut entry, 0x1000) }.expect("build");

        assert!(patch.len() >= arch::MIN_PATCH_SIZE);
        assert_eq!(patch.len(), entry.patched.size());
        assert_eq!(entry.origin_bytes.len(), entry.patched.size());
        assert_eq!(entry.patched.start(), entry.victim_addr);
        assert!(!entry.relocated.is_null());
        assert!(!entry.forwarder.is_null());
        // The victim itself is untouched until the patch is written.
        assert_eq!(
            unsafe { std::slice::from_raw_parts(entry.victim_addr as *const u8, 2) },
            &[0x48, 0xC7]
        );

        free_entry_blocks(&entry);
        allocator::shared().free_block(victim_block);
    }
}
