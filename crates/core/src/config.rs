//! Process-wide engine configuration
//!
//! A relaxed atomic flag selects near (direct-branch) trampolines on the ARM
//! family, and an optional user callback can take over near-range code
//! allocation entirely.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

/// Custom near-code allocator: `(size, target, range) -> addr`, 0 on failure.
/// The returned memory must be executable and writable before first run.
pub type AllocNearCodeCallback = fn(size: usize, target: usize, range: usize) -> usize;

static NEAR_TRAMPOLINE_ENABLED: AtomicBool = AtomicBool::new(false);

static ALLOC_NEAR_CODE_CALLBACK: RwLock<Option<AllocNearCodeCallback>> = RwLock::new(None);

/// Prefer single-instruction direct branches for the victim patch where the
/// ISA has them. x86-family patches are always near regardless of this flag.
pub fn set_near_trampoline(enable: bool) {
    NEAR_TRAMPOLINE_ENABLED.store(enable, Ordering::Relaxed);
}

pub fn near_trampoline_enabled() -> bool {
    NEAR_TRAMPOLINE_ENABLED.load(Ordering::Relaxed)
}

/// Register (or clear, with `None`) the near-code allocation callback
pub fn register_alloc_near_code_callback(cb: Option<AllocNearCodeCallback>) {
    *ALLOC_NEAR_CODE_CALLBACK.write() = cb;
}

pub(crate) fn alloc_near_code_callback() -> Option<AllocNearCodeCallback> {
    *ALLOC_NEAR_CODE_CALLBACK.read()
}

/// Set both options at once
pub fn set_options(enable_near_trampoline: bool, cb: Option<AllocNearCodeCallback>) {
    set_near_trampoline(enable_near_trampoline);
    register_alloc_near_code_callback(cb);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_near_trampoline_flag() {
        set_near_trampoline(true);
        assert!(near_trampoline_enabled());
        set_near_trampoline(false);
        assert!(!near_trampoline_enabled());
    }

    #[test]
    fn test_callback_registration() {
        fn stub(_size: usize, _target: usize, _range: usize) -> usize {
            0
        }

        register_alloc_near_code_callback(Some(stub));
        assert!(alloc_near_code_callback().is_some());
        register_alloc_near_code_callback(None);
        assert!(alloc_near_code_callback().is_none());
    }
}
