//! Error taxonomy and the per-thread last-error slot
//!
//! Codes are stable and grouped by decade: general errors in -1..-99, memory
//! errors in -100..-199, relocation errors in -200..-299, routing errors in
//! -300..-399. Success is 0. Every public entry point records its outcome in
//! a thread-local slot readable through [`get_last_error`].

use std::cell::Cell;

/// Error type for hook and instrumentation operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(i32)]
pub enum HookError {
    #[error("Invalid argument (null pointer or invalid parameter)")]
    InvalidArgument = -1,

    #[error("Hook or entry not found")]
    NotFound = -2,

    #[error("Address already hooked or instrumented")]
    AlreadyExists = -3,

    #[error("Operation not supported on this platform or architecture")]
    NotSupported = -4,

    #[error("Unknown error")]
    Unknown = -5,

    #[error("Memory allocation failed")]
    MemoryAllocation = -100,

    #[error("Failed to change memory protection")]
    MemoryProtection = -101,

    #[error("Memory operation failed")]
    MemoryOperation = -102,

    #[error("No near memory available for trampoline")]
    NearMemoryExhausted = -103,

    #[error("Instruction relocation failed")]
    RelocationFailed = -200,

    #[error("Cannot relocate unsupported instruction")]
    UnsupportedInstruction = -201,

    #[error("Not enough bytes available to patch")]
    CodeTooShort = -202,

    #[error("Failed to generate trampoline")]
    TrampolineGeneration = -300,

    #[error("Failed to build routing")]
    RoutingBuild = -301,
}

impl HookError {
    /// Stable numeric code for this error
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Reverse mapping from a raw code; unknown codes collapse to `Unknown`
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => return None,
            -1 => Self::InvalidArgument,
            -2 => Self::NotFound,
            -3 => Self::AlreadyExists,
            -4 => Self::NotSupported,
            -100 => Self::MemoryAllocation,
            -101 => Self::MemoryProtection,
            -102 => Self::MemoryOperation,
            -103 => Self::NearMemoryExhausted,
            -200 => Self::RelocationFailed,
            -201 => Self::UnsupportedInstruction,
            -202 => Self::CodeTooShort,
            -300 => Self::TrampolineGeneration,
            -301 => Self::RoutingBuild,
            _ => Self::Unknown,
        })
    }
}

/// Success code stored in the last-error slot when a call completes cleanly
pub const SUCCESS: i32 = 0;

thread_local! {
    static LAST_ERROR: Cell<i32> = const { Cell::new(SUCCESS) };
}

/// Record the outcome of a public call in the calling thread's slot
pub(crate) fn set_last_error(code: i32) {
    LAST_ERROR.with(|slot| slot.set(code));
}

/// Last error code set by the most recent public call on this thread.
/// 0 means the call succeeded.
pub fn get_last_error() -> i32 {
    LAST_ERROR.with(|slot| slot.get())
}

/// Constant human-readable message for an error code. Never panics.
pub fn error_string(code: i32) -> &'static str {
    match code {
        SUCCESS => "Success",
        -1 => "Invalid argument (null pointer or invalid parameter)",
        -2 => "Hook or entry not found",
        -3 => "Address already hooked or instrumented",
        -4 => "Operation not supported on this platform or architecture",
        -5 => "Unknown error",
        -100 => "Memory allocation failed",
        -101 => "Failed to change memory protection",
        -102 => "Memory operation failed",
        -103 => "No near memory available for trampoline",
        -200 => "Instruction relocation failed",
        -201 => "Cannot relocate unsupported instruction",
        -202 => "Not enough bytes available to patch",
        -300 => "Failed to generate trampoline",
        -301 => "Failed to build routing",
        _ => "Unknown error code",
    }
}

/// Run a fallible public operation and mirror its outcome into the
/// thread-local slot before handing the result back.
pub(crate) fn record<T>(result: Result<T, HookError>) -> Result<T, HookError> {
    match &result {
        Ok(_) => set_last_error(SUCCESS),
        Err(e) => set_last_error(e.code()),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_grouped_by_decade() {
        assert_eq!(HookError::InvalidArgument.code(), -1);
        assert_eq!(HookError::MemoryAllocation.code(), -100);
        assert_eq!(HookError::RelocationFailed.code(), -200);
        assert_eq!(HookError::RoutingBuild.code(), -301);
    }

    #[test]
    fn test_error_string_total() {
        for code in [0, -1, -2, -3, -4, -5, -100, -101, -102, -103, -200, -201, -202, -300, -301] {
            assert!(!error_string(code).is_empty());
        }
        assert_eq!(error_string(-9999), "Unknown error code");
    }

    #[test]
    fn test_last_error_roundtrip() {
        let _ = record::<()>(Err(HookError::NotFound));
        assert_eq!(get_last_error(), HookError::NotFound.code());

        let _ = record(Ok(()));
        assert_eq!(get_last_error(), SUCCESS);
    }

    #[test]
    fn test_from_code() {
        assert_eq!(HookError::from_code(0), None);
        assert_eq!(HookError::from_code(-103), Some(HookError::NearMemoryExhausted));
        assert_eq!(HookError::from_code(-77), Some(HookError::Unknown));
    }
}
