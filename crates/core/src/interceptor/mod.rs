//! Interceptor registry
//!
//! One process-wide table keyed by victim address. The mutex covers only the
//! table itself; code generation and patch writes happen outside it.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::LazyLock;

use parking_lot::Mutex;

use crate::codegen::arch::RegisterContext;
use crate::memory::MemBlock;

pub mod bridge;
pub mod routing;

pub use bridge::{ClosureTrampoline, StackFrame};

/// Callback invoked around an instrumented function with its register snapshot
pub type InstrumentCallback = unsafe extern "C" fn(address: *mut c_void, ctx: *mut RegisterContext);

/// One record per hooked or instrumented address
pub struct Entry {
    /// Victim address; immutable after creation
    pub victim_addr: usize,

    /// Replacement function (hook mode only)
    pub substitute_addr: usize,

    /// Instrumentation handlers (instrument mode only)
    pub pre_handler: Option<InstrumentCallback>,
    pub post_handler: Option<InstrumentCallback>,

    /// Bytes inside the victim overwritten by the patch
    pub patched: MemBlock,

    /// Relocated head; ends with a branch back to `victim + patched.size`
    pub relocated: MemBlock,

    /// Forwarder block the patch jumps to
    pub forwarder: MemBlock,

    /// Copy of the victim bytes taken before patching; length == patched.size
    pub origin_bytes: Vec<u8>,

    /// Victim was a Thumb-encoded address (low bit set on input)
    #[cfg(target_arch = "arm")]
    pub arm_thumb_mode: bool,

    /// Epilogue closure trampoline address (instrument + post mode)
    pub epilogue_bridge_addr: usize,

    /// Owned closure trampolines; their stubs carry a pointer back to this
    /// entry as plain payload, borrowed for the entry's lifetime
    pub instrument_tramp: Option<Box<ClosureTrampoline>>,
    pub epilogue_tramp: Option<Box<ClosureTrampoline>>,
}

// SAFETY: entries are only mutated while privately owned during installation
// or teardown; the registry hands out no references across threads.
unsafe impl Send for Entry {}
unsafe impl Sync for Entry {}

impl Entry {
    pub fn new(victim_addr: usize) -> Self {
        Self {
            victim_addr,
            substitute_addr: 0,
            pre_handler: None,
            post_handler: None,
            patched: MemBlock::default(),
            relocated: MemBlock::default(),
            forwarder: MemBlock::default(),
            origin_bytes: Vec::new(),
            #[cfg(target_arch = "arm")]
            arm_thumb_mode: false,
            epilogue_bridge_addr: 0,
            instrument_tramp: None,
            epilogue_tramp: None,
        }
    }
}

/// Process-wide entry table
pub struct Interceptor {
    entries: Mutex<HashMap<usize, Box<Entry>>>,
}

static INTERCEPTOR: LazyLock<Interceptor> = LazyLock::new(|| Interceptor {
    entries: Mutex::new(HashMap::new()),
});

/// The process-wide registry instance
pub fn shared() -> &'static Interceptor {
    &INTERCEPTOR
}

impl Interceptor {
    pub fn contains(&self, addr: usize) -> bool {
        self.entries.lock().contains_key(&addr)
    }

    /// Insert a fully built entry; existence check and insertion are one
    /// critical section. A rejected entry is handed back so the caller can
    /// release its blocks.
    pub fn insert(&self, entry: Box<Entry>) -> Result<(), Box<Entry>> {
        let mut entries = self.entries.lock();
        match entries.entry(entry.victim_addr) {
            std::collections::hash_map::Entry::Occupied(_) => Err(entry),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Remove and return the entry for `addr`
    pub fn take(&self, addr: usize) -> Option<Box<Entry>> {
        self.entries.lock().remove(&addr)
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_most_one_entry_per_address() {
        let registry = Interceptor {
            entries: Mutex::new(HashMap::new()),
        };

        registry.insert(Box::new(Entry::new(0x4000))).ok().unwrap();
        let rejected = registry.insert(Box::new(Entry::new(0x4000))).unwrap_err();
        assert_eq!(rejected.victim_addr, 0x4000);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_take_removes() {
        let registry = Interceptor {
            entries: Mutex::new(HashMap::new()),
        };

        registry.insert(Box::new(Entry::new(0x5000))).ok().unwrap();
        assert!(registry.contains(0x5000));

        let entry = registry.take(0x5000).unwrap();
        assert_eq!(entry.victim_addr, 0x5000);
        assert!(!registry.contains(0x5000));
        assert!(registry.take(0x5000).is_none());
        assert_eq!(registry.count(), 0);
    }
}
