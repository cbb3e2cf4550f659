//! Closure bridge
//!
//! Per-entry executable stubs route into one process-singleton bridge that
//! snapshots the full register state, calls [`common_closure_bridge_handler`]
//! and resumes at whatever next hop the dispatcher selected. The instrument
//! dispatchers live here too, together with the per-thread call stacks that
//! pair pre- and post-handlers.

use std::ffi::c_void;
use std::sync::LazyLock;
use std::thread::ThreadId;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::codegen::arch::{self, RegisterContext};
use crate::error::HookError;
use crate::interceptor::Entry;
use crate::memory::{allocator, platform, MemBlock};

/// Dispatcher signature carried by a closure trampoline
pub type RoutingHandler = unsafe extern "C" fn(*mut Entry, *mut RegisterContext);

/// Per-entry executable stub plus the payload the bridge hands the dispatcher
pub struct ClosureTrampoline {
    /// Executable stub block
    pub buffer: MemBlock,

    /// Entry backing this trampoline; borrowed payload, never owned here
    pub carry_data: *mut Entry,

    /// Dispatcher the bridge routes to
    pub carry_handler: RoutingHandler,
}

// SAFETY: the payload pointer targets the boxed Entry, which outlives the
// trampoline and is torn down single-threadedly on uninstall.
unsafe impl Send for ClosureTrampoline {}
unsafe impl Sync for ClosureTrampoline {}

/// Per-invocation record for the post-handler return path
pub struct StackFrame {
    pub orig_ret: usize,
}

static CALL_STACKS: LazyLock<DashMap<ThreadId, Vec<StackFrame>>> = LazyLock::new(DashMap::new);

fn push_stack_frame(frame: StackFrame) {
    CALL_STACKS
        .entry(std::thread::current().id())
        .or_default()
        .push(frame);
}

fn pop_stack_frame() -> Option<StackFrame> {
    CALL_STACKS
        .get_mut(&std::thread::current().id())
        .and_then(|mut stack| stack.pop())
}

static CLOSURE_BRIDGE: Mutex<usize> = Mutex::new(0);

/// Address of the singleton bridge stub, built on first use
pub fn closure_bridge_addr() -> Result<usize, HookError> {
    let mut slot = CLOSURE_BRIDGE.lock();
    if *slot == 0 {
        let handler: unsafe extern "C" fn(*mut RegisterContext, *mut ClosureTrampoline) =
            common_closure_bridge_handler;
        let code = arch::emit_closure_bridge(handler as usize);

        let block = allocator::shared().alloc_exec_block(code.size())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                code.bytes().as_ptr(),
                block.start() as *mut u8,
                code.size(),
            );
        }
        platform::clear_icache(block.start(), code.size());

        tracing::debug!("closure bridge at {:#x} ({} bytes)", block.start(), code.size());
        *slot = block.start();
    }
    Ok(*slot)
}

/// Called by the bridge stub with the on-stack register context and the
/// trampoline whose stub was entered.
pub unsafe extern "C" fn common_closure_bridge_handler(
    ctx: *mut RegisterContext,
    tramp: *mut ClosureTrampoline,
) {
    let tramp = &*tramp;
    (tramp.carry_handler)(tramp.carry_data, ctx);
}

/// Build a closure trampoline stub for `entry`, routed to `handler`
pub fn make_closure_trampoline(
    carry_data: *mut Entry,
    carry_handler: RoutingHandler,
) -> Result<Box<ClosureTrampoline>, HookError> {
    let bridge = closure_bridge_addr()?;

    let mut tramp = Box::new(ClosureTrampoline {
        buffer: MemBlock::default(),
        carry_data,
        carry_handler,
    });

    let code = arch::emit_closure_trampoline(&*tramp as *const ClosureTrampoline as usize, bridge);
    let block = allocator::shared().alloc_exec_block(code.size())?;
    unsafe {
        std::ptr::copy_nonoverlapping(code.bytes().as_ptr(), block.start() as *mut u8, code.size());
    }
    platform::clear_icache(block.start(), code.size());

    tramp.buffer = block;
    tracing::debug!("closure trampoline at {:#x}", block.start());
    Ok(tramp)
}

/// Pre-execution dispatcher: run the pre-handler, arm the epilogue return
/// path when a post-handler exists, and continue into the relocated head.
pub unsafe extern "C" fn instrument_routing_dispatch(
    entry: *mut Entry,
    ctx: *mut RegisterContext,
) {
    let entry_ref = &*entry;

    if let Some(pre) = entry_ref.pre_handler {
        pre(entry_ref.victim_addr as *mut c_void, ctx);
    }

    if entry_ref.post_handler.is_some() && entry_ref.epilogue_bridge_addr != 0 {
        push_stack_frame(StackFrame {
            orig_ret: arch::func_ret_address(&*ctx),
        });
        arch::set_func_ret_address(&mut *ctx, entry_ref.epilogue_bridge_addr);
    }

    // A Thumb victim's relocated head is Thumb code; the hop interworks.
    #[cfg(target_arch = "arm")]
    let hop = entry_ref.relocated.start() | usize::from(entry_ref.arm_thumb_mode);
    #[cfg(not(target_arch = "arm"))]
    let hop = entry_ref.relocated.start();
    arch::set_next_hop(&mut *ctx, hop);
}

/// Post-execution dispatcher: unwind the matching stack frame, run the
/// post-handler over the return state, resume at the original return address.
pub unsafe extern "C" fn instrument_epilogue_dispatch(
    entry: *mut Entry,
    ctx: *mut RegisterContext,
) {
    let Some(frame) = pop_stack_frame() else {
        // Only reachable when the target bypassed its armed return path
        // (tail call, longjmp); there is nowhere sane to resume.
        tracing::error!("epilogue dispatch with an empty call stack");
        return;
    };

    if let Some(post) = (*entry).post_handler {
        post((*entry).victim_addr as *mut c_void, ctx);
    }

    arch::set_next_hop(&mut *ctx, frame.orig_ret);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_singleton() {
        let a = closure_bridge_addr().unwrap();
        let b = closure_bridge_addr().unwrap();
        assert_ne!(a, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_call_stack_lifo_per_thread() {
        push_stack_frame(StackFrame { orig_ret: 1 });
        push_stack_frame(StackFrame { orig_ret: 2 });

        let other = std::thread::spawn(|| {
            assert!(pop_stack_frame().is_none());
            push_stack_frame(StackFrame { orig_ret: 99 });
            pop_stack_frame().unwrap().orig_ret
        })
        .join()
        .unwrap();
        assert_eq!(other, 99);

        assert_eq!(pop_stack_frame().unwrap().orig_ret, 2);
        assert_eq!(pop_stack_frame().unwrap().orig_ret, 1);
        assert!(pop_stack_frame().is_none());
    }

    #[test]
    fn test_closure_trampoline_points_at_entry() {
        let mut entry = Box::new(Entry::new(0x1234));
        let tramp =
            make_closure_trampoline(&mut *entry as *mut Entry, instrument_routing_dispatch)
                .unwrap();
        assert!(!tramp.buffer.is_null());
        assert_eq!(tramp.carry_data as usize, &*entry as *const Entry as usize);
        allocator::shared().free_block(tramp.buffer);
    }
}
