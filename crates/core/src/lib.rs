//! hookforge core - inline hooking and dynamic instrumentation
//!
//! Given the address of a function in the current process, this crate either
//! replaces it with a substitute of identical signature while keeping the
//! original callable ([`install_hook`]), or interposes pre/post callbacks
//! that see the full register state without changing the function's behavior
//! ([`install_instrument`], [`install_instrument_ex`]). Both are reversible
//! with [`uninstall`].
//!
//! # Example
//!
//! ```ignore
//! unsafe extern "C" fn fake_open(path: *const c_char, flags: c_int) -> c_int {
//!     // inspect, then forward
//!     orig_open(path, flags)
//! }
//!
//! let addr = hookforge_core::resolve_symbol(None, "open").unwrap();
//! let orig = unsafe { hookforge_core::install_hook(addr, fake_open as usize as *mut _)? };
//! ```
//!
//! # Concurrency
//!
//! All entry points may be called from any thread. The patch write is the
//! last step of an installation, so a partially built hook is never visible.
//! Patching is not atomic against a thread already executing inside the first
//! patched bytes; keeping the patch minimal is the only mitigation.

use std::ffi::c_void;
use std::sync::Once;

pub mod codegen;
pub mod config;
pub mod error;
pub mod imports;
pub mod interceptor;
pub mod memory;

pub use codegen::arch::RegisterContext;
pub use config::{
    register_alloc_near_code_callback, set_near_trampoline, set_options, AllocNearCodeCallback,
};
pub use error::{error_string, get_last_error, HookError};
pub use interceptor::InstrumentCallback;

#[doc(hidden)]
pub use paste::paste;

use error::record;
use interceptor::{bridge, routing, Entry};

/// Library version string
pub fn get_version() -> &'static str {
    concat!("hookforge-", env!("CARGO_PKG_VERSION"))
}

static INIT: Once = Once::new();

/// Initialize logging and print the banner. Optional; safe to call more than
/// once. Without it the library performs no I/O.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        tracing::info!("================================");
        tracing::info!("{}", get_version());
        tracing::info!("================================");
    });
}

/// Strip the Thumb encoding bit on ARM; identity elsewhere
fn normalize_victim(address: *mut c_void) -> (usize, bool) {
    #[cfg(target_arch = "arm")]
    {
        let raw = address as usize;
        (raw & !1, raw & 1 == 1)
    }
    #[cfg(not(target_arch = "arm"))]
    {
        (address as usize, false)
    }
}

/// Install an inline hook: the victim at `address` is redirected to
/// `substitute`, and the returned pointer calls the original.
///
/// # Safety
/// `address` must be the entry of a function in this process and
/// `substitute` must have an identical signature and ABI.
pub unsafe fn install_hook(
    address: *mut c_void,
    substitute: *mut c_void,
) -> Result<*mut c_void, HookError> {
    record(install_hook_inner(address, substitute))
}

unsafe fn install_hook_inner(
    address: *mut c_void,
    substitute: *mut c_void,
) -> Result<*mut c_void, HookError> {
    if address.is_null() || substitute.is_null() {
        tracing::error!("install_hook: null address or substitute");
        return Err(HookError::InvalidArgument);
    }

    let (victim, thumb) = normalize_victim(address);
    tracing::debug!("----- install_hook {:#x} -> {:p} -----", victim, substitute);

    if interceptor::shared().contains(victim) {
        tracing::error!("{:#x} already hooked", victim);
        return Err(HookError::AlreadyExists);
    }

    let mut entry = Box::new(Entry::new(victim));
    entry.substitute_addr = substitute as usize;
    #[cfg(target_arch = "arm")]
    {
        entry.arm_thumb_mode = thumb;
    }

    let patch = match routing::build_routing(&mut entry, substitute as usize) {
        Ok(patch) => patch,
        Err(err) => {
            routing::free_entry_blocks(&entry);
            return Err(err);
        }
    };

    // Reinsert the Thumb bit so the handle is callable from outside.
    let original = entry.relocated.start() | usize::from(thumb);

    activate(entry, &patch)?;

    tracing::info!("hooked {:#x}, original at {:#x}", victim, original);
    Ok(original as *mut c_void)
}

/// Install pre-only instrumentation on `address`.
///
/// # Safety
/// `address` must be the entry of a function in this process.
pub unsafe fn install_instrument(
    address: *mut c_void,
    pre: InstrumentCallback,
) -> Result<(), HookError> {
    record(install_instrument_inner(address, Some(pre), None))
}

/// Install instrumentation with pre- and/or post-execution callbacks; at
/// least one must be given. The post callback observes the return state and
/// runs on the same thread as its matching pre.
///
/// # Safety
/// `address` must be the entry of a function in this process.
pub unsafe fn install_instrument_ex(
    address: *mut c_void,
    pre: Option<InstrumentCallback>,
    post: Option<InstrumentCallback>,
) -> Result<(), HookError> {
    record(install_instrument_inner(address, pre, post))
}

unsafe fn install_instrument_inner(
    address: *mut c_void,
    pre: Option<InstrumentCallback>,
    post: Option<InstrumentCallback>,
) -> Result<(), HookError> {
    if address.is_null() {
        tracing::error!("install_instrument: null address");
        return Err(HookError::InvalidArgument);
    }
    if pre.is_none() && post.is_none() {
        tracing::error!("install_instrument: both handlers are null");
        return Err(HookError::InvalidArgument);
    }

    let (victim, _thumb) = normalize_victim(address);
    tracing::debug!("----- install_instrument {:#x} -----", victim);

    if interceptor::shared().contains(victim) {
        tracing::error!("{:#x} already instrumented", victim);
        return Err(HookError::AlreadyExists);
    }

    let mut entry = Box::new(Entry::new(victim));
    entry.pre_handler = pre;
    entry.post_handler = post;
    #[cfg(target_arch = "arm")]
    {
        entry.arm_thumb_mode = _thumb;
    }
    let entry_ptr: *mut Entry = &mut *entry;

    let tramp = match bridge::make_closure_trampoline(entry_ptr, bridge::instrument_routing_dispatch)
    {
        Ok(tramp) => tramp,
        Err(err) => {
            routing::free_entry_blocks(&entry);
            return Err(err);
        }
    };
    let forward_to = tramp.buffer.start();
    entry.instrument_tramp = Some(tramp);

    if post.is_some() {
        match bridge::make_closure_trampoline(entry_ptr, bridge::instrument_epilogue_dispatch) {
            Ok(epilogue) => {
                entry.epilogue_bridge_addr = epilogue.buffer.start();
                entry.epilogue_tramp = Some(epilogue);
            }
            Err(err) => {
                routing::free_entry_blocks(&entry);
                return Err(err);
            }
        }
    }

    let patch = match routing::build_routing(&mut entry, forward_to) {
        Ok(patch) => patch,
        Err(err) => {
            routing::free_entry_blocks(&entry);
            return Err(err);
        }
    };

    activate(entry, &patch)?;

    tracing::info!("instrumented {:#x}", victim);
    Ok(())
}

/// Final installation step: registry insertion, then the patch as the last
/// write. A patch failure rolls the entry back out.
unsafe fn activate(entry: Box<Entry>, patch: &[u8]) -> Result<(), HookError> {
    let victim = entry.victim_addr;

    if let Err(rejected) = interceptor::shared().insert(entry) {
        routing::free_entry_blocks(&rejected);
        return Err(HookError::AlreadyExists);
    }

    if let Err(err) = memory::patch::code_patch(victim as *mut u8, patch) {
        if let Some(entry) = interceptor::shared().take(victim) {
            routing::free_entry_blocks(&entry);
        }
        return Err(err);
    }
    Ok(())
}

/// Remove a hook or instrumentation and restore the original bytes.
///
/// # Safety
/// Any pointer to the original function obtained from [`install_hook`] is
/// invalid after this returns.
pub unsafe fn uninstall(address: *mut c_void) -> Result<(), HookError> {
    record(uninstall_inner(address))
}

unsafe fn uninstall_inner(address: *mut c_void) -> Result<(), HookError> {
    if address.is_null() {
        tracing::error!("uninstall: null address");
        return Err(HookError::InvalidArgument);
    }

    let (victim, _) = normalize_victim(address);
    let entry = interceptor::shared().take(victim).ok_or(HookError::NotFound)?;

    let restored = memory::patch::code_patch(victim as *mut u8, &entry.origin_bytes);
    routing::free_entry_blocks(&entry);
    restored?;

    tracing::info!("uninstalled {:#x}", victim);
    Ok(())
}

/// Write raw bytes over code at `address` (protection round trip included).
///
/// # Safety
/// See [`memory::patch::code_patch`].
pub unsafe fn patch_code(address: *mut c_void, bytes: &[u8]) -> Result<(), HookError> {
    record(memory::patch::code_patch(address as *mut u8, bytes))
}

/// Resolve `symbol` from a loaded `image` (or the whole process with `None`)
pub fn resolve_symbol(image: Option<&str>, symbol: &str) -> Option<*mut c_void> {
    match hookforge_runtime::resolve(image, symbol) {
        Some(addr) => {
            error::set_last_error(error::SUCCESS);
            Some(addr as *mut c_void)
        }
        None => {
            error::set_last_error(HookError::NotFound.code());
            None
        }
    }
}

/// Replace `symbol` in `image`'s import table, returning the previous target.
/// Only callers importing through that image observe the substitute.
///
/// # Safety
/// `substitute` must match the imported symbol's signature and ABI.
pub unsafe fn replace_import(
    image: &str,
    symbol: &str,
    substitute: *mut c_void,
) -> Result<*mut c_void, HookError> {
    record(imports::replace_import(image, symbol, substitute as usize))
        .map(|orig| orig as *mut c_void)
}

/// Declare a `fake_NAME` / `orig_NAME` pair plus an `install_hook_NAME(addr)`
/// installer, mirroring the classic C helper macro.
///
/// # Example
/// ```ignore
/// install_hook_name! {
///     open, fn(path: *const c_char, flags: c_int) -> c_int {
///         orig_open(path, flags)
///     }
/// }
///
/// unsafe { install_hook_open(open_addr)?; }
/// ```
#[macro_export]
macro_rules! install_hook_name {
    (
        $(#[$meta:meta])*
        $name:ident, fn($($arg:ident : $ty:ty),* $(,)?) $(-> $ret:ty)? $body:block
    ) => {
        $crate::paste! {
            #[allow(non_upper_case_globals)]
            static [<orig_ $name _addr>]: ::std::sync::atomic::AtomicUsize =
                ::std::sync::atomic::AtomicUsize::new(0);

            $(#[$meta])*
            unsafe extern "C" fn [<fake_ $name>]($($arg: $ty),*) $(-> $ret)? $body

            /// Call through to the unhooked original.
            #[allow(dead_code)]
            unsafe fn [<orig_ $name>]($($arg: $ty),*) $(-> $ret)? {
                let addr = [<orig_ $name _addr>].load(::std::sync::atomic::Ordering::Acquire);
                let orig: unsafe extern "C" fn($($ty),*) $(-> $ret)? =
                    ::std::mem::transmute(addr);
                orig($($arg),*)
            }

            #[allow(dead_code)]
            unsafe fn [<install_hook_ $name>](
                addr: *mut ::core::ffi::c_void,
            ) -> ::core::result::Result<(), $crate::HookError> {
                let fake: unsafe extern "C" fn($($ty),*) $(-> $ret)? = [<fake_ $name>];
                let orig = $crate::install_hook(addr, fake as usize as *mut ::core::ffi::c_void)?;
                [<orig_ $name _addr>].store(orig as usize, ::std::sync::atomic::Ordering::Release);
                Ok(())
            }
        }
    };
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use std::hint::black_box;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    fn fn_addr<T: Copy>(f: T) -> *mut c_void {
        assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<usize>());
        // Fn-pointer-shaped values only; used with the victims below.
        unsafe { *(&f as *const T as *const *mut c_void) }
    }

    // Distinct victims per test so parallel tests never share a patch site.

    #[inline(never)]
    extern "C" fn victim_round_trip(a: u64, b: u64) -> u64 {
        black_box(a.wrapping_mul(3).wrapping_add(b))
    }

    static ROUND_TRIP_ORIG: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn fake_round_trip(a: u64, b: u64) -> u64 {
        let orig: extern "C" fn(u64, u64) -> u64 =
            std::mem::transmute(ROUND_TRIP_ORIG.load(Ordering::Acquire));
        orig(a, b) + 1
    }

    #[test]
    fn test_hook_call_uninstall_round_trip() {
        let victim: extern "C" fn(u64, u64) -> u64 = victim_round_trip;
        let addr = fn_addr(victim);
        let before = unsafe { std::slice::from_raw_parts(addr as *const u8, 16) }.to_vec();

        assert_eq!(victim(2, 5), 11);

        let fake: unsafe extern "C" fn(u64, u64) -> u64 = fake_round_trip;
        let orig = unsafe { install_hook(addr, fn_addr(fake)) }.expect("install");
        ROUND_TRIP_ORIG.store(orig as usize, Ordering::Release);

        assert_eq!(black_box(victim)(2, 5), 12);

        // The original stays callable through the relocated head.
        let orig_fn: extern "C" fn(u64, u64) -> u64 = unsafe { std::mem::transmute(orig) };
        assert_eq!(orig_fn(2, 5), 11);

        unsafe { uninstall(addr) }.expect("uninstall");
        assert_eq!(black_box(victim)(2, 5), 11);

        let after = unsafe { std::slice::from_raw_parts(addr as *const u8, 16) }.to_vec();
        assert_eq!(before, after, "victim bytes must be restored byte-exact");
    }

    #[inline(never)]
    extern "C" fn victim_already(a: u64) -> u64 {
        black_box(a.wrapping_add(7))
    }

    unsafe extern "C" fn fake_already(a: u64) -> u64 {
        a
    }

    #[test]
    fn test_double_install_already_exists() {
        let addr = fn_addr(victim_already as extern "C" fn(u64) -> u64);
        let fake = fn_addr(fake_already as unsafe extern "C" fn(u64) -> u64);

        unsafe { install_hook(addr, fake) }.expect("first install");
        let err = unsafe { install_hook(addr, fake) }.unwrap_err();
        assert_eq!(err, HookError::AlreadyExists);
        assert_eq!(get_last_error(), HookError::AlreadyExists.code());

        unsafe { uninstall(addr) }.expect("uninstall");
        assert_eq!(black_box(victim_already as extern "C" fn(u64) -> u64)(1), 8);
    }

    #[test]
    fn test_uninstall_unknown_not_found() {
        let err = unsafe { uninstall(0x1248_1248 as *mut c_void) }.unwrap_err();
        assert_eq!(err, HookError::NotFound);
        assert_eq!(get_last_error(), HookError::NotFound.code());

        // Safe to retry.
        let err = unsafe { uninstall(0x1248_1248 as *mut c_void) }.unwrap_err();
        assert_eq!(err, HookError::NotFound);
    }

    #[test]
    fn test_patch_code_null_invalid_argument() {
        let err = unsafe { patch_code(std::ptr::null_mut(), &[0x90]) }.unwrap_err();
        assert_eq!(err, HookError::InvalidArgument);
        assert_eq!(get_last_error(), HookError::InvalidArgument.code());
    }

    #[test]
    fn test_instrument_requires_a_handler() {
        let addr = 0x1000 as *mut c_void;
        let err = unsafe { install_instrument_ex(addr, None, None) }.unwrap_err();
        assert_eq!(err, HookError::InvalidArgument);
    }

    #[test]
    fn test_hook_exit_form_unsupported() {
        // A victim that is nothing but `ret`: no room to relocate a patch.
        let block = memory::allocator::shared().alloc_exec_block(16).unwrap();
        unsafe {
            memory::patch::code_patch(block.start() as *mut u8, &[0xC3; 8]).unwrap();
        }
        let before =
            unsafe { std::slice::from_raw_parts(block.start() as *const u8, 8) }.to_vec();

        let fake = fn_addr(fake_already as unsafe extern "C" fn(u64) -> u64);
        let err = unsafe { install_hook(block.start() as *mut c_void, fake) }.unwrap_err();
        assert_eq!(err, HookError::UnsupportedInstruction);

        let after = unsafe { std::slice::from_raw_parts(block.start() as *const u8, 8) }.to_vec();
        assert_eq!(before, after, "failed install must not touch the victim");
        assert!(!interceptor::shared().contains(block.start()));
        memory::allocator::shared().free_block(block);
    }

    // --- instrumentation scenarios ---

    #[inline(never)]
    extern "C" fn victim_strlen(s: *const u8) -> u64 {
        let mut n = 0u64;
        unsafe {
            while *s.add(n as usize) != 0 {
                n += 1;
            }
        }
        black_box(n)
    }

    static PRE_CALLS: AtomicU64 = AtomicU64::new(0);
    static POST_VALUES: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    unsafe extern "C" fn pre_count(_addr: *mut c_void, _ctx: *mut RegisterContext) {
        PRE_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn post_record(_addr: *mut c_void, ctx: *mut RegisterContext) {
        POST_VALUES.lock().push((*ctx).return_value());
    }

    #[test]
    fn test_instrument_pre_post_observe_calls() {
        let victim: extern "C" fn(*const u8) -> u64 = victim_strlen;
        let addr = fn_addr(victim);

        unsafe { install_instrument_ex(addr, Some(pre_count), Some(post_record)) }
            .expect("instrument");

        assert_eq!(black_box(victim)(c"Hello".as_ptr() as *const u8), 5);
        assert_eq!(black_box(victim)(c"".as_ptr() as *const u8), 0);

        assert_eq!(PRE_CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(*POST_VALUES.lock(), vec![5, 0]);

        unsafe { uninstall(addr) }.expect("uninstall");
        assert_eq!(black_box(victim)(c"abc".as_ptr() as *const u8), 3);
    }

    #[inline(never)]
    extern "C" fn victim_double(x: u64) -> u64 {
        black_box(x.wrapping_mul(2))
    }

    unsafe extern "C" fn pre_rewrite_arg(_addr: *mut c_void, ctx: *mut RegisterContext) {
        (*ctx).set_arg(0, 21);
    }

    unsafe extern "C" fn post_rewrite_ret(_addr: *mut c_void, ctx: *mut RegisterContext) {
        (*ctx).set_return_value(1234);
    }

    #[test]
    fn test_register_context_mutation_round_trips() {
        let victim: extern "C" fn(u64) -> u64 = victim_double;
        let addr = fn_addr(victim);

        // Pre-handler rewrites the first argument register.
        unsafe { install_instrument(addr, pre_rewrite_arg) }.expect("instrument");
        assert_eq!(black_box(victim)(5), 42);
        unsafe { uninstall(addr) }.expect("uninstall");
        assert_eq!(black_box(victim)(5), 10);

        // Post-handler rewrites the return register.
        unsafe { install_instrument_ex(addr, None, Some(post_rewrite_ret)) }.expect("instrument");
        assert_eq!(black_box(victim)(5), 1234);
        unsafe { uninstall(addr) }.expect("uninstall");
        assert_eq!(black_box(victim)(5), 10);
    }

    // Nested instrumentation: outer calls inner, both with pre/post.

    static NEST_EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    #[inline(never)]
    extern "C" fn victim_inner(x: u64) -> u64 {
        black_box(x.wrapping_add(1))
    }

    #[inline(never)]
    extern "C" fn victim_outer(x: u64) -> u64 {
        let inner: extern "C" fn(u64) -> u64 = black_box(victim_inner as extern "C" fn(u64) -> u64);
        black_box(inner(x).wrapping_mul(10))
    }

    unsafe extern "C" fn pre_outer(_a: *mut c_void, _c: *mut RegisterContext) {
        NEST_EVENTS.lock().push("pre_outer");
    }
    unsafe extern "C" fn post_outer(_a: *mut c_void, _c: *mut RegisterContext) {
        NEST_EVENTS.lock().push("post_outer");
    }
    unsafe extern "C" fn pre_inner(_a: *mut c_void, _c: *mut RegisterContext) {
        NEST_EVENTS.lock().push("pre_inner");
    }
    unsafe extern "C" fn post_inner(_a: *mut c_void, _c: *mut RegisterContext) {
        NEST_EVENTS.lock().push("post_inner");
    }

    #[test]
    fn test_nested_instrumentation_is_lifo() {
        let outer = fn_addr(victim_outer as extern "C" fn(u64) -> u64);
        let inner = fn_addr(victim_inner as extern "C" fn(u64) -> u64);

        unsafe {
            install_instrument_ex(outer, Some(pre_outer), Some(post_outer)).expect("outer");
            install_instrument_ex(inner, Some(pre_inner), Some(post_inner)).expect("inner");
        }

        assert_eq!(black_box(victim_outer as extern "C" fn(u64) -> u64)(4), 50);
        assert_eq!(
            *NEST_EVENTS.lock(),
            vec!["pre_outer", "pre_inner", "post_inner", "post_outer"]
        );

        unsafe {
            uninstall(outer).expect("outer");
            uninstall(inner).expect("inner");
        }
        assert_eq!(black_box(victim_outer as extern "C" fn(u64) -> u64)(4), 50);
    }

    // Concurrent installs on distinct addresses.

    #[inline(never)]
    extern "C" fn victim_thread_a(x: u64) -> u64 {
        black_box(x ^ 0x55)
    }

    #[inline(never)]
    extern "C" fn victim_thread_b(x: u64) -> u64 {
        black_box(x ^ 0xAA)
    }

    unsafe extern "C" fn fake_thread_a(_x: u64) -> u64 {
        111
    }

    unsafe extern "C" fn fake_thread_b(_x: u64) -> u64 {
        222
    }

    #[test]
    fn test_concurrent_installs_on_distinct_victims() {
        let a = std::thread::spawn(|| {
            let addr = fn_addr(victim_thread_a as extern "C" fn(u64) -> u64);
            unsafe {
                install_hook(addr, fn_addr(fake_thread_a as unsafe extern "C" fn(u64) -> u64))
            }
            .map(|_| addr as usize)
        });
        let b = std::thread::spawn(|| {
            let addr = fn_addr(victim_thread_b as extern "C" fn(u64) -> u64);
            unsafe {
                install_hook(addr, fn_addr(fake_thread_b as unsafe extern "C" fn(u64) -> u64))
            }
            .map(|_| addr as usize)
        });

        let addr_a = a.join().unwrap().expect("thread a install") as *mut c_void;
        let addr_b = b.join().unwrap().expect("thread b install") as *mut c_void;
        assert!(interceptor::shared().count() >= 2);

        assert_eq!(black_box(victim_thread_a as extern "C" fn(u64) -> u64)(0), 111);
        assert_eq!(black_box(victim_thread_b as extern "C" fn(u64) -> u64)(0), 222);

        unsafe {
            uninstall(addr_a).expect("a");
            uninstall(addr_b).expect("b");
        }
        assert_eq!(black_box(victim_thread_a as extern "C" fn(u64) -> u64)(1), 1 ^ 0x55);
        assert_eq!(black_box(victim_thread_b as extern "C" fn(u64) -> u64)(1), 1 ^ 0xAA);
    }

    // The convenience macro end to end.

    #[inline(never)]
    extern "C" fn victim_scaled(x: u64) -> u64 {
        black_box(x.wrapping_add(2))
    }

    install_hook_name! {
        scaled, fn(x: u64) -> u64 {
            orig_scaled(x) * 10
        }
    }

    #[test]
    fn test_install_hook_name_macro() {
        let addr = fn_addr(victim_scaled as extern "C" fn(u64) -> u64);

        unsafe { install_hook_scaled(addr) }.expect("macro install");
        assert_eq!(black_box(victim_scaled as extern "C" fn(u64) -> u64)(4), 60);

        unsafe { uninstall(addr) }.expect("uninstall");
        assert_eq!(black_box(victim_scaled as extern "C" fn(u64) -> u64)(4), 6);
    }

    #[test]
    fn test_version_and_banner() {
        assert!(get_version().starts_with("hookforge-"));
        init();
        init(); // idempotent
    }

    #[test]
    fn test_resolve_symbol_sets_last_error() {
        assert!(resolve_symbol(None, "no_such_symbol_hookforge").is_none());
        assert_eq!(get_last_error(), HookError::NotFound.code());

        let strlen = resolve_symbol(None, "strlen");
        assert!(strlen.is_some());
        assert_eq!(get_last_error(), error::SUCCESS);
    }
}
