//! Import-table replacement
//!
//! Redirects a symbol at the importing image's GOT slot instead of patching
//! code. Visibility is per-image: only calls routed through that image's
//! import table see the substitute. Shares the error taxonomy with the
//! inline path but none of its trampoline machinery.

use crate::error::HookError;

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
mod elf {
    use std::ffi::{c_char, c_int, c_void, CStr};

    use crate::error::HookError;
    use crate::memory::patch;

    const DT_NULL: i64 = 0;
    const DT_PLTRELSZ: i64 = 2;
    const DT_STRTAB: i64 = 5;
    const DT_SYMTAB: i64 = 6;
    const DT_JMPREL: i64 = 23;

    #[cfg(target_arch = "x86_64")]
    const R_JUMP_SLOT: u32 = 7; // R_X86_64_JUMP_SLOT
    #[cfg(target_arch = "aarch64")]
    const R_JUMP_SLOT: u32 = 1026; // R_AARCH64_JUMP_SLOT

    #[repr(C)]
    struct ElfDyn {
        d_tag: i64,
        d_val: u64,
    }

    #[repr(C)]
    #[allow(dead_code)] // layout-only fields
    struct ElfSym {
        st_name: u32,
        st_info: u8,
        st_other: u8,
        st_shndx: u16,
        st_value: u64,
        st_size: u64,
    }

    #[repr(C)]
    #[allow(dead_code)]
    struct ElfRela {
        r_offset: u64,
        r_info: u64,
        r_addend: i64,
    }

    struct Search<'a> {
        image: &'a str,
        exe_path: String,
        symbol: &'a str,
        slot: Option<usize>,
    }

    /// Dynamic-table pointers may be pre- or post-relocation depending on the
    /// loader; values below the load base still need the base added.
    fn rebase(value: u64, base: usize) -> usize {
        if (value as usize) < base {
            base + value as usize
        } else {
            value as usize
        }
    }

    unsafe extern "C" fn phdr_callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let search = &mut *(data as *mut Search);
        let info = &*info;

        let name = if info.dlpi_name.is_null() {
            ""
        } else {
            CStr::from_ptr(info.dlpi_name).to_str().unwrap_or("")
        };
        // The main executable reports an empty name.
        let path = if name.is_empty() { search.exe_path.as_str() } else { name };
        if !path.contains(search.image) {
            return 0;
        }

        let base = info.dlpi_addr as usize;
        let mut jmprel = 0u64;
        let mut pltrelsz = 0u64;
        let mut symtab = 0u64;
        let mut strtab = 0u64;

        for i in 0..info.dlpi_phnum {
            let phdr = &*info.dlpi_phdr.add(i as usize);
            if phdr.p_type != libc::PT_DYNAMIC {
                continue;
            }
            let mut dyn_entry = (base + phdr.p_vaddr as usize) as *const ElfDyn;
            while (*dyn_entry).d_tag != DT_NULL {
                match (*dyn_entry).d_tag {
                    DT_JMPREL => jmprel = (*dyn_entry).d_val,
                    DT_PLTRELSZ => pltrelsz = (*dyn_entry).d_val,
                    DT_SYMTAB => symtab = (*dyn_entry).d_val,
                    DT_STRTAB => strtab = (*dyn_entry).d_val,
                    _ => {}
                }
                dyn_entry = dyn_entry.add(1);
            }
        }
        if jmprel == 0 || pltrelsz == 0 || symtab == 0 || strtab == 0 {
            return 0;
        }

        let relas = rebase(jmprel, base) as *const ElfRela;
        let symbols = rebase(symtab, base) as *const ElfSym;
        let strings = rebase(strtab, base) as *const c_char;
        let count = pltrelsz as usize / std::mem::size_of::<ElfRela>();

        for i in 0..count {
            let rela = &*relas.add(i);
            if (rela.r_info & 0xffff_ffff) as u32 != R_JUMP_SLOT {
                continue;
            }
            let sym = &*symbols.add((rela.r_info >> 32) as usize);
            let name = CStr::from_ptr(strings.add(sym.st_name as usize));
            if name.to_bytes() == search.symbol.as_bytes() {
                search.slot = Some(base + rela.r_offset as usize);
                return 1;
            }
        }
        0
    }

    pub(super) unsafe fn replace(
        image: &str,
        symbol: &str,
        substitute: usize,
    ) -> Result<usize, HookError> {
        let mut search = Search {
            image,
            exe_path: std::env::current_exe()
                .ok()
                .and_then(|p| p.to_str().map(String::from))
                .unwrap_or_default(),
            symbol,
            slot: None,
        };

        libc::dl_iterate_phdr(
            Some(phdr_callback),
            &mut search as *mut Search as *mut c_void,
        );

        let slot = search.slot.ok_or(HookError::NotFound)?;
        let original = *(slot as *const usize);

        // The slot may sit in a RELRO segment; the patch primitive already
        // handles the protection round trip.
        patch::code_patch(slot as *mut u8, &substitute.to_ne_bytes())?;

        tracing::info!(
            "import {} of {:?} redirected: {:#x} -> {:#x}",
            symbol,
            image,
            original,
            substitute
        );
        Ok(original)
    }
}

/// Replace `symbol` in `image`'s import table with `substitute`, returning
/// the previous slot value.
///
/// # Safety
/// `substitute` must be a function with the imported symbol's exact signature
/// and ABI; every future call through that import goes to it.
pub unsafe fn replace_import(
    image: &str,
    symbol: &str,
    substitute: usize,
) -> Result<usize, HookError> {
    if substitute == 0 || symbol.is_empty() {
        return Err(HookError::InvalidArgument);
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    {
        elf::replace(image, symbol, substitute)
    }

    #[cfg(not(all(target_os = "linux", target_pointer_width = "64")))]
    {
        let _ = image;
        tracing::error!("import replacement is not available on this platform");
        Err(HookError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_arguments_rejected() {
        let err = unsafe { replace_import("libc", "", 0x1000) }.unwrap_err();
        assert_eq!(err, HookError::InvalidArgument);
        let err = unsafe { replace_import("libc", "malloc", 0) }.unwrap_err();
        assert_eq!(err, HookError::InvalidArgument);
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn test_unknown_import_not_found() {
        let err = unsafe { replace_import("", "no_such_import_symbol_xyz", 0x1000) }.unwrap_err();
        assert_eq!(err, HookError::NotFound);
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn test_redirect_own_malloc_import() {
        use std::ffi::c_void;
        use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

        static CALLS: AtomicU64 = AtomicU64::new(0);
        static ORIG: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn counting_malloc(size: usize) -> *mut c_void {
            CALLS.fetch_add(1, Ordering::SeqCst);
            let orig: unsafe extern "C" fn(usize) -> *mut c_void =
                std::mem::transmute(ORIG.load(Ordering::Acquire));
            orig(size)
        }

        // Seed the forward target before the slot flips: concurrent test
        // threads allocate through this import the moment it is redirected.
        let fallback = hookforge_runtime::resolve(None, "malloc").expect("malloc addr");
        ORIG.store(fallback, Ordering::Release);

        let fake: unsafe extern "C" fn(usize) -> *mut c_void = counting_malloc;
        let original = unsafe { replace_import("", "malloc", fake as usize) }.expect("redirect");
        ORIG.store(original, Ordering::Release);

        unsafe {
            let p = libc::malloc(32);
            assert!(!p.is_null());
            libc::free(p);
        }
        assert!(CALLS.load(Ordering::SeqCst) >= 1);

        // Put the slot back.
        unsafe { replace_import("", "malloc", original) }.expect("restore");
    }
}
