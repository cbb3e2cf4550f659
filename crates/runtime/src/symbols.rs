//! Symbol resolution from loaded images
//!
//! Thin wrapper over the dynamic linker: `dlsym` against a specific image or
//! the global namespace on unix, `GetProcAddress` on Windows.

#[cfg(unix)]
use std::ffi::CString;

/// Resolve `symbol` in `image` (substring of a loaded image's path, or a
/// loadable library name). With `None`, the whole process namespace is
/// searched. Returns the symbol address, or `None` when unresolved.
#[cfg(unix)]
pub fn resolve(image: Option<&str>, symbol: &str) -> Option<usize> {
    let symbol = CString::new(symbol).ok()?;

    let handle = match image {
        None => libc::RTLD_DEFAULT,
        Some(name) => {
            let name = CString::new(name).ok()?;
            // Prefer an already loaded image; fall back to loading it. A
            // handle we opened stays open so resolved addresses remain valid.
            let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
            if handle.is_null() {
                unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY) }
            } else {
                handle
            }
        }
    };
    if image.is_some() && handle.is_null() {
        tracing::debug!("image {:?} not found", image);
        return None;
    }

    let addr = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as usize)
    }
}

#[cfg(windows)]
pub fn resolve(image: Option<&str>, symbol: &str) -> Option<usize> {
    use windows::core::PCSTR;
    use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress, LoadLibraryA};

    let symbol = std::ffi::CString::new(symbol).ok()?;
    let module = match image {
        None => unsafe { GetModuleHandleA(PCSTR::null()).ok()? },
        Some(name) => {
            let name = std::ffi::CString::new(name).ok()?;
            let name = PCSTR::from_raw(name.as_ptr() as *const u8);
            unsafe { GetModuleHandleA(name).or_else(|_| LoadLibraryA(name)).ok()? }
        }
    };

    let addr = unsafe { GetProcAddress(module, PCSTR::from_raw(symbol.as_ptr() as *const u8)) };
    addr.map(|f| f as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_resolve_strlen_from_global_namespace() {
        let addr = resolve(None, "strlen").expect("strlen");
        assert_ne!(addr, 0);

        let strlen: unsafe extern "C" fn(*const core::ffi::c_char) -> usize =
            unsafe { std::mem::transmute(addr) };
        assert_eq!(unsafe { strlen(c"abc".as_ptr()) }, 3);
    }

    #[test]
    #[cfg(unix)]
    fn test_unknown_symbol_is_none() {
        assert!(resolve(None, "definitely_not_a_symbol_xyz").is_none());
    }
}
