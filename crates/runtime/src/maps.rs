//! Process memory layout and module map
//!
//! Both views are cached snapshots with a short TTL; callers treat them as
//! read-only and may force a refresh after changing the address space
//! themselves.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::RuntimeError;

bitflags::bitflags! {
    /// Region permission bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// One mapped region of the process address space
#[derive(Debug, Clone)]
pub struct MemRegion {
    pub start: usize,
    pub size: usize,
    pub perm: Perm,
}

impl MemRegion {
    pub fn end(&self) -> usize {
        self.start + self.size
    }
}

/// One loaded image
#[derive(Debug, Clone)]
pub struct RuntimeModule {
    pub base: usize,
    pub path: String,
}

const CACHE_TTL: Duration = Duration::from_millis(100);

struct Cache<T> {
    value: Vec<T>,
    stamp: Option<Instant>,
}

impl<T: Clone> Cache<T> {
    const fn new() -> Self {
        Self {
            value: Vec::new(),
            stamp: None,
        }
    }

    fn fresh(&self) -> bool {
        self.stamp.is_some_and(|at| at.elapsed() < CACHE_TTL)
    }

    fn get_or_refresh(
        &mut self,
        force: bool,
        read: impl FnOnce() -> Result<Vec<T>, RuntimeError>,
    ) -> Vec<T> {
        if force || !self.fresh() {
            match read() {
                Ok(value) => {
                    self.value = value;
                    self.stamp = Some(Instant::now());
                }
                Err(err) => {
                    // Keep serving the stale snapshot rather than nothing.
                    tracing::error!("introspection refresh failed: {err}");
                }
            }
        }
        self.value.clone()
    }

    fn invalidate(&mut self) {
        self.stamp = None;
    }
}

static MEMORY_LAYOUT: LazyLock<Mutex<Cache<MemRegion>>> =
    LazyLock::new(|| Mutex::new(Cache::new()));
static MODULE_MAP: LazyLock<Mutex<Cache<RuntimeModule>>> =
    LazyLock::new(|| Mutex::new(Cache::new()));

/// Snapshot of the process memory layout (cached, ~100 ms TTL)
pub fn memory_layout(force_refresh: bool) -> Vec<MemRegion> {
    MEMORY_LAYOUT
        .lock()
        .get_or_refresh(force_refresh, read_regions)
}

pub fn invalidate_memory_layout_cache() {
    MEMORY_LAYOUT.lock().invalidate();
}

/// Snapshot of the loaded-module map (cached, ~100 ms TTL)
pub fn module_map(force_refresh: bool) -> Vec<RuntimeModule> {
    MODULE_MAP.lock().get_or_refresh(force_refresh, read_modules)
}

pub fn invalidate_module_map_cache() {
    MODULE_MAP.lock().invalidate();
}

/// First module whose path contains `name`
pub fn find_module(name: &str) -> Option<RuntimeModule> {
    module_map(false).into_iter().find(|m| m.path.contains(name))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn read_regions() -> Result<Vec<MemRegion>, RuntimeError> {
    let maps = std::fs::read_to_string("/proc/self/maps")?;
    let mut regions = Vec::new();

    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let range = fields
            .next()
            .ok_or_else(|| RuntimeError::Parse(line.into()))?;
        let perms = fields
            .next()
            .ok_or_else(|| RuntimeError::Parse(line.into()))?;

        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| RuntimeError::Parse(line.into()))?;
        let start = usize::from_str_radix(start, 16)
            .map_err(|_| RuntimeError::Parse(line.into()))?;
        let end =
            usize::from_str_radix(end, 16).map_err(|_| RuntimeError::Parse(line.into()))?;

        let mut perm = Perm::empty();
        if perms.contains('r') {
            perm |= Perm::READ;
        }
        if perms.contains('w') {
            perm |= Perm::WRITE;
        }
        if perms.contains('x') {
            perm |= Perm::EXECUTE;
        }

        regions.push(MemRegion {
            start,
            size: end - start,
            perm,
        });
    }

    Ok(regions)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn read_modules() -> Result<Vec<RuntimeModule>, RuntimeError> {
    let maps = std::fs::read_to_string("/proc/self/maps")?;
    let mut modules: Vec<RuntimeModule> = Vec::new();

    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let range = fields.next().unwrap_or_default();
        let Some(path) = fields.nth(4) else { continue };
        if !path.starts_with('/') {
            continue;
        }
        if modules.iter().any(|m| m.path == path) {
            continue;
        }

        let base = range
            .split_once('-')
            .and_then(|(start, _)| usize::from_str_radix(start, 16).ok())
            .ok_or_else(|| RuntimeError::Parse(line.into()))?;
        modules.push(RuntimeModule {
            base,
            path: path.to_string(),
        });
    }

    Ok(modules)
}

#[cfg(windows)]
fn read_regions() -> Result<Vec<MemRegion>, RuntimeError> {
    use windows::Win32::System::Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_READONLY, PAGE_READWRITE,
        PAGE_WRITECOPY,
    };

    let mut regions = Vec::new();
    let mut address = 0usize;
    loop {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let got = unsafe {
            VirtualQuery(
                Some(address as *const core::ffi::c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if got == 0 {
            break;
        }
        address = info.BaseAddress as usize + info.RegionSize;

        if info.State != MEM_COMMIT {
            continue;
        }
        let protect = info.Protect;
        let perm = if protect == PAGE_READONLY {
            Perm::READ
        } else if protect == PAGE_READWRITE || protect == PAGE_WRITECOPY {
            Perm::READ | Perm::WRITE
        } else if protect == PAGE_EXECUTE {
            Perm::EXECUTE
        } else if protect == PAGE_EXECUTE_READ {
            Perm::READ | Perm::EXECUTE
        } else if protect == PAGE_EXECUTE_READWRITE || protect == PAGE_EXECUTE_WRITECOPY {
            Perm::READ | Perm::WRITE | Perm::EXECUTE
        } else {
            Perm::empty()
        };
        regions.push(MemRegion {
            start: info.BaseAddress as usize,
            size: info.RegionSize,
            perm,
        });
    }
    Ok(regions)
}

#[cfg(windows)]
fn read_modules() -> Result<Vec<RuntimeModule>, RuntimeError> {
    // Module enumeration needs the PSAPI snapshot; the engine only consumes
    // the layout on this platform today.
    Ok(Vec::new())
}

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
fn read_regions() -> Result<Vec<MemRegion>, RuntimeError> {
    Err(RuntimeError::Unsupported)
}

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
fn read_modules() -> Result<Vec<RuntimeModule>, RuntimeError> {
    Err(RuntimeError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_layout_contains_own_code() {
        let layout = memory_layout(true);
        assert!(!layout.is_empty());

        let here = test_layout_contains_own_code as usize;
        let region = layout.iter().find(|r| here >= r.start && here < r.end());
        let region = region.expect("own code not in layout");
        assert!(region.perm.contains(Perm::EXECUTE));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_module_map_has_absolute_paths() {
        let modules = module_map(true);
        assert!(!modules.is_empty());
        assert!(modules.iter().all(|m| m.path.starts_with('/')));
    }

    #[test]
    fn test_cache_serves_within_ttl() {
        let a = memory_layout(true);
        let b = memory_layout(false);
        assert_eq!(a.len(), b.len());
    }
}
