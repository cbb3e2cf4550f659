//! Executable-memory allocator
//!
//! Process-wide pools of page-backed linear allocators, split into exec and
//! data pages. Exec pages are brought up RWX once and stay RWX for the
//! process lifetime. The near path serves blocks within a caller-supplied
//! range of a target address, walking the process memory layout for unmapped
//! gaps when no existing page qualifies.

use std::sync::LazyLock;

use parking_lot::Mutex;

use crate::config;
use crate::error::HookError;
use crate::memory::platform::{self, Protection};

/// Half-open address range `[start, start + size)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemRange {
    start: usize,
    size: usize,
}

impl MemRange {
    pub fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn is_null(&self) -> bool {
        self.start == 0 || self.size == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn intersect(&self, other: &MemRange) -> Option<MemRange> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        (start < end).then(|| MemRange::new(start, end - start))
    }
}

/// A block handed out by the allocator; a name for a region, owning nothing
pub type MemBlock = MemRange;

/// Block alignment inside a page; keeps literal pools naturally aligned
const BLOCK_ALIGN: usize = 16;

struct Chunk {
    offset: usize,
    size: usize,
    free: bool,
}

/// One OS page with a linear bump allocator over it
struct PagePool {
    base: usize,
    size: usize,
    exec: bool,
    cursor: usize,
    chunks: Vec<Chunk>,
}

impl PagePool {
    fn new(base: usize, size: usize, exec: bool) -> Self {
        Self {
            base,
            size,
            exec,
            cursor: 0,
            chunks: Vec::new(),
        }
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    fn alloc(&mut self, size: usize) -> Option<usize> {
        // Reuse a freed chunk first; chunks are never split.
        for chunk in &mut self.chunks {
            if chunk.free && chunk.size >= size {
                chunk.free = false;
                return Some(self.base + chunk.offset);
            }
        }

        let aligned = size.div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN;
        if self.cursor + aligned > self.size {
            return None;
        }
        let offset = self.cursor;
        self.cursor += aligned;
        self.chunks.push(Chunk {
            offset,
            size: aligned,
            free: false,
        });
        Some(self.base + offset)
    }

    fn free(&mut self, addr: usize) -> bool {
        let offset = addr - self.base;
        for chunk in &mut self.chunks {
            if chunk.offset == offset && !chunk.free {
                chunk.free = true;
                return true;
            }
        }
        false
    }
}

/// Process-wide pool allocator for trampoline and bookkeeping blocks
pub struct MemoryAllocator {
    pools: Mutex<Vec<PagePool>>,
}

static ALLOCATOR: LazyLock<MemoryAllocator> = LazyLock::new(|| MemoryAllocator {
    pools: Mutex::new(Vec::new()),
});

/// The process-wide allocator instance
pub fn shared() -> &'static MemoryAllocator {
    &ALLOCATOR
}

impl MemoryAllocator {
    /// Allocate a block of at most one page, from the exec or data pool
    pub fn alloc_block(&self, size: usize, exec: bool) -> Result<MemBlock, HookError> {
        if size == 0 || size > platform::page_size() {
            tracing::error!("alloc_block: invalid size {}", size);
            return Err(HookError::InvalidArgument);
        }

        {
            let mut pools = self.pools.lock();
            for pool in pools.iter_mut() {
                if pool.exec == exec {
                    if let Some(addr) = pool.alloc(size) {
                        return Ok(MemBlock::new(addr, size));
                    }
                }
            }
        }

        // No room anywhere; bring up a fresh page outside the lock. Exec
        // pages go straight to RWX so code can be written before first run.
        let prot = if exec { Protection::RWX } else { Protection::RW };
        let page = platform::alloc(platform::page_size(), prot, None)?;

        let mut pools = self.pools.lock();
        let mut pool = PagePool::new(page as usize, platform::page_size(), exec);
        let addr = pool.alloc(size).ok_or(HookError::MemoryAllocation)?;
        pools.push(pool);
        Ok(MemBlock::new(addr, size))
    }

    pub fn alloc_exec_block(&self, size: usize) -> Result<MemBlock, HookError> {
        self.alloc_block(size, true)
    }

    pub fn alloc_data_block(&self, size: usize) -> Result<MemBlock, HookError> {
        self.alloc_block(size, false)
    }

    /// Allocate an exec block whose address lies in `[target - range, target + range)`.
    ///
    /// Consults the registered near-code callback first, then existing exec
    /// pages inside the range, and finally materializes a page in an unmapped
    /// gap of the process layout.
    pub fn alloc_exec_block_near(
        &self,
        size: usize,
        target: usize,
        range: usize,
    ) -> Result<MemBlock, HookError> {
        if size == 0 || size > platform::page_size() {
            return Err(HookError::InvalidArgument);
        }

        let lo = target.saturating_sub(range);
        let hi = target.saturating_add(range);

        if let Some(cb) = config::alloc_near_code_callback() {
            let addr = cb(size, target, range);
            if addr != 0 {
                tracing::debug!("near block from user callback: {:#x}", addr);
                return Ok(MemBlock::new(addr, size));
            }
        }

        {
            let mut pools = self.pools.lock();
            for pool in pools.iter_mut() {
                if pool.exec && pool.base >= lo && pool.base + pool.size <= hi {
                    if let Some(addr) = pool.alloc(size) {
                        return Ok(MemBlock::new(addr, size));
                    }
                }
            }
        }

        let page = self
            .map_page_in_gap(lo, hi)
            .ok_or(HookError::NearMemoryExhausted)?;

        let mut pools = self.pools.lock();
        let mut pool = PagePool::new(page, platform::page_size(), true);
        let addr = pool.alloc(size).ok_or(HookError::MemoryAllocation)?;
        pools.push(pool);
        Ok(MemBlock::new(addr, size))
    }

    /// Walk the process layout for an unmapped page inside `[lo, hi)` and map
    /// it RWX at a fixed address. Attempts are bounded; a raced-away gap just
    /// moves the walk to the next one.
    fn map_page_in_gap(&self, lo: usize, hi: usize) -> Option<usize> {
        let page = platform::page_size();
        let mut regions: Vec<(usize, usize)> = hookforge_runtime::memory_layout(false)
            .iter()
            .map(|r| (r.start, r.end()))
            .collect();
        regions.sort_unstable_by_key(|r| r.0);

        let mut attempts = 0;
        // Never hand out the zero page.
        let mut prev_end = page;
        for (start, end) in regions.into_iter().chain([(usize::MAX, usize::MAX)]) {
            if prev_end < start {
                let gap_lo = prev_end.max(lo);
                let gap_hi = start.min(hi);
                let candidate = platform::page_floor(gap_lo + page - 1);
                if candidate + page <= gap_hi {
                    attempts += 1;
                    if let Ok(ptr) = platform::alloc(page, Protection::RWX, Some(candidate)) {
                        return Some(ptr as usize);
                    }
                    if attempts >= 64 {
                        tracing::warn!("near allocation gave up after {} gap probes", attempts);
                        return None;
                    }
                }
            }
            prev_end = prev_end.max(end);
            if prev_end >= hi {
                break;
            }
        }
        None
    }

    /// Return a block to its containing page. Blocks that did not come from a
    /// pool (user-callback memory) are left to their owner.
    pub fn free_block(&self, block: MemBlock) {
        if block.is_null() {
            return;
        }

        let mut pools = self.pools.lock();
        for pool in pools.iter_mut() {
            if pool.contains(block.start()) {
                if !pool.free(block.start()) {
                    tracing::error!("free_block: {:#x} not live in its page", block.start());
                }
                return;
            }
        }
        tracing::debug!("free_block: {:#x} not pool-owned, skipping", block.start());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect() {
        let a = MemRange::new(0x1000, 0x100);
        let b = MemRange::new(0x1080, 0x100);
        let c = a.intersect(&b).unwrap();
        assert_eq!(c.start(), 0x1080);
        assert_eq!(c.size(), 0x80);
        assert!(a.intersect(&MemRange::new(0x2000, 0x10)).is_none());
    }

    #[test]
    fn test_alloc_distinct_blocks() {
        let a = shared().alloc_exec_block(32).unwrap();
        let b = shared().alloc_exec_block(32).unwrap();
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a.start(), b.start());
    }

    #[test]
    fn test_free_then_reuse() {
        // A page-private allocator so parallel tests cannot race the pools.
        let page = platform::alloc(platform::page_size(), Protection::RW, None).unwrap();
        let mut pool = PagePool::new(page as usize, platform::page_size(), false);

        let a = pool.alloc(48).unwrap();
        let b = pool.alloc(48).unwrap();
        assert_ne!(a, b);

        assert!(pool.free(a));
        // First-fit over freed chunks hands the slot back.
        assert_eq!(pool.alloc(48).unwrap(), a);
        assert!(!pool.free(page as usize + 4000), "unallocated offset is rejected");

        platform::free(page, platform::page_size());
    }

    #[test]
    fn test_data_block_is_writable() {
        let block = shared().alloc_data_block(64).unwrap();
        unsafe {
            (block.start() as *mut u8).write_bytes(0x5A, block.size());
        }
        shared().free_block(block);
    }

    #[test]
    fn test_oversized_block_rejected() {
        let err = shared().alloc_exec_block(platform::page_size() + 1).unwrap_err();
        assert_eq!(err, HookError::InvalidArgument);
    }

    #[test]
    fn test_near_allocation_in_range() {
        let target = test_near_allocation_in_range as usize;
        let range = 0x7FF0_0000usize;
        let block = shared()
            .alloc_exec_block_near(64, target, range)
            .expect("near alloc");
        let distance = block.start().abs_diff(target);
        assert!(distance < range, "block {:#x} too far from {:#x}", block.start(), target);
        shared().free_block(block);
    }
}
