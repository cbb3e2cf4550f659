//! Memory subsystem
//!
//! - [`platform`]: OS page primitives (allocate, protect, free, i-cache flush)
//! - [`allocator`]: process-wide exec/data pools with a near-range path
//! - [`patch`]: safe writes into live executable pages

pub mod allocator;
pub mod patch;
pub mod platform;

pub use allocator::{MemBlock, MemRange};
pub use platform::Protection;
