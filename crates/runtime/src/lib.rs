//! hookforge runtime - process introspection
//!
//! This crate is the engine's view of the surrounding process:
//! - Memory layout and loaded-module snapshots via [`maps`], cached with a
//!   short TTL and force-refreshable
//! - Symbol resolution from loaded images via [`symbols`]
//!
//! The engine core treats everything returned here as a read-only snapshot;
//! it never mutates through this crate.

pub mod error;
pub mod maps;
pub mod symbols;

pub use error::RuntimeError;
pub use maps::{
    find_module, invalidate_memory_layout_cache, invalidate_module_map_cache, memory_layout,
    module_map, MemRegion, Perm, RuntimeModule,
};
pub use symbols::resolve;
