//! Device-side memory description: the reported region map and clipping.

pub mod clip;
pub mod memory_map;

pub use clip::{Span, clip};
pub use memory_map::{
    DeviceFamily, DeviceMemoryMap, MemoryKind, MemoryRegion, QueryError, encode_query_response,
};
