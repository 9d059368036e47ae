//! Shared memory for ref-counted values
//!
//! Both runtimes allocate and free blocks through the C allocator and update
//! reference counts under one process-wide [`crate::sync::ArcMutex`].
//!
//! # Architecture
//!
//! - **Heap**: calloc/free wrapper, live-object tracing, GC byte hint
//! - **BlockPtr**: typed view over a block's header fields

mod block;
mod heap;

pub use block::{
    read_ptr, read_u32, write_ptr, write_u32, BlockPtr, DATA_OFFSET, PAYLOAD_OFFSET,
    REFCOUNT_OFFSET, SIZE_OFFSET, VAR_HEADER_SIZE,
};
pub use heap::{Heap, HeapStats};
