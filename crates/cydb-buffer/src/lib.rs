//! Buffered B-tree nodes and the buffer manager for cydb.
//!
//! This crate provides the two layers between the B-tree driver and the
//! disk:
//! - [`BufferedNode`]: the in-page slotted-cell protocol with free-space
//!   tracking and WAL-logged mutations
//! - [`BufferManager`]: the fixed-size page cache with pinning, eviction,
//!   page allocation, metadata persistence and crash recovery

mod manager;
mod node;

pub use manager::{
    auto_sized_pool_pages, BufferManager, BufferStats, Metadata, DATA_FILE_NAME,
    METADATA_FILE_NAME,
};
pub use node::BufferedNode;
