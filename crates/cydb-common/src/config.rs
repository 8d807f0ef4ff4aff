//! Configuration structures for cydb.

use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Storage configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Buffer pool capacity in pages.
    pub buffer_pool_pages: usize,
    /// Enable fsync after data-file page writes and WAL appends.
    ///
    /// With this off a mutation is only guaranteed recoverable across a
    /// clean process exit, not a power loss.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_pool_pages: 1024, // 16 MB with 16 KiB pages
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the buffer pool budget in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * PAGE_SIZE
    }
}
