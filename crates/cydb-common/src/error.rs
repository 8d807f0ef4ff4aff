//! Error types for cydb.

use thiserror::Error;

/// Result type alias using CydbError.
pub type Result<T> = std::result::Result<T, CydbError>;

/// Errors that can occur in cydb operations.
#[derive(Debug, Error)]
pub enum CydbError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Engine state errors
    #[error("database not initialized")]
    DbNotInit,

    #[error("key not found")]
    KeyNotFound,

    // Page errors
    #[error("page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u32, reason: String },

    #[error("metadata corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("cell too large: {size} bytes (max {max})")]
    CellTooLarge { size: usize, max: usize },

    // WAL errors
    #[error("WAL corrupted at offset {offset}: {reason}")]
    WalCorrupted { offset: u64, reason: String },

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// The coarse error taxonomy surfaced at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation invoked before the engine was opened.
    DbNotInit,
    /// The requested key does not exist.
    KeyNotFound,
    /// An underlying file operation failed.
    Io,
    /// A page, the metadata sidecar, or the WAL failed integrity checks.
    Corruption,
    /// An internal invariant was violated or a limit exceeded.
    Internal,
}

impl CydbError {
    /// Maps this error onto the surfaced taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CydbError::Io(_) => ErrorKind::Io,
            CydbError::DbNotInit => ErrorKind::DbNotInit,
            CydbError::KeyNotFound => ErrorKind::KeyNotFound,
            CydbError::PageCorrupted { .. }
            | CydbError::MetadataCorrupted(_)
            | CydbError::WalCorrupted { .. } => ErrorKind::Corruption,
            CydbError::CellTooLarge { .. } | CydbError::Internal(_) => ErrorKind::Internal,
        }
    }
}
