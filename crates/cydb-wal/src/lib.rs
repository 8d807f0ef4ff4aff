//! Write-ahead log for cydb.
//!
//! A single append-only log file per database directory records every
//! logical page mutation before it is applied. Replaying the log on open
//! recovers mutations that were durable but whose pages were never
//! flushed. The log is removed at clean shutdown.

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::WalReader;
pub use record::{RedoOp, RedoType, WalRecord, MAX_REDO_SIZE, RECORD_HEADER_SIZE};
pub use writer::{WalWriter, WAL_FILE_NAME};
