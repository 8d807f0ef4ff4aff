//! WAL writer for appending redo records.

use crate::record::{RedoOp, WalRecord};
use cydb_common::page::PageId;
use cydb_common::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the log file inside a database directory.
pub const WAL_FILE_NAME: &str = "cydb.log";

/// Append-only writer for the database's single log file.
///
/// Every mutation is logged before the owning page is touched; `log`
/// returns only after the record has been appended and synced, so a
/// mutation is recoverable as soon as the call returns.
#[derive(Debug)]
pub struct WalWriter {
    path: PathBuf,
    sync_on_log: bool,
    inner: Mutex<WalInner>,
}

#[derive(Debug)]
struct WalInner {
    file: File,
    /// Offset one past the last appended record.
    end_off: u64,
    /// Next sequence number to assign.
    next_seq: u32,
    /// Records at or before this offset are covered by flushed pages.
    trim_off: u64,
}

impl WalWriter {
    /// Opens (or creates) the log file in `dir` with fsync-per-append.
    ///
    /// An existing log is left intact and appended to; the caller is
    /// expected to replay it first and then bump the sequence counter via
    /// [`WalWriter::set_next_seq`].
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_sync(dir, true)
    }

    /// Opens the log with an explicit sync policy. Disabling sync trades
    /// crash durability for speed; replay still works for clean process
    /// exits.
    pub fn open_with_sync(dir: &Path, sync_on_log: bool) -> Result<Self> {
        let path = dir.join(WAL_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let end_off = file.metadata()?.len();

        Ok(Self {
            path,
            sync_on_log,
            inner: Mutex::new(WalInner {
                file,
                end_off,
                next_seq: 0,
                trim_off: 0,
            }),
        })
    }

    /// Appends a redo record for `page_id`, assigns it the next sequence
    /// number, and syncs the log.
    ///
    /// Returns the file offset immediately after the appended record; the
    /// owning node stores it as its `wal_end_off`.
    pub fn log(&self, page_id: PageId, redo: RedoOp) -> Result<u64> {
        let mut inner = self.inner.lock();

        let record = WalRecord {
            seq_num: inner.next_seq,
            page_id,
            redo,
        };
        let encoded = record.encode();

        inner.file.write_all(&encoded)?;
        if self.sync_on_log {
            inner.file.sync_data()?;
        }

        inner.next_seq += 1;
        inner.end_off += encoded.len() as u64;
        Ok(inner.end_off)
    }

    /// Offset one past the last appended record.
    pub fn end_off(&self) -> u64 {
        self.inner.lock().end_off
    }

    /// The next sequence number that will be assigned.
    pub fn next_seq(&self) -> u32 {
        self.inner.lock().next_seq
    }

    /// Fast-forwards the sequence counter, used after replay so a recovered
    /// session keeps numbering after the highest replayed record.
    pub fn set_next_seq(&self, seq: u32) {
        self.inner.lock().next_seq = seq;
    }

    /// Records that every record at or before `off` is covered by a
    /// flushed page. Monotonic.
    pub fn set_trim_off(&self, off: u64) {
        let mut inner = self.inner.lock();
        if off > inner.trim_off {
            inner.trim_off = off;
        }
    }

    /// Offset below which all records are redundant.
    pub fn trim_off(&self) -> u64 {
        self.inner.lock().trim_off
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncates a torn tail left by a crash mid-append, so future
    /// appends follow the last complete record.
    pub fn truncate_to(&self, off: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(off)?;
        inner.file.sync_data()?;
        inner.end_off = off;
        Ok(())
    }

    /// Truncates the log in place, keeping the file and handle. Used when
    /// leftover records cannot pertain to the current data file.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0)?;
        inner.file.sync_data()?;
        inner.end_off = 0;
        inner.next_seq = 0;
        Ok(())
    }

    /// Removes the log file after a clean shutdown; the next session
    /// starts fresh.
    pub fn remove_log(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0)?;
        inner.end_off = 0;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}
