//! WAL reader for log replay.

use crate::record::{RedoOp, WalRecord, MAX_REDO_SIZE, RECORD_HEADER_SIZE};
use cydb_common::page::PageId;
use cydb_common::{CydbError, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Sequential scanner over a log file.
///
/// Records are yielded in file order, which equals sequence order. The
/// scan ends cleanly at the first short read: a torn tail from a crash
/// mid-append is not an error, the partial record is simply not
/// recovered. Structurally invalid bytes before the tail are corruption.
pub struct WalReader {
    reader: BufReader<File>,
    offset: u64,
    done: bool,
}

impl WalReader {
    /// Opens a log file for scanning from its start.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
            done: false,
        })
    }

    /// Reads the next record, or `None` at end of log / torn tail.
    pub fn read_record(&mut self) -> Result<Option<WalRecord>> {
        if self.done {
            return Ok(None);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        if !self.read_fully(&mut header)? {
            self.done = true;
            return Ok(None);
        }

        let seq_num = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let page_id = PageId(u32::from_le_bytes([
            header[4], header[5], header[6], header[7],
        ]));
        let redo_len =
            u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;

        if redo_len > MAX_REDO_SIZE {
            return Err(CydbError::WalCorrupted {
                offset: self.offset,
                reason: format!("redo length {} exceeds maximum", redo_len),
            });
        }

        let mut redo_bytes = vec![0u8; redo_len];
        if !self.read_fully(&mut redo_bytes)? {
            // Torn tail: the header made it to disk but the redo did not.
            self.done = true;
            return Ok(None);
        }

        let redo = RedoOp::decode(&redo_bytes, self.offset)?;
        self.offset += (RECORD_HEADER_SIZE + redo_len) as u64;

        Ok(Some(WalRecord {
            seq_num,
            page_id,
            redo,
        }))
    }

    /// File offset of the next unread record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads exactly `buf.len()` bytes; returns false on EOF or a short
    /// read (both end the scan).
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..])?;
            if n == 0 {
                return Ok(false);
            }
            filled += n;
        }
        Ok(true)
    }
}

impl Iterator for WalReader {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
