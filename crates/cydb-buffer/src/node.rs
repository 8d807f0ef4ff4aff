//! Buffered B-tree nodes: the in-page slotted-cell protocol.
//!
//! A [`BufferedNode`] owns one page buffer and is the only way to read or
//! mutate that page while it is resident. Construction verifies the page
//! checksum and rebuilds the in-memory available list (the free fragments
//! inside the cell heap left behind by removes and shrinking updates).
//!
//! Every mutating operation follows the same discipline: check that the
//! mutation can succeed without touching the page, append the logical redo
//! record to the WAL (durable before return), then apply the byte-level
//! change. Replay re-enters through [`BufferedNode::apply_redo`], which
//! performs the same mutations without logging.

use bytes::Bytes;
use cydb_common::page::{
    cell_size_at, key_cell_size, key_value_cell_size, read_key_cell, read_key_value_cell,
    verify_checksum, write_key_cell, write_key_value_cell, CellType, KeyValueCellHeader, PageHeader,
    PageId, KEY_VALUE_CELL_HEADER_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE, SLOT_SIZE,
};
use cydb_common::{CydbError, Result};
use cydb_wal::{RedoOp, WalWriter};
use std::sync::Arc;

/// A free fragment inside the cell heap: `len` bytes starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AvailableEntry {
    offset: u32,
    len: u32,
}

/// A page materialized in the buffer pool.
#[derive(Debug)]
pub struct BufferedNode {
    page_id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
    header: PageHeader,
    /// Free fragments in the cell heap, sorted by offset descending,
    /// adjacent fragments merged.
    available: Vec<AvailableEntry>,
    wal: Arc<WalWriter>,
    /// WAL offset one past this node's most recent redo record.
    wal_end_off: u64,
    dirty: bool,
}

impl BufferedNode {
    /// Wraps a page buffer read from disk.
    ///
    /// Fails with `PageCorrupted` if the checksum does not match or the
    /// header and slot array are not well formed.
    pub fn from_bytes(
        page_id: PageId,
        data: Box<[u8; PAGE_SIZE]>,
        wal: Arc<WalWriter>,
    ) -> Result<Self> {
        if !verify_checksum(&data[..]) {
            return Err(CydbError::PageCorrupted {
                page_id: page_id.0,
                reason: "checksum mismatch".to_string(),
            });
        }

        let header = PageHeader::from_bytes(&data[..]).map_err(|e| CydbError::PageCorrupted {
            page_id: page_id.0,
            reason: e.to_string(),
        })?;

        let slot_area_end = PAGE_HEADER_SIZE + header.data_num as usize * SLOT_SIZE;
        if (header.cell_end as usize) < slot_area_end || header.cell_end as usize > PAGE_SIZE {
            return Err(CydbError::PageCorrupted {
                page_id: page_id.0,
                reason: format!("cell_end {} out of range", header.cell_end),
            });
        }

        let mut node = Self {
            page_id,
            data,
            header,
            available: Vec::new(),
            wal,
            wal_end_off: 0,
            dirty: false,
        };
        node.rebuild_available_list()?;
        Ok(node)
    }

    /// Rebuilds the available list from the slot array: sort live cell
    /// offsets descending and record every gap between consecutive cells
    /// (and between the highest cell end and the end of the page).
    fn rebuild_available_list(&mut self) -> Result<()> {
        let n = self.header.data_num as usize;
        let mut offsets: Vec<u32> = (0..n).map(|i| self.slot(i)).collect();
        offsets.sort_unstable_by(|a, b| b.cmp(a));

        self.available.clear();
        let mut boundary = PAGE_SIZE as u32;
        for off in offsets {
            if (off as usize) < self.header.cell_end as usize || off >= PAGE_SIZE as u32 {
                return Err(CydbError::PageCorrupted {
                    page_id: self.page_id.0,
                    reason: format!("slot offset {} outside the cell heap", off),
                });
            }
            let end = off + cell_size_at(&self.data[..], off as usize, self.header.cell_type) as u32;
            if end > boundary {
                return Err(CydbError::PageCorrupted {
                    page_id: self.page_id.0,
                    reason: format!("cell at {} overlaps its neighbor", off),
                });
            }
            if boundary > end {
                self.available.push(AvailableEntry {
                    offset: end,
                    len: boundary - end,
                });
            }
            boundary = off;
        }
        Ok(())
    }

    // header accessors

    /// Page id of this node.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Cell kind held by this page.
    pub fn cell_type(&self) -> CellType {
        self.header.cell_type
    }

    /// Number of live cells.
    pub fn data_num(&self) -> usize {
        self.header.data_num as usize
    }

    /// Child for keys greater than the last separator (internal nodes).
    pub fn rightmost_child(&self) -> PageId {
        self.header.rightmost_child
    }

    /// Contiguous free bytes between the slot array and the cell heap.
    pub fn free_space(&self) -> usize {
        self.header.free_space()
    }

    /// Number of fragments currently tracked in the available list.
    pub fn fragment_count(&self) -> usize {
        self.available.len()
    }

    /// Total fragmented bytes in the available list.
    pub fn available_total(&self) -> usize {
        self.available.iter().map(|e| e.len as usize).sum()
    }

    /// WAL offset one past this node's most recent redo record.
    pub fn wal_end_off(&self) -> u64 {
        self.wal_end_off
    }

    /// Overrides the WAL watermark, used when replay applies records
    /// through the non-logging path.
    pub fn set_wal_end_off(&mut self, off: u64) {
        self.wal_end_off = off;
    }

    /// True if the page has unflushed mutations.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the header and a fresh checksum into the page buffer,
    /// making `bytes()` safe to persist.
    pub fn seal(&mut self) {
        self.write_header();
        self.header.checksum = cydb_common::page::refresh_checksum(&mut self.data[..]);
    }

    /// Clears the dirty flag after a successful write-back.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// The raw page buffer.
    pub fn bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    // slot array

    fn slot_offset(i: usize) -> usize {
        PAGE_HEADER_SIZE + i * SLOT_SIZE
    }

    fn slot(&self, i: usize) -> u32 {
        let off = Self::slot_offset(i);
        u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    fn set_slot(&mut self, i: usize, cell_offset: u32) {
        let off = Self::slot_offset(i);
        self.data[off..off + SLOT_SIZE].copy_from_slice(&cell_offset.to_le_bytes());
    }

    fn write_header(&mut self) {
        let bytes = self.header.to_bytes();
        self.data[..PAGE_HEADER_SIZE].copy_from_slice(&bytes);
    }

    // cell accessors

    /// Key bytes of the cell at slot `i`.
    pub fn cell_key(&self, i: usize) -> &[u8] {
        let off = self.slot(i) as usize;
        match self.header.cell_type {
            CellType::Internal => read_key_cell(&self.data[..], off).0,
            CellType::Leaf => read_key_value_cell(&self.data[..], off).0,
        }
    }

    /// Value bytes of the key-value cell at slot `i` (leaf nodes).
    pub fn cell_value(&self, i: usize) -> &[u8] {
        read_key_value_cell(&self.data[..], self.slot(i) as usize).1
    }

    /// Child id of the separator cell at slot `i` (internal nodes).
    pub fn cell_child(&self, i: usize) -> PageId {
        read_key_cell(&self.data[..], self.slot(i) as usize).1
    }

    /// Owned copy of the separator cell at slot `i`.
    pub fn key_cell(&self, i: usize) -> (Vec<u8>, PageId) {
        let (key, child) = read_key_cell(&self.data[..], self.slot(i) as usize);
        (key.to_vec(), child)
    }

    /// Owned copy of the key-value cell at slot `i`.
    pub fn key_value_cell(&self, i: usize) -> (Vec<u8>, Vec<u8>) {
        let (key, value) = read_key_value_cell(&self.data[..], self.slot(i) as usize);
        (key.to_vec(), value.to_vec())
    }

    // search

    /// Lower bound: the first slot whose key is not less than `key`, in
    /// `[0, data_num]`.
    pub fn find_value_index(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.data_num();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.cell_key(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Upper bound among separators: the first slot whose key is strictly
    /// greater than `key`. A probe equal to a separator routes past it.
    pub fn find_child_index(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.data_num();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.cell_key(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Child page that `key` routes to.
    pub fn find_child(&self, key: &[u8]) -> PageId {
        let index = self.find_child_index(key);
        if index < self.data_num() {
            self.cell_child(index)
        } else {
            self.header.rightmost_child
        }
    }

    // public mutations (logged)

    /// Inserts a key-value cell in key order. Returns `Ok(None)` when the
    /// node lacks room even after defragmentation; the caller must split.
    pub fn try_insert_value(&mut self, key: &[u8], value: &[u8]) -> Result<Option<u32>> {
        self.expect_type(CellType::Leaf)?;
        let size = key_value_cell_size(key.len(), value.len());
        if !self.can_allocate(size, true) {
            return Ok(None);
        }

        self.wal_end_off = self.wal.log(
            self.page_id,
            RedoOp::Insert {
                key: Bytes::copy_from_slice(key),
                payload: Bytes::copy_from_slice(value),
            },
        )?;

        let off = self
            .do_insert_value(key, value)
            .ok_or_else(|| internal_lost_space(self.page_id))?;
        Ok(Some(off))
    }

    /// Updates the value at slot `index`. Shrinking rewrites in place and
    /// releases the tail to the available list; growing relocates the
    /// cell. Returns `Ok(None)` when a grown cell cannot fit.
    pub fn try_update_value(&mut self, index: usize, value: &[u8]) -> Result<Option<u32>> {
        self.expect_type(CellType::Leaf)?;
        self.expect_index(index)?;

        let off = self.slot(index) as usize;
        let kv = KeyValueCellHeader::from_bytes(&self.data[off..off + KEY_VALUE_CELL_HEADER_SIZE]);
        if value.len() > kv.value_size as usize {
            let old_size = key_value_cell_size(kv.key_size as usize, kv.value_size as usize);
            let new_size = key_value_cell_size(kv.key_size as usize, value.len());
            if self.free_space() + self.available_total() + old_size < new_size {
                return Ok(None);
            }
        }

        self.wal_end_off = self.wal.log(
            self.page_id,
            RedoOp::Update {
                slot: index as u32,
                payload: Bytes::copy_from_slice(value),
            },
        )?;

        let off = self
            .do_update_value(index, value)
            .ok_or_else(|| internal_lost_space(self.page_id))?;
        Ok(Some(off))
    }

    /// Inserts a separator cell in key order. Returns `Ok(None)` when the
    /// node lacks room even after defragmentation; the caller must split.
    pub fn try_insert_child(&mut self, key: &[u8], child: PageId) -> Result<Option<u32>> {
        self.expect_type(CellType::Internal)?;
        let size = key_cell_size(key.len());
        if !self.can_allocate(size, true) {
            return Ok(None);
        }

        self.wal_end_off = self.wal.log(
            self.page_id,
            RedoOp::Insert {
                key: Bytes::copy_from_slice(key),
                payload: RedoOp::child_payload(child),
            },
        )?;

        let off = self
            .do_insert_child(key, child)
            .ok_or_else(|| internal_lost_space(self.page_id))?;
        Ok(Some(off))
    }

    /// Rewrites the child id at slot `index`; `index == data_num` updates
    /// `rightmost_child` instead.
    pub fn try_update_child(&mut self, index: usize, child: PageId) -> Result<()> {
        self.expect_type(CellType::Internal)?;
        if index > self.data_num() {
            return Err(CydbError::Internal(format!(
                "child slot {} out of range on {}",
                index, self.page_id
            )));
        }

        self.wal_end_off = self.wal.log(
            self.page_id,
            RedoOp::Update {
                slot: index as u32,
                payload: RedoOp::child_payload(child),
            },
        )?;

        self.do_update_child(index, child);
        Ok(())
    }

    /// Removes the cell at slot `index`, returning its extent to the
    /// available list and collapsing fragments abutting `cell_end`.
    pub fn remove(&mut self, index: usize) -> Result<()> {
        self.expect_index(index)?;

        self.wal_end_off = self.wal.log(
            self.page_id,
            RedoOp::Remove {
                slot: index as u32,
            },
        )?;

        self.do_remove(index);
        Ok(())
    }

    /// Re-applies a logged operation without logging it again. Inserts
    /// behave as upserts and out-of-range slots are ignored, so replaying
    /// a record whose effect is already present is harmless.
    pub fn apply_redo(&mut self, redo: &RedoOp) -> Result<()> {
        match redo {
            RedoOp::Insert { key, payload } => match self.header.cell_type {
                CellType::Leaf => {
                    let index = self.find_value_index(key);
                    if index < self.data_num() && self.cell_key(index) == &key[..] {
                        self.replay_update_value(index, payload)
                    } else if self.do_insert_value(key, payload).is_some() {
                        Ok(())
                    } else {
                        Err(replay_overflow(self.page_id))
                    }
                }
                CellType::Internal => {
                    let child = RedoOp::decode_child(payload)?;
                    // Lower-bound search: find_child_index skips equal keys.
                    let index = self.find_value_index(key);
                    if index < self.data_num() && self.cell_key(index) == &key[..] {
                        self.do_update_child(index, child);
                        Ok(())
                    } else if self.do_insert_child(key, child).is_some() {
                        Ok(())
                    } else {
                        Err(replay_overflow(self.page_id))
                    }
                }
            },
            RedoOp::Update { slot, payload } => {
                let index = *slot as usize;
                match self.header.cell_type {
                    CellType::Leaf => {
                        if index < self.data_num() {
                            self.replay_update_value(index, payload)
                        } else {
                            Ok(())
                        }
                    }
                    CellType::Internal => {
                        if index <= self.data_num() {
                            let child = RedoOp::decode_child(payload)?;
                            self.do_update_child(index, child);
                        }
                        Ok(())
                    }
                }
            }
            RedoOp::Remove { slot } => {
                let index = *slot as usize;
                if index < self.data_num() {
                    self.do_remove(index);
                }
                Ok(())
            }
        }
    }

    fn replay_update_value(&mut self, index: usize, value: &[u8]) -> Result<()> {
        let off = self.slot(index) as usize;
        let kv = KeyValueCellHeader::from_bytes(&self.data[off..off + KEY_VALUE_CELL_HEADER_SIZE]);
        if value.len() > kv.value_size as usize {
            let old_size = key_value_cell_size(kv.key_size as usize, kv.value_size as usize);
            let new_size = key_value_cell_size(kv.key_size as usize, value.len());
            if self.free_space() + self.available_total() + old_size < new_size {
                return Err(replay_overflow(self.page_id));
            }
        }
        self.do_update_value(index, value)
            .map(|_| ())
            .ok_or_else(|| replay_overflow(self.page_id))
    }

    // raw mutations

    fn do_insert_value(&mut self, key: &[u8], value: &[u8]) -> Option<u32> {
        let size = key_value_cell_size(key.len(), value.len());
        let off = self.alloc_cell(size, true)?;
        write_key_value_cell(&mut self.data[..], off as usize, key, value);
        let index = self.find_value_index(key);
        self.insert_slot(index, off);
        self.write_header();
        self.dirty = true;
        Some(off)
    }

    fn do_insert_child(&mut self, key: &[u8], child: PageId) -> Option<u32> {
        let size = key_cell_size(key.len());
        let off = self.alloc_cell(size, true)?;
        write_key_cell(&mut self.data[..], off as usize, key, child);
        let index = self.find_child_index(key);
        self.insert_slot(index, off);
        self.write_header();
        self.dirty = true;
        Some(off)
    }

    fn do_update_value(&mut self, index: usize, value: &[u8]) -> Option<u32> {
        let off = self.slot(index) as usize;
        let kv = KeyValueCellHeader::from_bytes(&self.data[off..off + KEY_VALUE_CELL_HEADER_SIZE]);
        let key_size = kv.key_size as usize;

        if value.len() <= kv.value_size as usize {
            // In-place overwrite; the tail goes back to the available list.
            let new_header = KeyValueCellHeader {
                key_size: kv.key_size,
                value_size: value.len() as u32,
            };
            self.data[off..off + KEY_VALUE_CELL_HEADER_SIZE]
                .copy_from_slice(&new_header.to_bytes());
            let value_start = off + KEY_VALUE_CELL_HEADER_SIZE + key_size;
            self.data[value_start..value_start + value.len()].copy_from_slice(value);

            let freed = kv.value_size as usize - value.len();
            if freed > 0 {
                let new_size = key_value_cell_size(key_size, value.len());
                self.insert_available(AvailableEntry {
                    offset: (off + new_size) as u32,
                    len: freed as u32,
                });
            }
            self.dirty = true;
            Some(off as u32)
        } else {
            // Relocate: free the old cell, allocate the larger one.
            let old_size = key_value_cell_size(key_size, kv.value_size as usize);
            let new_size = key_value_cell_size(key_size, value.len());
            let key = self.data[off + KEY_VALUE_CELL_HEADER_SIZE
                ..off + KEY_VALUE_CELL_HEADER_SIZE + key_size]
                .to_vec();

            self.insert_available(AvailableEntry {
                offset: off as u32,
                len: old_size as u32,
            });
            self.collapse_cell_end();

            let new_off = self.alloc_cell(new_size, false)?;
            write_key_value_cell(&mut self.data[..], new_off as usize, &key, value);
            self.set_slot(index, new_off);
            self.write_header();
            self.dirty = true;
            Some(new_off)
        }
    }

    fn do_update_child(&mut self, index: usize, child: PageId) {
        if index >= self.data_num() {
            self.header.rightmost_child = child;
            self.write_header();
        } else {
            let off = self.slot(index) as usize;
            self.data[off + 4..off + 8].copy_from_slice(&child.0.to_le_bytes());
        }
        self.dirty = true;
    }

    fn do_remove(&mut self, index: usize) {
        let off = self.slot(index);
        let size = cell_size_at(&self.data[..], off as usize, self.header.cell_type) as u32;
        self.insert_available(AvailableEntry { offset: off, len: size });
        self.collapse_cell_end();

        let n = self.data_num();
        let start = Self::slot_offset(index + 1);
        let end = Self::slot_offset(n);
        self.data.copy_within(start..end, Self::slot_offset(index));
        self.header.data_num -= 1;
        self.write_header();
        self.dirty = true;
    }

    fn insert_slot(&mut self, index: usize, cell_offset: u32) {
        let n = self.data_num();
        let start = Self::slot_offset(index);
        let end = Self::slot_offset(n);
        self.data.copy_within(start..end, start + SLOT_SIZE);
        self.set_slot(index, cell_offset);
        self.header.data_num += 1;
    }

    // free-space management

    /// True when `size` cell bytes (plus a slot if `needs_slot`) can be
    /// obtained from a fragment, the contiguous free region, or by
    /// defragmenting.
    fn can_allocate(&self, size: usize, needs_slot: bool) -> bool {
        let slot_need = if needs_slot { SLOT_SIZE } else { 0 };
        self.free_space() + self.available_total() >= size + slot_need
    }

    /// Obtains `size` contiguous cell bytes: first fragment that fits,
    /// then bump allocation, then defragment and retry the bump.
    fn alloc_cell(&mut self, size: usize, needs_slot: bool) -> Option<u32> {
        let slot_need = if needs_slot { SLOT_SIZE } else { 0 };
        let size32 = size as u32;

        if self.free_space() >= slot_need {
            if let Some(pos) = self.available.iter().position(|e| e.len >= size32) {
                let entry = &mut self.available[pos];
                let off = entry.offset;
                if entry.len > size32 {
                    entry.offset += size32;
                    entry.len -= size32;
                } else {
                    self.available.remove(pos);
                }
                return Some(off);
            }
        }

        if self.free_space() >= size + slot_need {
            self.header.cell_end -= size32;
            return Some(self.header.cell_end);
        }

        if self.free_space() + self.available_total() >= size + slot_need {
            self.defragment();
            self.header.cell_end -= size32;
            return Some(self.header.cell_end);
        }

        None
    }

    /// Compacts all live cells toward the high end of the page,
    /// eliminating every fragment.
    fn defragment(&mut self) {
        let n = self.data_num();
        let cells: Vec<(usize, Vec<u8>)> = (0..n)
            .map(|i| {
                let off = self.slot(i) as usize;
                let size = cell_size_at(&self.data[..], off, self.header.cell_type);
                (i, self.data[off..off + size].to_vec())
            })
            .collect();

        let mut boundary = PAGE_SIZE as u32;
        for (i, bytes) in cells {
            boundary -= bytes.len() as u32;
            self.data[boundary as usize..boundary as usize + bytes.len()].copy_from_slice(&bytes);
            self.set_slot(i, boundary);
        }
        self.header.cell_end = boundary;
        self.available.clear();
        self.write_header();
        self.dirty = true;
    }

    /// Inserts a fragment, keeping the list sorted by offset descending
    /// and merging with adjacent fragments.
    fn insert_available(&mut self, mut entry: AvailableEntry) {
        let mut pos = self
            .available
            .iter()
            .position(|e| e.offset < entry.offset)
            .unwrap_or(self.available.len());

        // Higher neighbor sits just above the new fragment.
        if pos > 0 && entry.offset + entry.len == self.available[pos - 1].offset {
            entry.len += self.available[pos - 1].len;
            self.available.remove(pos - 1);
            pos -= 1;
        }
        // Lower neighbor ends exactly where the new fragment starts.
        if pos < self.available.len() {
            let next = self.available[pos];
            if next.offset + next.len == entry.offset {
                entry.offset = next.offset;
                entry.len += next.len;
                self.available.remove(pos);
            }
        }
        self.available.insert(pos, entry);
    }

    /// Folds fragments that start exactly at `cell_end` back into the
    /// contiguous free region.
    fn collapse_cell_end(&mut self) {
        while let Some(last) = self.available.last() {
            if last.offset == self.header.cell_end {
                self.header.cell_end += last.len;
                self.available.pop();
            } else {
                break;
            }
        }
    }

    fn expect_type(&self, cell_type: CellType) -> Result<()> {
        if self.header.cell_type != cell_type {
            return Err(CydbError::Internal(format!(
                "{:?} operation on a {:?} page ({})",
                cell_type, self.header.cell_type, self.page_id
            )));
        }
        Ok(())
    }

    fn expect_index(&self, index: usize) -> Result<()> {
        if index >= self.data_num() {
            return Err(CydbError::Internal(format!(
                "slot {} out of range on {} (data_num {})",
                index,
                self.page_id,
                self.data_num()
            )));
        }
        Ok(())
    }
}

fn internal_lost_space(page_id: PageId) -> CydbError {
    CydbError::Internal(format!("{} lost its reserved cell space", page_id))
}

fn replay_overflow(page_id: PageId) -> CydbError {
    CydbError::Internal(format!("replayed operation does not fit on {}", page_id))
}
