//! Buffer manager: the page cache, data-file I/O and metadata sidecar.
//!
//! The manager owns the mapping from page id to [`BufferedNode`], the pin
//! set protecting multi-step mutations, and the backing files of a
//! database directory:
//!
//! | File       | Content                                             |
//! |------------|-----------------------------------------------------|
//! | `data`     | raw pages; page `i` at `[i*PAGE_SIZE, (i+1)*PAGE_SIZE)` |
//! | `metadata` | `{root_id: u32, node_num: u32, data_num: u64}` LE    |
//! | `cydb.log` | WAL; present only between a crash and the next open |
//!
//! On open the manager bootstraps a fresh file with a leaf root page and
//! replays any leftover WAL. When the metadata sidecar is missing or
//! stale after a crash, it is reconstructed by scanning page headers.

use crate::node::BufferedNode;
use cydb_common::page::{refresh_checksum, CellType, PageHeader, PageId, PAGE_SIZE};
use cydb_common::{CydbError, Result, StorageConfig};
use cydb_wal::{WalReader, WalWriter};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::System;

/// Name of the raw page file inside a database directory.
pub const DATA_FILE_NAME: &str = "data";

/// Name of the metadata sidecar inside a database directory.
pub const METADATA_FILE_NAME: &str = "metadata";

/// Persistent engine metadata, written to the sidecar at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Page id of the current tree root.
    pub root_id: PageId,
    /// Next free page id; pages are never reused.
    pub node_num: u32,
    /// Number of key-value pairs in the tree.
    pub data_num: u64,
}

impl Metadata {
    /// Size of the encoded record in bytes.
    pub const SIZE: usize = 16;

    /// Serializes the record to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.root_id.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.node_num.to_le_bytes());
        buf[8..16].copy_from_slice(&self.data_num.to_le_bytes());
        buf
    }

    /// Deserializes the record, failing on a short sidecar.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(CydbError::MetadataCorrupted(format!(
                "sidecar is {} bytes, expected {}",
                buf.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            root_id: PageId(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            node_num: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_num: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
        })
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            root_id: PageId(0),
            node_num: 0,
            data_num: 0,
        }
    }
}

/// Snapshot of buffer pool occupancy.
#[derive(Debug, Clone)]
pub struct BufferStats {
    /// Pages currently resident.
    pub resident: usize,
    /// Pages currently pinned.
    pub pinned: usize,
    /// Resident pages with unflushed mutations.
    pub dirty: usize,
}

/// Returns a pool size covering 25% of available system RAM, with a floor
/// so small machines still get a useful cache.
pub fn auto_sized_pool_pages() -> usize {
    let mut sys = System::new();
    sys.refresh_memory();
    let target_bytes = sys.available_memory() as usize / 4;
    (target_bytes / PAGE_SIZE).max(1_000)
}

/// The buffer manager.
pub struct BufferManager {
    dir: PathBuf,
    data_file: File,
    wal: Arc<WalWriter>,
    nodes: HashMap<PageId, BufferedNode>,
    /// Residency order; eviction takes the first non-pinned entry.
    resident_order: VecDeque<PageId>,
    pinned: HashSet<PageId>,
    capacity: usize,
    fsync: bool,
    /// In-memory copy of the persistent metadata.
    pub metadata: Metadata,
}

impl BufferManager {
    /// Opens a database directory, creating it if absent.
    ///
    /// A fresh data file gets page 0 allocated as the initial leaf root.
    /// A leftover WAL from a crashed session is replayed, and when the
    /// crash left the sidecar stale the metadata is reconstructed from
    /// the page file itself.
    pub fn open(dir: &Path, config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(DATA_FILE_NAME))?;
        let wal = Arc::new(WalWriter::open_with_sync(dir, config.fsync_enabled)?);
        let wal_len = wal.end_off();

        let mut manager = Self {
            dir: dir.to_path_buf(),
            data_file,
            wal,
            nodes: HashMap::new(),
            resident_order: VecDeque::new(),
            pinned: HashSet::new(),
            capacity: config.buffer_pool_pages.max(1),
            fsync: config.fsync_enabled,
            metadata: Metadata::default(),
        };

        let file_pages = (manager.data_file.metadata()?.len() / PAGE_SIZE as u64) as u32;
        if file_pages == 0 {
            if wal_len > 0 {
                // A log without a data file cannot be replayed.
                manager.wal.reset()?;
            }
            let root = manager.allocate_page(CellType::Leaf)?;
            manager.metadata.root_id = root;
        } else if wal_len > 0 {
            // Crashed session: the sidecar (if any) predates the crash, so
            // everything derivable is rebuilt from the file and the log.
            manager.metadata.node_num = file_pages;
            manager.replay_wal()?;
            manager.recover_metadata()?;
        } else {
            match std::fs::read(dir.join(METADATA_FILE_NAME)) {
                Ok(bytes) => manager.metadata = Metadata::from_bytes(&bytes)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    manager.metadata.node_num = file_pages;
                    manager.recover_metadata()?;
                }
                Err(e) => return Err(e.into()),
            }
            if manager.metadata.node_num != file_pages {
                return Err(CydbError::MetadataCorrupted(format!(
                    "sidecar names {} pages but the data file holds {}",
                    manager.metadata.node_num, file_pages
                )));
            }
        }

        Ok(manager)
    }

    /// The database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Handle to the write-ahead log shared with every buffered node.
    pub fn wal(&self) -> &Arc<WalWriter> {
        &self.wal
    }

    /// Returns the node for `id`, reading and verifying the page if it is
    /// not resident. The borrow must not outlive the next call that could
    /// evict the page.
    pub fn get_mut(&mut self, id: PageId) -> Result<&mut BufferedNode> {
        if !self.nodes.contains_key(&id) {
            if id.0 >= self.metadata.node_num {
                return Err(CydbError::Internal(format!(
                    "{} was never allocated (node_num {})",
                    id, self.metadata.node_num
                )));
            }
            self.evict_if_needed()?;

            let mut buf = Box::new([0u8; PAGE_SIZE]);
            self.data_file.read_exact_at(&mut buf[..], id.file_offset())?;
            let node = BufferedNode::from_bytes(id, buf, Arc::clone(&self.wal))?;
            self.nodes.insert(id, node);
            self.resident_order.push_back(id);
        }

        self.nodes
            .get_mut(&id)
            .ok_or_else(|| CydbError::Internal(format!("{} vanished from the pool", id)))
    }

    /// Returns the current root node.
    pub fn get_root(&mut self) -> Result<&mut BufferedNode> {
        let root = self.metadata.root_id;
        self.get_mut(root)
    }

    /// Marks `id` non-evictable until unpinned.
    pub fn pin(&mut self, id: PageId) {
        self.pinned.insert(id);
    }

    /// Makes `id` evictable again.
    pub fn unpin(&mut self, id: PageId) {
        self.pinned.remove(&id);
    }

    /// True if `id` is currently pinned.
    pub fn is_pinned(&self, id: PageId) -> bool {
        self.pinned.contains(&id)
    }

    /// Stages a fresh empty page of the given type on disk and returns its
    /// id. The page becomes a buffered node on first `get_mut`.
    pub fn allocate_page(&mut self, cell_type: CellType) -> Result<PageId> {
        let id = PageId(self.metadata.node_num);

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        let header = PageHeader::new(cell_type, id);
        buf[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        refresh_checksum(&mut buf[..]);

        self.data_file.write_all_at(&buf[..], id.file_offset())?;
        if self.fsync {
            self.data_file.sync_data()?;
        }

        self.metadata.node_num += 1;
        Ok(id)
    }

    /// Zeroes the page's extent. The id is never reused.
    pub fn deallocate_page(&mut self, id: PageId) -> Result<()> {
        if self.pinned.contains(&id) {
            return Err(CydbError::Internal(format!(
                "cannot deallocate pinned {}",
                id
            )));
        }
        self.nodes.remove(&id);
        self.resident_order.retain(|&r| r != id);

        let zeros = vec![0u8; PAGE_SIZE];
        self.data_file.write_all_at(&zeros, id.file_offset())?;
        if self.fsync {
            self.data_file.sync_data()?;
        }
        Ok(())
    }

    /// Writes every dirty resident page back to the data file.
    pub fn flush_all(&mut self) -> Result<()> {
        let resident: Vec<PageId> = self.resident_order.iter().copied().collect();
        for id in resident {
            self.flush_node(id)?;
        }
        Ok(())
    }

    /// Flushes all pages, persists the metadata sidecar and removes the
    /// WAL. The manager must not be used afterwards.
    pub fn close(&mut self) -> Result<()> {
        self.flush_all()?;

        let mut meta_file = File::create(self.dir.join(METADATA_FILE_NAME))?;
        meta_file.write_all(&self.metadata.to_bytes())?;
        meta_file.sync_all()?;

        self.data_file.sync_all()?;
        self.wal.remove_log()?;

        self.nodes.clear();
        self.resident_order.clear();
        self.pinned.clear();
        Ok(())
    }

    /// Buffer pool occupancy.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            resident: self.nodes.len(),
            pinned: self.pinned.len(),
            dirty: self.nodes.values().filter(|n| n.is_dirty()).count(),
        }
    }

    /// Evicts the first non-pinned resident page when the pool is at
    /// capacity. With every page pinned the pool grows past its budget;
    /// the overshoot is bounded by the pin discipline (one root-to-leaf
    /// path plus a sibling and the parent chain).
    fn evict_if_needed(&mut self) -> Result<()> {
        while self.nodes.len() >= self.capacity {
            let victim = self
                .resident_order
                .iter()
                .copied()
                .find(|id| !self.pinned.contains(id));
            let Some(victim) = victim else { break };

            self.flush_node(victim)?;
            self.nodes.remove(&victim);
            self.resident_order.retain(|&id| id != victim);
        }
        Ok(())
    }

    /// Writes one page back if dirty, refreshing its checksum and the WAL
    /// trim watermark.
    fn flush_node(&mut self, id: PageId) -> Result<()> {
        let fsync = self.fsync;
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| CydbError::Internal(format!("flush of non-resident {}", id)))?;
        if !node.is_dirty() {
            return Ok(());
        }

        node.seal();
        self.data_file.write_all_at(&node.bytes()[..], id.file_offset())?;
        if fsync {
            self.data_file.sync_data()?;
        }
        self.wal.set_trim_off(node.wal_end_off());
        node.mark_clean();
        Ok(())
    }

    /// Replays the leftover log in file order (equal to sequence order),
    /// then fast-forwards the sequence counter past the highest replayed
    /// record.
    fn replay_wal(&mut self) -> Result<()> {
        let path = self.wal.path().to_path_buf();
        let mut reader = WalReader::open(&path)?;

        let mut max_seq = None;
        while let Some(record) = reader.read_record()? {
            if record.page_id.0 >= self.metadata.node_num {
                return Err(CydbError::WalCorrupted {
                    offset: reader.offset(),
                    reason: format!("record names unallocated {}", record.page_id),
                });
            }
            let end_off = reader.offset();
            let node = self.get_mut(record.page_id)?;
            node.apply_redo(&record.redo)?;
            node.set_wal_end_off(end_off);
            max_seq = Some(record.seq_num);
        }

        if let Some(seq) = max_seq {
            self.wal.set_next_seq(seq.wrapping_add(1));
        }

        // Drop any torn tail so new appends follow the last complete record.
        let consumed = reader.offset();
        if consumed < self.wal.end_off() {
            self.wal.truncate_to(consumed)?;
        }
        Ok(())
    }

    /// Rebuilds `root_id` and `data_num` by scanning page headers: the
    /// root is the page no internal node references. Pages allocated by a
    /// crashed split but never linked are ignored (they hold no data).
    fn recover_metadata(&mut self) -> Result<()> {
        let n = self.metadata.node_num;
        let mut referenced: HashSet<PageId> = HashSet::new();
        let mut data_total: u64 = 0;
        let mut pages: Vec<(PageId, usize)> = Vec::with_capacity(n as usize);

        for i in 0..n {
            let id = PageId(i);
            let node = self.get_mut(id)?;
            let data_num = node.data_num();
            match node.cell_type() {
                CellType::Internal => {
                    for j in 0..data_num {
                        referenced.insert(node.cell_child(j));
                    }
                    let rightmost = node.rightmost_child();
                    if rightmost != id {
                        referenced.insert(rightmost);
                    }
                }
                CellType::Leaf => data_total += data_num as u64,
            }
            pages.push((id, data_num));
        }

        let candidates: Vec<(PageId, usize)> = pages
            .iter()
            .filter(|(id, _)| !referenced.contains(id))
            .copied()
            .collect();

        let root = match candidates.as_slice() {
            [] => {
                return Err(CydbError::MetadataCorrupted(
                    "no root candidate in the data file".to_string(),
                ))
            }
            [(id, _)] => *id,
            _ => {
                // Orphans from a crashed allocation are empty; the live
                // root is the one candidate still holding structure.
                let occupied: Vec<(PageId, usize)> = candidates
                    .iter()
                    .filter(|(_, cells)| *cells > 0)
                    .copied()
                    .collect();
                match occupied.as_slice() {
                    [(id, _)] => *id,
                    _ => {
                        return Err(CydbError::MetadataCorrupted(format!(
                            "{} root candidates in the data file",
                            candidates.len()
                        )))
                    }
                }
            }
        };

        self.metadata.root_id = root;
        self.metadata.data_num = data_total;
        Ok(())
    }
}
