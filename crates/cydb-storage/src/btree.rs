//! B-tree driver: descent, split propagation and range scans.
//!
//! The driver owns the buffer manager and implements the tree-shaped
//! logic above the per-page protocol: descending to a leaf while
//! memoizing the parent path, retry-with-split on full nodes, promotion
//! through the parent chain with root growth, and an in-order range
//! scan driven by an explicit traversal stack (leaves carry no sibling
//! links).

use cydb_buffer::{BufferManager, BufferStats, Metadata};
use cydb_common::page::{key_value_cell_size, CellType, PageId, MAX_CELL_SIZE};
use cydb_common::{CydbError, Result, StorageConfig};
use std::collections::HashMap;
use std::path::Path;

/// Result of splitting one node: the separator promoted to the parent and
/// the two halves it now distinguishes.
struct SplitOutcome {
    promoted: Vec<u8>,
    /// Keys below the promoted separator stay here (the split node).
    lower: PageId,
    /// Keys at or above the promoted separator moved here (the sibling).
    upper: PageId,
}

/// An ordered key-value store backed by a paged B-tree.
pub struct BTree {
    manager: BufferManager,
    closed: bool,
}

impl BTree {
    /// Opens (or creates) the store in `dir`, replaying any leftover WAL.
    pub fn open(dir: &Path, config: &StorageConfig) -> Result<Self> {
        Ok(Self {
            manager: BufferManager::open(dir, config)?,
            closed: false,
        })
    }

    /// Engine metadata: root page, page count, key count.
    pub fn metadata(&self) -> &Metadata {
        &self.manager.metadata
    }

    /// Buffer pool occupancy.
    pub fn stats(&self) -> BufferStats {
        self.manager.stats()
    }

    /// Returns the value stored under `key`.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let (leaf, _) = self.go_to_leaf(key)?;
        let node = self.manager.get_mut(leaf)?;

        let index = node.find_value_index(key);
        if index >= node.data_num() || node.cell_key(index) != key {
            return Err(CydbError::KeyNotFound);
        }
        Ok(node.cell_value(index).to_vec())
    }

    /// Inserts or overwrites `key`, splitting and re-descending as often
    /// as needed.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let size = key_value_cell_size(key.len(), value.len());
        if size > MAX_CELL_SIZE {
            return Err(CydbError::CellTooLarge {
                size,
                max: MAX_CELL_SIZE,
            });
        }

        loop {
            let (leaf, mut parent_map) = self.go_to_leaf(key)?;
            let node = self.manager.get_mut(leaf)?;

            let index = node.find_value_index(key);
            let exists = index < node.data_num() && node.cell_key(index) == key;
            if exists {
                if node.try_update_value(index, value)?.is_some() {
                    return Ok(());
                }
            } else if node.try_insert_value(key, value)?.is_some() {
                self.manager.metadata.data_num += 1;
                return Ok(());
            }

            self.split(leaf, &mut parent_map)?;
        }
    }

    /// Removes `key`. Underflowing nodes are not merged; their free space
    /// is tracked per page.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let (leaf, _) = self.go_to_leaf(key)?;
        let node = self.manager.get_mut(leaf)?;

        let index = node.find_value_index(key);
        if index >= node.data_num() || node.cell_key(index) != key {
            return Err(CydbError::KeyNotFound);
        }
        node.remove(index)?;
        self.manager.metadata.data_num = self.manager.metadata.data_num.saturating_sub(1);
        Ok(())
    }

    /// Collects all pairs with `start <= key <= end` in key order.
    pub fn scan(&mut self, start: &[u8], end: &[u8]) -> Result<Scan> {
        let mut items = Vec::new();

        if start <= end {
            let mut stack = vec![self.manager.metadata.root_id];
            while let Some(id) = stack.pop() {
                let node = self.manager.get_mut(id)?;
                match node.cell_type() {
                    CellType::Leaf => {
                        for i in node.find_value_index(start)..node.data_num() {
                            let key = node.cell_key(i);
                            if key > end {
                                break;
                            }
                            items.push((key.to_vec(), node.cell_value(i).to_vec()));
                        }
                    }
                    CellType::Internal => {
                        // Child at separator index i covers keys in
                        // [key(i-1), key(i)); prune subtrees outside the range.
                        let n = node.data_num();
                        let first = node.find_child_index(start);
                        let mut children = Vec::new();
                        for index in first..=n {
                            if index > first && node.cell_key(index - 1) > end {
                                break;
                            }
                            children.push(if index < n {
                                node.cell_child(index)
                            } else {
                                node.rightmost_child()
                            });
                        }
                        // Reverse so the stack pops them left to right.
                        stack.extend(children.into_iter().rev());
                    }
                }
            }
        }

        Ok(Scan {
            items: items.into_iter(),
        })
    }

    /// Flushes every dirty page to the data file.
    pub fn flush(&mut self) -> Result<()> {
        self.manager.flush_all()
    }

    /// Flushes all pages, persists metadata and removes the WAL. The tree
    /// must not be used afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.manager.close()?;
        self.closed = true;
        Ok(())
    }

    /// Descends from the root to the leaf owning `key`, recording each
    /// child-to-parent edge along the way for later split propagation.
    fn go_to_leaf(&mut self, key: &[u8]) -> Result<(PageId, HashMap<PageId, PageId>)> {
        let mut parent_map = HashMap::new();
        let mut current = self.manager.metadata.root_id;
        let mut depth = 0u32;

        loop {
            let node = self.manager.get_mut(current)?;
            if node.cell_type() == CellType::Leaf {
                return Ok((current, parent_map));
            }

            let child = node.find_child(key);
            parent_map.insert(child, current);
            current = child;

            depth += 1;
            if depth > self.manager.metadata.node_num {
                return Err(CydbError::Internal(
                    "cycle detected while descending the tree".to_string(),
                ));
            }
        }
    }

    /// Splits `node_id`, promoting its middle separator into the parent
    /// (allocating a new root if the node has none) and recursing when
    /// the parent is full in turn.
    fn split(
        &mut self,
        node_id: PageId,
        parent_map: &mut HashMap<PageId, PageId>,
    ) -> Result<SplitOutcome> {
        self.manager.pin(node_id);
        let cell_type = match self.manager.get_mut(node_id) {
            Ok(node) => node.cell_type(),
            Err(e) => {
                self.manager.unpin(node_id);
                return Err(e);
            }
        };
        let sibling_id = match self.manager.allocate_page(cell_type) {
            Ok(id) => id,
            Err(e) => {
                self.manager.unpin(node_id);
                return Err(e);
            }
        };
        self.manager.pin(sibling_id);

        let outcome = self.split_pinned(node_id, sibling_id, cell_type, parent_map);

        self.manager.unpin(sibling_id);
        self.manager.unpin(node_id);
        outcome
    }

    fn split_pinned(
        &mut self,
        node_id: PageId,
        sibling_id: PageId,
        cell_type: CellType,
        parent_map: &mut HashMap<PageId, PageId>,
    ) -> Result<SplitOutcome> {
        // Read the upper half out of the node. Cells are moved to the
        // sibling before they are removed from the node, so a crash in
        // between never loses a logged mutation.
        let node = self.manager.get_mut(node_id)?;
        let n = node.data_num();
        let mid = n / 2 + 1;
        if mid >= n {
            return Err(CydbError::Internal(format!(
                "{} has too few cells to split ({})",
                node_id, n
            )));
        }

        let promoted;
        match cell_type {
            CellType::Leaf => {
                let cells: Vec<(Vec<u8>, Vec<u8>)> =
                    (mid..n).map(|i| node.key_value_cell(i)).collect();
                promoted = cells[0].0.clone();

                let sibling = self.manager.get_mut(sibling_id)?;
                for (key, value) in &cells {
                    sibling
                        .try_insert_value(key, value)?
                        .ok_or_else(|| sibling_overflow(sibling_id))?;
                }

                let node = self.manager.get_mut(node_id)?;
                for _ in mid..n {
                    node.remove(mid)?;
                }
            }
            CellType::Internal => {
                let cells: Vec<(Vec<u8>, PageId)> = (mid..n).map(|i| node.key_cell(i)).collect();
                let old_rightmost = node.rightmost_child();
                promoted = cells[0].0.clone();
                let promoted_child = cells[0].1;

                // The sibling takes the upper separators and inherits the
                // old rightmost child; the promoted separator's child
                // becomes the node's new rightmost.
                let sibling = self.manager.get_mut(sibling_id)?;
                sibling.try_update_child(0, old_rightmost)?;
                for (key, child) in cells.iter().skip(1) {
                    sibling
                        .try_insert_child(key, *child)?
                        .ok_or_else(|| sibling_overflow(sibling_id))?;
                }

                let node = self.manager.get_mut(node_id)?;
                for _ in mid..n {
                    node.remove(mid)?;
                }
                let data_num = node.data_num();
                node.try_update_child(data_num, promoted_child)?;
            }
        }

        // Locate the parent, growing the tree by one level if the split
        // node was the root.
        let parent_id = match parent_map.get(&node_id) {
            Some(&parent) => parent,
            None => {
                let parent = self.manager.allocate_page(CellType::Internal)?;
                self.manager.metadata.root_id = parent;
                parent
            }
        };
        self.manager.pin(parent_id);
        let wired = self.wire_parent(parent_id, &promoted, node_id, sibling_id, parent_map);
        self.manager.unpin(parent_id);
        wired?;

        Ok(SplitOutcome {
            promoted,
            lower: node_id,
            upper: sibling_id,
        })
    }

    /// Re-routes the parent slot that led to the split node so it now
    /// leads to the sibling (the upper half), then inserts the promoted
    /// separator routing the lower half, splitting the parent chain
    /// recursively when it is full.
    fn wire_parent(
        &mut self,
        parent_id: PageId,
        promoted: &[u8],
        node_id: PageId,
        sibling_id: PageId,
        parent_map: &mut HashMap<PageId, PageId>,
    ) -> Result<()> {
        let parent = self.manager.get_mut(parent_id)?;
        let index = parent.find_child_index(promoted);
        parent.try_update_child(index, sibling_id)?;

        if parent.try_insert_child(promoted, node_id)?.is_some() {
            return Ok(());
        }

        // Parent full: split it and re-attempt on whichever half owns the
        // promoted key. Separator keys are unique, so strict comparison
        // picks the side.
        let mut target = {
            let outcome = self.split(parent_id, parent_map)?;
            if promoted < &outcome.promoted[..] {
                outcome.lower
            } else {
                outcome.upper
            }
        };

        loop {
            self.manager.pin(target);
            let result = self
                .manager
                .get_mut(target)
                .and_then(|node| node.try_insert_child(promoted, node_id));
            self.manager.unpin(target);

            match result? {
                Some(_) => return Ok(()),
                None => {
                    let outcome = self.split(target, parent_map)?;
                    target = if promoted < &outcome.promoted[..] {
                        outcome.lower
                    } else {
                        outcome.upper
                    };
                }
            }
        }
    }
}

fn sibling_overflow(sibling_id: PageId) -> CydbError {
    CydbError::Internal(format!("fresh sibling {} overflowed during split", sibling_id))
}

impl Drop for BTree {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

/// Iterator over the pairs collected by [`BTree::scan`], in key order.
pub struct Scan {
    items: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for Scan {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl ExactSizeIterator for Scan {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn open_tree(pool_pages: usize) -> (BTree, TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            buffer_pool_pages: pool_pages,
            fsync_enabled: false,
        };
        let tree = BTree::open(dir.path(), &config).unwrap();
        (tree, dir)
    }

    /// Inserts numbered pairs until the root splits, mirroring how the
    /// engine is grown in anger.
    fn fill_until_split(tree: &mut BTree) -> u32 {
        let mut i = 0u32;
        loop {
            let key = i.to_string();
            tree.set(key.as_bytes(), key.as_bytes()).unwrap();
            i += 1;
            if tree.metadata().node_num > 1 {
                return i;
            }
        }
    }

    #[test]
    fn test_get_missing_key() {
        let (mut tree, _dir) = open_tree(64);
        assert!(matches!(tree.get(b"hello"), Err(CydbError::KeyNotFound)));
    }

    #[test]
    fn test_set_then_get() {
        let (mut tree, _dir) = open_tree(64);
        tree.set(b"hello", b"world").unwrap();
        assert_eq!(tree.get(b"hello").unwrap(), b"world");
        assert_eq!(tree.metadata().data_num, 1);
    }

    #[test]
    fn test_overwrite_does_not_bump_data_num() {
        let (mut tree, _dir) = open_tree(64);
        tree.set(b"k", b"XXXXX").unwrap();
        tree.set(b"k", b"Y").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), b"Y");
        assert_eq!(tree.metadata().data_num, 1);

        tree.set(b"k", b"ZZZZZZZZZ").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), b"ZZZZZZZZZ");
        assert_eq!(tree.metadata().data_num, 1);
    }

    #[test]
    fn test_remove_present_and_absent() {
        let (mut tree, _dir) = open_tree(64);
        tree.set(b"a", b"1").unwrap();

        tree.remove(b"a").unwrap();
        assert!(matches!(tree.get(b"a"), Err(CydbError::KeyNotFound)));
        assert!(matches!(tree.remove(b"a"), Err(CydbError::KeyNotFound)));
        assert_eq!(tree.metadata().data_num, 0);
    }

    #[test]
    fn test_first_split_shapes_the_tree() {
        let (mut tree, _dir) = open_tree(64);
        let inserted = fill_until_split(&mut tree);

        // Root split allocates a sibling (1) and a new root (2).
        assert_eq!(tree.metadata().node_num, 3);
        assert_eq!(tree.metadata().root_id, PageId(2));
        assert_eq!(tree.metadata().data_num, inserted as u64);

        for i in 0..inserted {
            let key = i.to_string();
            assert_eq!(tree.get(key.as_bytes()).unwrap(), key.as_bytes());
        }
    }

    #[test]
    fn test_remove_everything_after_split() {
        let (mut tree, _dir) = open_tree(64);
        let inserted = fill_until_split(&mut tree);

        for i in 0..inserted {
            tree.remove(i.to_string().as_bytes()).unwrap();
        }
        assert_eq!(tree.metadata().data_num, 0);

        for i in 0..inserted {
            assert!(matches!(
                tree.get(i.to_string().as_bytes()),
                Err(CydbError::KeyNotFound)
            ));
        }
    }

    /// A key wide enough that both leaves and internal nodes hold only a
    /// handful of cells, forcing splits to propagate several levels.
    fn wide_key(i: u32) -> Vec<u8> {
        let mut key = format!("{:06}", i).into_bytes();
        key.resize(2000, b'k');
        key
    }

    #[test]
    fn test_deep_tree_stays_consistent() {
        let (mut tree, _dir) = open_tree(16);

        let count = 800u32;
        for i in 0..count {
            tree.set(&wide_key(i), b"payload").unwrap();
        }
        assert_eq!(tree.metadata().data_num, count as u64);
        // Fan-out of ~8 cells per node means the root grew more than once.
        assert!(tree.metadata().node_num > 100);

        for i in (0..count).step_by(31) {
            assert_eq!(tree.get(&wide_key(i)).unwrap(), b"payload");
        }

        // A full scan sees every key exactly once, in order.
        let keys: Vec<Vec<u8>> = tree.scan(b"", &[0xFF]).unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), count as usize);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_scan_range_bounds_are_inclusive() {
        let (mut tree, _dir) = open_tree(64);
        for key in [&b"a"[..], b"b", b"c", b"d", b"e"] {
            tree.set(key, key).unwrap();
        }

        let got: Vec<Vec<u8>> = tree.scan(b"b", b"d").unwrap().map(|(k, _)| k).collect();
        assert_eq!(got, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_scan_empty_range() {
        let (mut tree, _dir) = open_tree(64);
        tree.set(b"m", b"1").unwrap();

        assert_eq!(tree.scan(b"x", b"a").unwrap().count(), 0);
        assert_eq!(tree.scan(b"n", b"z").unwrap().count(), 0);
    }

    #[test]
    fn test_oversized_cell_is_rejected() {
        let (mut tree, _dir) = open_tree(64);
        let huge = vec![0u8; MAX_CELL_SIZE];
        assert!(matches!(
            tree.set(b"k", &huge),
            Err(CydbError::CellTooLarge { .. })
        ));
    }

    #[test]
    fn test_nothing_left_pinned_after_splits() {
        let (mut tree, _dir) = open_tree(8);
        let value = vec![3u8; 1024];
        for i in 0..500u32 {
            tree.set(format!("{:06}", i).as_bytes(), &value).unwrap();
        }
        assert_eq!(tree.stats().pinned, 0);
    }

    #[test]
    fn test_tiny_pool_still_works() {
        let (mut tree, _dir) = open_tree(1);
        let value = vec![9u8; 256];
        for i in 0..1000u32 {
            tree.set(format!("{:05}", i).as_bytes(), &value).unwrap();
        }
        for i in (0..1000u32).step_by(41) {
            assert_eq!(tree.get(format!("{:05}", i).as_bytes()).unwrap(), value);
        }
    }
}
