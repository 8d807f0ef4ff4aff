//! External key-value facade.
//!
//! [`Db`] follows the engine protocol of the surrounding system: a handle
//! is constructed unopened, `open` binds it to a directory, and every
//! operation invoked before a successful `open` fails with `DbNotInit`.
//! Embedders that do not need that protocol can use [`BTree`] directly.

use crate::btree::{BTree, Scan};
use cydb_buffer::Metadata;
use cydb_common::{CydbError, Result, StorageConfig};
use std::path::Path;

/// An engine handle over one database directory.
#[derive(Default)]
pub struct Db {
    inner: Option<BTree>,
}

impl Db {
    /// Creates an unopened handle.
    pub fn new() -> Self {
        Self { inner: None }
    }

    /// Opens the database at `path` with the default configuration.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.open_with_config(path, StorageConfig::default())
    }

    /// Opens the database at `path`. A previously opened engine is closed
    /// first.
    pub fn open_with_config(
        &mut self,
        path: impl AsRef<Path>,
        config: StorageConfig,
    ) -> Result<()> {
        if let Some(mut tree) = self.inner.take() {
            tree.close()?;
        }
        self.inner = Some(BTree::open(path.as_ref(), &config)?);
        Ok(())
    }

    /// True once `open` has succeeded.
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns the value stored under `key`.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.tree()?.get(key)
    }

    /// Inserts or overwrites `key`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree()?.set(key, value)
    }

    /// Removes `key`.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.tree()?.remove(key)
    }

    /// Iterates all pairs with `start <= key <= end` in key order.
    pub fn scan(&mut self, start: &[u8], end: &[u8]) -> Result<Scan> {
        self.tree()?.scan(start, end)
    }

    /// Engine metadata: root page, page count, key count.
    pub fn metadata(&self) -> Result<&Metadata> {
        match &self.inner {
            Some(tree) => Ok(tree.metadata()),
            None => Err(CydbError::DbNotInit),
        }
    }

    /// Flushes all pages, persists metadata and removes the WAL. The
    /// handle returns to the unopened state.
    pub fn close(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(mut tree) => tree.close(),
            None => Err(CydbError::DbNotInit),
        }
    }

    fn tree(&mut self) -> Result<&mut BTree> {
        self.inner.as_mut().ok_or(CydbError::DbNotInit)
    }
}

// Dropping an open handle closes it best-effort; `BTree`'s own Drop
// flushes, so this is only about returning errors eagerly in `close`.
