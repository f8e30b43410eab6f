use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;

use super::core::{Memtable, MemtableIterator, ScanIter};
use crate::error::Result;
use crate::types::Entry;
use crate::wal::Wal;

/// A read-only memtable queued for flushing. Stays readable by queries
/// until its level-0 sorted run has been published.
pub struct FrozenMemtable {
    memtable: Arc<Memtable>,
}

impl FrozenMemtable {
    pub(super) fn new(memtable: Arc<Memtable>) -> Self {
        Self { memtable }
    }

    /// Rebuild a frozen memtable from a WAL segment left by a crash.
    pub fn from_wal(wal: Wal, wal_id: u64) -> Result<Self> {
        let memtable = Arc::new(Memtable::from_wal(wal, wal_id)?);
        memtable.freeze()?;
        Ok(Self { memtable })
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.memtable.get(key)
    }

    pub fn len(&self) -> usize {
        self.memtable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    pub fn max_seq(&self) -> u64 {
        self.memtable.max_seq()
    }

    pub fn wal_id(&self) -> u64 {
        self.memtable.wal_id()
    }

    pub fn wal_path(&self) -> PathBuf {
        self.memtable.wal().path().to_path_buf()
    }

    pub fn iter(&self) -> MemtableIterator {
        self.memtable.iter()
    }

    pub fn scan<R>(&self, range: R) -> ScanIter<R>
    where
        R: RangeBounds<Vec<u8>>,
    {
        self.memtable.scan(range)
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }
}
