use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use super::core::{Memtable, ScanIter};
use super::frozen::FrozenMemtable;
use crate::error::Result;
use crate::types::{Entry, Key};
use crate::wal::Wal;

/// The single writable memtable. Freezing hands the underlying table over
/// to a [`FrozenMemtable`] and rejects any further writes.
pub struct ActiveMemtable {
    memtable: Arc<Memtable>,
}

impl ActiveMemtable {
    pub fn new(wal_path: &Path, wal_id: u64, sync_on_append: bool) -> Result<Self> {
        Ok(Self {
            memtable: Arc::new(Memtable::new(wal_path, wal_id, sync_on_append)?),
        })
    }

    pub fn from_wal(wal: Wal, wal_id: u64) -> Result<Self> {
        Ok(Self {
            memtable: Arc::new(Memtable::from_wal(wal, wal_id)?),
        })
    }

    pub fn freeze(&self) -> Result<FrozenMemtable> {
        self.memtable.freeze()?;
        Ok(FrozenMemtable::new(self.memtable.clone()))
    }

    pub fn put(&self, key: Key, entry: Entry) -> Result<()> {
        self.memtable.put(key, entry)
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.memtable.get(key)
    }

    pub fn size(&self) -> usize {
        self.memtable.size()
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

    pub fn sync(&self) -> Result<()> {
        self.memtable.sync()
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
