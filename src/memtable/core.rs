//! In-memory sorted write buffer backed by a concurrent skip list.
//!
//! The memtable is the first stop for every write and the first level
//! consulted by reads. `crossbeam_skiplist::SkipMap` gives lock-free
//! concurrent readers alongside the single serialized writer, natural key
//! ordering for scans, and no rebalancing stalls.
//!
//! Each memtable is paired 1:1 with a WAL segment: an entry is appended to
//! the segment before it is inserted here, and the segment is deleted once
//! the memtable has been flushed into a level-0 sorted run.

use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::iterator::RangeFilter;
use crate::types::{Entry, Key};
use crate::wal::Wal;

#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<Key, Entry>,
    wal: Arc<Wal>,
    wal_id: u64,
    size: AtomicUsize,
    max_seq: AtomicU64,
    frozen: AtomicBool,
}

impl Memtable {
    /// Creates an empty memtable with a fresh WAL segment.
    pub fn new(wal_path: &std::path::Path, wal_id: u64, sync_on_append: bool) -> Result<Self> {
        let wal = Arc::new(Wal::open(wal_path, sync_on_append)?);
        Ok(Self {
            data: SkipMap::new(),
            wal,
            wal_id,
            size: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        })
    }

    /// Rebuilds a memtable by replaying an existing WAL segment.
    pub fn from_wal(wal: Wal, wal_id: u64) -> Result<Self> {
        let data = SkipMap::new();
        let size = AtomicUsize::new(0);
        let max_seq = AtomicU64::new(0);

        for record in wal.replay()? {
            let (key, entry) = record?;
            size.fetch_add(key.len() + entry.weight(), Ordering::SeqCst);
            max_seq.fetch_max(entry.seq, Ordering::SeqCst);
            data.insert(key, entry);
        }

        Ok(Self {
            data,
            wal: Arc::new(wal),
            wal_id,
            size,
            max_seq,
            frozen: AtomicBool::new(false),
        })
    }

    /// Inserts an entry, going through the WAL first. The in-memory map is
    /// only updated after the WAL append succeeded.
    pub fn put(&self, key: Key, entry: Entry) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }

        self.wal.append(&key, &entry)?;

        let weight = key.len() + entry.weight();
        self.max_seq.fetch_max(entry.seq, Ordering::SeqCst);
        self.data.insert(key, entry);
        self.size.fetch_add(weight, Ordering::SeqCst);

        Ok(())
    }

    /// Returns the buffered entry for a key, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.data.get(key).map(|e| e.value().clone())
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Highest sequence number buffered here, 0 when empty.
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::SeqCst)
    }

    pub fn wal_id(&self) -> u64 {
        self.wal_id
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn sync(&self) -> Result<()> {
        self.wal.sync()
    }

    /// Full ordered iteration over buffered entries.
    pub fn iter(self: &Arc<Self>) -> MemtableIterator {
        MemtableIterator::new(self.clone())
    }

    /// Ordered iteration restricted to a key range.
    pub fn scan<R>(self: &Arc<Self>, range: R) -> ScanIter<R>
    where
        R: RangeBounds<Vec<u8>>,
    {
        RangeFilter::new(self.iter(), range)
    }
}

/// Lazy iterator over a memtable snapshot. Holds an `Arc` so the memtable
/// outlives any scan that still reads it, and re-seeks by the last yielded
/// key so concurrent inserts never invalidate the cursor.
pub struct MemtableIterator {
    memtable: Arc<Memtable>,
    last_key: Option<Key>,
    exhausted: bool,
}

impl MemtableIterator {
    pub fn new(memtable: Arc<Memtable>) -> Self {
        Self {
            memtable,
            last_key: None,
            exhausted: false,
        }
    }
}

impl Iterator for MemtableIterator {
    type Item = Result<(Key, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let range = match &self.last_key {
            Some(key) => (Bound::Excluded(key.clone()), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };

        match self.memtable.data.range(range).next() {
            Some(entry) => {
                let key = entry.key().clone();
                let value = entry.value().clone();
                self.last_key = Some(key.clone());
                Some(Ok((key, value)))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

pub type ScanIter<R> = RangeFilter<MemtableIterator, R>;
