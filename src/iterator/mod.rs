//! Iterator plumbing shared by memtables, sorted runs and the store.

pub mod merge;
pub mod range;

pub use merge::{EntryIter, MergeIterator};
pub use range::RangeFilter;

use crate::types::{Key, Value};

/// The store-level scan iterator: a recency merge with tombstones
/// suppressed, yielding each live key exactly once in ascending order.
pub struct ScanIterator {
    inner: MergeIterator,
}

impl ScanIterator {
    pub fn new(sources: Vec<EntryIter>) -> Self {
        Self {
            inner: MergeIterator::new(sources),
        }
    }
}

impl Iterator for ScanIterator {
    type Item = crate::error::Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((key, entry)) => match entry.value {
                    Some(value) => return Some(Ok((key, value))),
                    None => continue, // tombstone
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
