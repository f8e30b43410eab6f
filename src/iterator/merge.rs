//! K-way recency merge across sorted entry streams.
//!
//! Each source (memtable, sorted run) yields strictly increasing keys. The
//! merge pops the globally smallest key from a min-heap; when several
//! sources carry the same key, the entry with the highest sequence number
//! surfaces first and the rest are skipped. The heap is therefore keyed by
//! `(key ascending, sequence descending)` and the output carries each key
//! exactly once with its most recent entry, tombstones included.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::types::{Entry, Key};

/// A boxed source of sorted, strictly-key-increasing entries.
pub type EntryIter = Box<dyn Iterator<Item = Result<(Key, Entry)>> + Send>;

struct HeapItem {
    key: Key,
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    // BinaryHeap is a max-heap: reverse the key order so the smallest key
    // pops first, and on key ties let the highest sequence win.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => self
                .entry
                .seq
                .cmp(&other.entry.seq)
                .then_with(|| other.source.cmp(&self.source)),
            ord => ord.reverse(),
        }
    }
}

pub struct MergeIterator {
    sources: Vec<EntryIter>,
    heap: BinaryHeap<HeapItem>,
    last_key: Option<Key>,
    pending_error: Option<crate::Error>,
}

impl MergeIterator {
    pub fn new(mut sources: Vec<EntryIter>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut pending_error = None;

        for (source, iter) in sources.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok((key, entry))) => heap.push(HeapItem { key, entry, source }),
                // Surfaced on the first next() call; the merge then aborts.
                Some(Err(e)) => pending_error = Some(e),
                None => {}
            }
        }

        Self {
            sources,
            heap,
            last_key: None,
            pending_error,
        }
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(item) = self.sources[source].next() {
            let (key, entry) = item?;
            self.heap.push(HeapItem { key, entry, source });
        }
        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Key, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            self.heap.clear();
            return Some(Err(e));
        }

        while let Some(item) = self.heap.pop() {
            if let Err(e) = self.advance(item.source) {
                self.heap.clear();
                return Some(Err(e));
            }

            // An equal key from an older source: shadowed, skip it.
            if self.last_key.as_ref() == Some(&item.key) {
                continue;
            }

            self.last_key = Some(item.key.clone());
            return Some(Ok((item.key, item.entry)));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(entries: Vec<(&[u8], Entry)>) -> EntryIter {
        Box::new(
            entries
                .into_iter()
                .map(|(k, e)| Ok((k.to_vec(), e)))
                .collect::<Vec<_>>()
                .into_iter(),
        )
    }

    #[test]
    fn test_merges_in_key_order() {
        let a = source(vec![
            (b"a", Entry::put(1, b"1".to_vec())),
            (b"d", Entry::put(2, b"2".to_vec())),
        ]);
        let b = source(vec![
            (b"b", Entry::put(3, b"3".to_vec())),
            (b"c", Entry::put(4, b"4".to_vec())),
        ]);

        let keys: Vec<_> = MergeIterator::new(vec![a, b])
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn test_highest_sequence_wins() {
        let newer = source(vec![(b"k", Entry::put(10, b"new".to_vec()))]);
        let older = source(vec![(b"k", Entry::put(3, b"old".to_vec()))]);

        let merged: Vec<_> = MergeIterator::new(vec![older, newer])
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1, Entry::put(10, b"new".to_vec()));
    }

    #[test]
    fn test_tombstone_recency_preserved() {
        let a = source(vec![(b"k", Entry::tombstone(7))]);
        let b = source(vec![(b"k", Entry::put(2, b"v".to_vec()))]);

        let merged: Vec<_> = MergeIterator::new(vec![a, b])
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(merged, vec![(b"k".to_vec(), Entry::tombstone(7))]);
    }

    #[test]
    fn test_three_way_duplicates() {
        let a = source(vec![
            (b"a", Entry::put(1, b"a1".to_vec())),
            (b"b", Entry::put(5, b"b5".to_vec())),
        ]);
        let b = source(vec![(b"b", Entry::put(3, b"b3".to_vec()))]);
        let c = source(vec![
            (b"b", Entry::put(8, b"b8".to_vec())),
            (b"c", Entry::put(2, b"c2".to_vec())),
        ]);

        let merged: Vec<_> = MergeIterator::new(vec![a, b, c])
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            merged,
            vec![
                (b"a".to_vec(), Entry::put(1, b"a1".to_vec())),
                (b"b".to_vec(), Entry::put(8, b"b8".to_vec())),
                (b"c".to_vec(), Entry::put(2, b"c2".to_vec())),
            ]
        );
    }

    #[test]
    fn test_error_propagates() {
        let bad: EntryIter = Box::new(
            vec![
                Ok((b"a".to_vec(), Entry::put(1, b"1".to_vec()))),
                Err(crate::Error::Corruption("bad block".into())),
            ]
            .into_iter(),
        );

        let mut merged = MergeIterator::new(vec![bad]);
        assert!(merged.next().unwrap().is_err());
        assert!(merged.next().is_none());
    }

    #[test]
    fn test_empty_sources() {
        let merged: Vec<_> = MergeIterator::new(vec![]).collect();
        assert!(merged.is_empty());
    }
}
