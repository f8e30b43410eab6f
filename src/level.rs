//! Sorted runs and the level hierarchy that organizes them.
//!
//! Runs are immutable once published and shared through `Arc`. A reader
//! that pinned a run keeps its file alive even after a compaction retires
//! it: retirement only marks the run obsolete, and the file is removed when
//! the last reference drops.
//!
//! L0 runs may overlap (each is a memtable flush) and are consulted newest
//! first. Runs in L1 and deeper are pairwise key-disjoint and kept sorted
//! by min key, so at most one run per level can contain a given key.

use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::manifest::RunMeta;
use crate::sstable::{TableReader, TableScanIter};
use crate::types::{Entry, Key};

pub struct SortedRun {
    pub id: u64,
    pub level: u32,
    pub path: PathBuf,
    pub size: u64,
    pub entry_count: u64,
    pub min_key: Key,
    pub max_key: Key,
    reader: TableReader,
    obsolete: AtomicBool,
}

impl SortedRun {
    /// File name for a run: `L<level>-<id>.sst`.
    pub fn file_name(level: u32, id: u64) -> String {
        format!("L{}-{:08}.sst", level, id)
    }

    pub fn open(dir: &Path, meta: &RunMeta) -> Result<Self> {
        let path = dir.join(Self::file_name(meta.level, meta.id));
        let reader = TableReader::open(&path)?;
        Ok(Self {
            id: meta.id,
            level: meta.level,
            path,
            size: meta.size,
            entry_count: meta.entry_count,
            min_key: meta.min_key.clone(),
            max_key: meta.max_key.clone(),
            reader,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn meta(&self) -> RunMeta {
        RunMeta {
            id: self.id,
            level: self.level,
            size: self.size,
            entry_count: self.entry_count,
            min_key: self.min_key.clone(),
            max_key: self.max_key.clone(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if key < self.min_key.as_slice() || key > self.max_key.as_slice() {
            return Ok(None);
        }
        self.reader.get(key)
    }

    /// Lazy range scan. The returned iterator holds a reference to this
    /// run, pinning its file against deletion for the cursor's lifetime.
    pub fn scan<R>(self: &Arc<Self>, range: R) -> Result<Pinned<TableScanIter<R>>>
    where
        R: RangeBounds<Vec<u8>> + Clone,
    {
        Ok(Pinned {
            iter: self.reader.scan(range)?,
            _run: self.clone(),
        })
    }

    /// Full iteration for compaction.
    pub fn iter(self: &Arc<Self>) -> Result<Pinned<TableScanIter<std::ops::RangeFull>>> {
        self.scan(..)
    }

    pub fn overlaps(&self, min: &[u8], max: &[u8]) -> bool {
        self.min_key.as_slice() <= max && self.max_key.as_slice() >= min
    }

    /// Schedule the backing file for deletion once the last reference to
    /// this run drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }
}

impl Drop for SortedRun {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(run_id = self.id, error = %e, "failed to delete retired run file");
            }
        }
    }
}

impl std::fmt::Debug for SortedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedRun")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("size", &self.size)
            .field("entry_count", &self.entry_count)
            .finish()
    }
}

/// An iterator that keeps its source run alive.
pub struct Pinned<I> {
    iter: I,
    _run: Arc<SortedRun>,
}

impl<I: Iterator> Iterator for Pinned<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Level {
    pub level_num: u32,
    pub runs: Vec<Arc<SortedRun>>,
}

impl Level {
    pub fn new(level_num: u32) -> Self {
        Self {
            level_num,
            runs: Vec::new(),
        }
    }

    /// Total bytes held by this level.
    pub fn size(&self) -> u64 {
        self.runs.iter().map(|run| run.size).sum()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// L0 appends (flush order = recency order); deeper levels keep their
    /// disjoint runs sorted by min key.
    pub fn add_run(&mut self, run: Arc<SortedRun>) {
        if self.level_num == 0 {
            self.runs.push(run);
        } else {
            let pos = self
                .runs
                .partition_point(|existing| existing.min_key < run.min_key);
            self.runs.insert(pos, run);
        }
    }

    pub fn remove_run(&mut self, id: u64) -> Option<Arc<SortedRun>> {
        let pos = self.runs.iter().position(|run| run.id == id)?;
        Some(self.runs.remove(pos))
    }

    /// Point lookup within this level. L0 probes newest-first since runs
    /// may overlap; deeper levels have at most one candidate run.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if self.level_num == 0 {
            for run in self.runs.iter().rev() {
                if let Some(entry) = run.get(key)? {
                    return Ok(Some(entry));
                }
            }
            return Ok(None);
        }

        for run in &self.runs {
            if key >= run.min_key.as_slice() && key <= run.max_key.as_slice() {
                return run.get(key);
            }
        }
        Ok(None)
    }

    /// Runs whose key range intersects `[min, max]`.
    pub fn overlapping(&self, min: &[u8], max: &[u8]) -> Vec<Arc<SortedRun>> {
        self.runs
            .iter()
            .filter(|run| run.overlaps(min, max))
            .cloned()
            .collect()
    }

    /// The oldest run (smallest id), the compaction victim for this level.
    pub fn oldest_run(&self) -> Option<Arc<SortedRun>> {
        self.runs.iter().min_by_key(|run| run.id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::TableWriter;
    use tempfile::TempDir;

    fn build_run(dir: &Path, level: u32, id: u64, entries: &[(Vec<u8>, Entry)]) -> Arc<SortedRun> {
        let path = dir.join(SortedRun::file_name(level, id));
        let mut writer = TableWriter::create(&path, entries.len(), 0.01, 256).unwrap();
        for (key, entry) in entries {
            writer.add(key, entry).unwrap();
        }
        let summary = writer.finish().unwrap();

        let meta = RunMeta {
            id,
            level,
            size: summary.file_size,
            entry_count: summary.entry_count,
            min_key: summary.min_key,
            max_key: summary.max_key,
        };
        Arc::new(SortedRun::open(dir, &meta).unwrap())
    }

    fn entries(pairs: &[(&[u8], u64, &[u8])]) -> Vec<(Vec<u8>, Entry)> {
        pairs
            .iter()
            .map(|(k, seq, v)| (k.to_vec(), Entry::put(*seq, v.to_vec())))
            .collect()
    }

    #[test]
    fn test_run_get_respects_key_range() {
        let dir = TempDir::new().unwrap();
        let run = build_run(
            dir.path(),
            0,
            0,
            &entries(&[(b"b", 1, b"1"), (b"d", 2, b"2")]),
        );

        assert_eq!(run.get(b"b").unwrap(), Some(Entry::put(1, b"1".to_vec())));
        assert_eq!(run.get(b"a").unwrap(), None);
        assert_eq!(run.get(b"e").unwrap(), None);
        assert_eq!(run.get(b"c").unwrap(), None);
    }

    #[test]
    fn test_obsolete_run_deletes_file_on_last_drop() {
        let dir = TempDir::new().unwrap();
        let run = build_run(dir.path(), 0, 0, &entries(&[(b"a", 1, b"1")]));
        let path = run.path.clone();

        let pinned = run.iter().unwrap();
        run.mark_obsolete();
        drop(run);
        // The scan still pins the file.
        assert!(path.exists());

        drop(pinned);
        assert!(!path.exists());
    }

    #[test]
    fn test_level0_get_newest_first() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(0);
        level.add_run(build_run(dir.path(), 0, 1, &entries(&[(b"k", 1, b"old")])));
        level.add_run(build_run(dir.path(), 0, 2, &entries(&[(b"k", 5, b"new")])));

        let entry = level.get(b"k").unwrap().unwrap();
        assert_eq!(entry.value, Some(b"new".to_vec()));
    }

    #[test]
    fn test_deeper_level_sorted_and_disjoint_lookup() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(1);
        level.add_run(build_run(
            dir.path(),
            1,
            3,
            &entries(&[(b"m", 3, b"m1"), (b"p", 4, b"p1")]),
        ));
        level.add_run(build_run(
            dir.path(),
            1,
            2,
            &entries(&[(b"a", 1, b"a1"), (b"c", 2, b"c1")]),
        ));

        // Insertion kept min-key order despite reversed add order.
        assert_eq!(level.runs[0].min_key, b"a".to_vec());
        assert_eq!(level.runs[1].min_key, b"m".to_vec());

        assert_eq!(
            level.get(b"c").unwrap(),
            Some(Entry::put(2, b"c1".to_vec()))
        );
        assert_eq!(
            level.get(b"p").unwrap(),
            Some(Entry::put(4, b"p1".to_vec()))
        );
        assert_eq!(level.get(b"z").unwrap(), None);
    }

    #[test]
    fn test_overlapping_selection() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(1);
        level.add_run(build_run(
            dir.path(),
            1,
            1,
            &entries(&[(b"a", 1, b"v"), (b"c", 2, b"v")]),
        ));
        level.add_run(build_run(
            dir.path(),
            1,
            2,
            &entries(&[(b"f", 3, b"v"), (b"h", 4, b"v")]),
        ));

        let hits = level.overlapping(b"b", b"d");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);

        let hits = level.overlapping(b"a", b"z");
        assert_eq!(hits.len(), 2);

        assert!(level.overlapping(b"x", b"z").is_empty());
    }

    #[test]
    fn test_oldest_run() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(1);
        level.add_run(build_run(dir.path(), 1, 7, &entries(&[(b"m", 1, b"v")])));
        level.add_run(build_run(dir.path(), 1, 3, &entries(&[(b"a", 2, b"v")])));

        assert_eq!(level.oldest_run().unwrap().id, 3);
    }
}
