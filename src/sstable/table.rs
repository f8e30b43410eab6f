//! Sorted-run (SSTable) files: immutable, sorted, bloom-guarded.
//!
//! # File layout
//!
//! ```text
//! +--------------------+
//! | Data Block 1       |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | Data Block N       |
//! +--------------------+
//! | Bloom Filter       |
//! +--------------------+
//! | Sparse Index       |
//! +--------------------+
//! | Footer             |
//! +--------------------+
//! ```
//!
//! The footer carries `bloom_offset`, `index_offset`, `entry_count` and the
//! min/max key, and ends in a fixed 12-byte trailer
//! `[footer_len: u32][format_version: u32][magic: u32]` so a reader can
//! locate it from the end of the file. Unknown versions and bad magic are
//! refused at open.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::iterator::RangeFilter;
use crate::types::{Entry, Key};

use super::block::{self, Block, MultiBlockIterator};
use super::index::SparseIndex;

/// "SILS" in ASCII.
const TABLE_MAGIC: u32 = 0x5349_4C53;
pub const TABLE_FORMAT_VERSION: u32 = 1;
const TRAILER_SIZE: u64 = 12;

/// Carried back to the flush/compaction caller after a successful finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSummary {
    pub entry_count: u64,
    pub min_key: Key,
    pub max_key: Key,
    pub file_size: u64,
}

/// Streams a strictly-key-increasing entry sequence into a sorted-run file.
pub struct TableWriter {
    file: File,
    path: PathBuf,
    block: block::Builder,
    block_size: usize,
    index: SparseIndex,
    bloom: BloomFilter,
    offset: u64,
    entry_count: u64,
    first_key_in_block: Option<Key>,
    min_key: Option<Key>,
    last_key: Option<Key>,
}

impl TableWriter {
    pub fn create(
        path: impl Into<PathBuf>,
        expected_entries: usize,
        bloom_fp_rate: f64,
        block_size: usize,
    ) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            file,
            path,
            block: block::Builder::new(),
            block_size,
            index: SparseIndex::new(),
            bloom: BloomFilter::new(expected_entries, bloom_fp_rate),
            offset: 0,
            entry_count: 0,
            first_key_in_block: None,
            min_key: None,
            last_key: None,
        })
    }

    /// Append one entry. Duplicates were collapsed upstream, so keys must
    /// arrive strictly increasing.
    pub fn add(&mut self, key: &[u8], entry: &Entry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(Error::InvalidState(
                    "sorted-run keys must be strictly increasing".to_string(),
                ));
            }
        }

        if self.first_key_in_block.is_none() {
            self.first_key_in_block = Some(key.to_vec());
        }
        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }

        self.bloom.add(key);
        self.block.add_entry(key, entry);
        self.entry_count += 1;
        self.last_key = Some(key.to_vec());

        if self.block.len() >= self.block_size {
            self.spill_block()?;
        }
        Ok(())
    }

    /// Bytes already committed to the file plus the pending block. Used by
    /// compaction to roll output files at their size bound.
    pub fn written_bytes(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn spill_block(&mut self) -> Result<()> {
        let builder = std::mem::take(&mut self.block);
        let data = builder.finish();
        let first_key = self.first_key_in_block.take().ok_or_else(|| {
            Error::InvalidState("spilling a block with no first key".to_string())
        })?;

        self.file.write_all(&data)?;
        self.index.push(first_key, self.offset, data.len() as u64);
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Write bloom, sparse index and footer, then fsync. Consumes the
    /// writer; the file is immutable from here on.
    pub fn finish(mut self) -> Result<TableSummary> {
        if self.entry_count == 0 {
            return Err(Error::InvalidState(
                "cannot finalize an empty sorted run".to_string(),
            ));
        }
        if !self.block.is_empty() {
            self.spill_block()?;
        }

        let bloom_offset = self.offset;
        let bloom_data = self.bloom.encode();
        self.file.write_all(&bloom_data)?;

        let index_offset = bloom_offset + bloom_data.len() as u64;
        let index_data = self.index.encode();
        self.file.write_all(&index_data)?;

        let min_key = self.min_key.unwrap_or_default();
        let max_key = self.last_key.unwrap_or_default();

        let mut footer = Vec::new();
        footer.write_u64::<BigEndian>(bloom_offset)?;
        footer.write_u64::<BigEndian>(index_offset)?;
        footer.write_u64::<BigEndian>(self.entry_count)?;
        footer.write_u32::<BigEndian>(min_key.len() as u32)?;
        footer.extend_from_slice(&min_key);
        footer.write_u32::<BigEndian>(max_key.len() as u32)?;
        footer.extend_from_slice(&max_key);

        self.file.write_all(&footer)?;
        self.file.write_u32::<BigEndian>(footer.len() as u32)?;
        self.file.write_u32::<BigEndian>(TABLE_FORMAT_VERSION)?;
        self.file.write_u32::<BigEndian>(TABLE_MAGIC)?;
        self.file.sync_all()?;

        let file_size = index_offset + index_data.len() as u64 + footer.len() as u64 + TRAILER_SIZE;
        Ok(TableSummary {
            entry_count: self.entry_count,
            min_key,
            max_key,
            file_size,
        })
    }
}

/// Read-only handle to a finalized sorted-run file. The bloom filter and
/// sparse index live in memory; data blocks are read on demand.
pub struct TableReader {
    file: File,
    index: SparseIndex,
    bloom: BloomFilter,
    entry_count: u64,
    min_key: Key,
    max_key: Key,
}

impl TableReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < TRAILER_SIZE {
            return Err(Error::Corruption(format!(
                "sorted run {} shorter than trailer",
                path.display()
            )));
        }

        file.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;
        let footer_len = file.read_u32::<BigEndian>()? as u64;
        let version = file.read_u32::<BigEndian>()?;
        let magic = file.read_u32::<BigEndian>()?;

        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad sorted-run magic in {}: {:#010x}",
                path.display(),
                magic
            )));
        }
        if version != TABLE_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported sorted-run format version {} in {}",
                version,
                path.display()
            )));
        }
        if footer_len + TRAILER_SIZE > file_size {
            return Err(Error::Corruption(format!(
                "sorted-run footer out of bounds in {}",
                path.display()
            )));
        }

        let footer_start = file_size - TRAILER_SIZE - footer_len;
        file.seek(SeekFrom::Start(footer_start))?;
        let mut footer = vec![0u8; footer_len as usize];
        file.read_exact(&mut footer)?;

        let mut cursor = std::io::Cursor::new(footer.as_slice());
        let bloom_offset = cursor.read_u64::<BigEndian>()?;
        let index_offset = cursor.read_u64::<BigEndian>()?;
        let entry_count = cursor.read_u64::<BigEndian>()?;

        let min_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut min_key = vec![0u8; min_key_len];
        cursor
            .read_exact(&mut min_key)
            .map_err(|e| Error::Corruption(format!("footer min key: {e}")))?;

        let max_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut max_key = vec![0u8; max_key_len];
        cursor
            .read_exact(&mut max_key)
            .map_err(|e| Error::Corruption(format!("footer max key: {e}")))?;

        if bloom_offset > index_offset || index_offset > footer_start {
            return Err(Error::Corruption(format!(
                "inconsistent section offsets in {}",
                path.display()
            )));
        }

        let mut bloom_data = vec![0u8; (index_offset - bloom_offset) as usize];
        file.seek(SeekFrom::Start(bloom_offset))?;
        file.read_exact(&mut bloom_data)?;
        let bloom = BloomFilter::decode(&bloom_data)?;

        let mut index_data = vec![0u8; (footer_start - index_offset) as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_data)?;
        let index = SparseIndex::decode(&index_data)?;

        Ok(Self {
            file,
            index,
            bloom,
            entry_count,
            min_key,
            max_key,
        })
    }

    /// Point lookup: bloom gate, sparse-index locate, single-block scan.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if !self.bloom.might_contain(key) {
            return Ok(None);
        }

        let anchor = match self.index.find(key) {
            Some(anchor) => anchor,
            None => return Ok(None),
        };

        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(anchor.offset))?;
        let mut data = vec![0u8; anchor.size as usize];
        reader.read_exact(&mut data)?;

        Block::new(data)?.get(key)
    }

    /// Lazy ordered scan over a key range. Each call returns a fresh,
    /// independent cursor.
    pub fn scan<R>(&self, range: R) -> Result<TableScanIter<R>>
    where
        R: RangeBounds<Vec<u8>> + Clone,
    {
        let handles = self.index.range(range.clone());
        let reader = self.file.try_clone()?;
        let mut multi = MultiBlockIterator::new(reader, handles);

        if let Bound::Included(key) | Bound::Excluded(key) = range.start_bound() {
            multi.seek_first_block(key)?;
        }

        Ok(RangeFilter::new(multi, range))
    }

    /// Full ordered iteration, used by compaction.
    pub fn iter(&self) -> Result<TableScanIter<std::ops::RangeFull>> {
        self.scan(..)
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }
}

pub type TableScanIter<R> = RangeFilter<MultiBlockIterator, R>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_table(path: &Path, entries: &[(Vec<u8>, Entry)]) -> TableSummary {
        let mut writer =
            TableWriter::create(path, entries.len(), 0.01, 256).expect("create failed");
        for (key, entry) in entries {
            writer.add(key, entry).expect("add failed");
        }
        writer.finish().expect("finish failed")
    }

    fn numbered_entries(count: usize) -> Vec<(Vec<u8>, Entry)> {
        (0..count)
            .map(|i| {
                (
                    format!("key_{:04}", i).into_bytes(),
                    Entry::put(i as u64, format!("value_{:04}", i).into_bytes()),
                )
            })
            .collect()
    }

    #[test]
    fn test_write_and_get() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        let entries = numbered_entries(100);

        let summary = write_table(&path, &entries);
        assert_eq!(summary.entry_count, 100);
        assert_eq!(summary.min_key, b"key_0000".to_vec());
        assert_eq!(summary.max_key, b"key_0099".to_vec());

        let reader = TableReader::open(&path).expect("open failed");
        for (key, entry) in &entries {
            let found = reader.get(key).unwrap().expect("key missing");
            assert_eq!(&found, entry);
        }
        assert!(reader.get(b"key_9999").unwrap().is_none());
        assert!(reader.get(b"aaaa").unwrap().is_none());
    }

    #[test]
    fn test_tombstones_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        let entries = vec![
            (b"alive".to_vec(), Entry::put(1, b"v".to_vec())),
            (b"dead".to_vec(), Entry::tombstone(2)),
        ];

        write_table(&path, &entries);
        let reader = TableReader::open(&path).unwrap();

        let dead = reader.get(b"dead").unwrap().expect("tombstone missing");
        assert!(dead.is_tombstone());
        assert_eq!(dead.seq, 2);
    }

    #[test]
    fn test_scan_range_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        let entries = numbered_entries(100);
        write_table(&path, &entries);

        let reader = TableReader::open(&path).unwrap();
        let scanned: Vec<_> = reader
            .scan(b"key_0010".to_vec()..=b"key_0020".to_vec())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(scanned, entries[10..=20].to_vec());
    }

    #[test]
    fn test_scan_is_restartable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        let entries = numbered_entries(50);
        write_table(&path, &entries);

        let reader = TableReader::open(&path).unwrap();
        for _ in 0..2 {
            let count = reader.iter().unwrap().count();
            assert_eq!(count, 50);
        }
    }

    #[test]
    fn test_full_iteration_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        let entries = numbered_entries(200);
        write_table(&path, &entries);

        let reader = TableReader::open(&path).unwrap();
        let scanned: Vec<_> = reader
            .iter()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(scanned, entries);
    }

    #[test]
    fn test_out_of_order_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        let mut writer = TableWriter::create(&path, 10, 0.01, 256).unwrap();

        writer.add(b"b", &Entry::put(1, b"v".to_vec())).unwrap();
        assert!(matches!(
            writer.add(b"a", &Entry::put(2, b"v".to_vec())),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            writer.add(b"b", &Entry::put(3, b"v".to_vec())),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_empty_run_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        let writer = TableWriter::create(&path, 0, 0.01, 256).unwrap();
        assert!(matches!(writer.finish(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_bad_magic_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        write_table(&path, &numbered_entries(10));

        let mut file = File::options().write(true).open(&path).unwrap();
        file.seek(SeekFrom::End(-4)).unwrap();
        file.write_all(&[0, 0, 0, 0]).unwrap();
        file.sync_all().unwrap();

        assert!(matches!(
            TableReader::open(&path),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_unknown_version_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        write_table(&path, &numbered_entries(10));

        let mut file = File::options().write(true).open(&path).unwrap();
        file.seek(SeekFrom::End(-8)).unwrap();
        file.write_all(&99u32.to_be_bytes()).unwrap();
        file.sync_all().unwrap();

        assert!(matches!(
            TableReader::open(&path),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_truncated_file_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("L0-00000000.sst");
        std::fs::write(&path, b"short").unwrap();

        assert!(matches!(
            TableReader::open(&path),
            Err(Error::Corruption(_))
        ));
    }
}
