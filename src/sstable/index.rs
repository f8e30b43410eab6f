//! Sparse index over the data blocks of a sorted run.
//!
//! One anchor per block: the block's first key, its byte offset and its
//! size. The anchor list is tiny compared to the data (one entry per ~4KB
//! block), lives in memory once a run is open, and turns a point lookup
//! into a binary search plus a single-block scan.

use std::ops::{Bound, RangeBounds};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::types::Key;

/// The anchor of a single data block.
#[derive(Debug)]
pub struct Anchor<'a> {
    pub index: usize,
    pub key: &'a [u8],
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SparseIndex {
    /// `(first key, block offset, block size)`, sorted by key.
    entries: Vec<(Key, u64, u64)>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, key: Key, offset: u64, size: u64) {
        self.entries.push((key, offset, size));
    }

    /// Locate the block that may contain `key`: the greatest anchor whose
    /// key is <= the target. None means the key precedes the whole run.
    pub fn find(&self, key: &[u8]) -> Option<Anchor> {
        let idx = match self
            .entries
            .binary_search_by(|entry| entry.0.as_slice().cmp(key))
        {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (anchor_key, offset, size) = &self.entries[idx];
        Some(Anchor {
            index: idx,
            key: anchor_key,
            offset: *offset,
            size: *size,
        })
    }

    /// Block handles `(offset, size)` covering the given key range.
    pub fn range<R: RangeBounds<Vec<u8>>>(&self, range: R) -> Vec<(u64, u64)> {
        let start = match range.start_bound() {
            Bound::Included(key) | Bound::Excluded(key) => {
                // The block preceding the insertion point may still contain
                // keys at or past the bound.
                match self
                    .entries
                    .binary_search_by(|entry| entry.0.as_slice().cmp(key))
                {
                    Ok(idx) => idx,
                    Err(idx) => idx.saturating_sub(1),
                }
            }
            Bound::Unbounded => 0,
        };

        let end = match range.end_bound() {
            Bound::Included(key) => {
                match self
                    .entries
                    .binary_search_by(|entry| entry.0.as_slice().cmp(key))
                {
                    Ok(idx) => idx + 1,
                    Err(idx) => idx,
                }
            }
            Bound::Excluded(key) => {
                match self
                    .entries
                    .binary_search_by(|entry| entry.0.as_slice().cmp(key))
                {
                    Ok(idx) | Err(idx) => idx,
                }
            }
            Bound::Unbounded => self.entries.len(),
        };

        if start >= end {
            return Vec::new();
        }
        self.entries[start..end]
            .iter()
            .map(|(_, offset, size)| (*offset, *size))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (key, offset, size) in &self.entries {
            buf.write_u32::<BigEndian>(key.len() as u32).unwrap();
            buf.extend_from_slice(key);
            buf.write_u64::<BigEndian>(*offset).unwrap();
            buf.write_u64::<BigEndian>(*size).unwrap();
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        use std::io::Read;

        let mut cursor = std::io::Cursor::new(buf);
        let mut entries = Vec::new();

        while (cursor.position() as usize) < buf.len() {
            let key_len = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Corruption(format!("sparse index key length: {e}")))?
                as usize;

            let mut key = vec![0u8; key_len];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::Corruption(format!("sparse index key: {e}")))?;

            let offset = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Corruption(format!("sparse index offset: {e}")))?;
            let size = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Corruption(format!("sparse index size: {e}")))?;

            entries.push((key, offset, size));
        }

        Ok(Self { entries })
    }
}
