//! Data blocks inside a sorted-run file.
//!
//! A block is a prefix-compressed sequence of entries followed by a restart
//! array. Every 16th entry is a restart point storing its full key, so a
//! seek can binary-search the restarts and then scan at most one interval.
//!
//! # Entry format
//!
//! ```text
//! +-----------+-------------+--------+--------+-------------+------------+-------+
//! |shared: u16|unshared: u16|seq: u64|flags:u8|value_len:u32| key suffix | value |
//! +-----------+-------------+--------+--------+-------------+------------+-------+
//! ```
//!
//! Flag bit 0 marks a tombstone (no value bytes follow). The trailer is the
//! restart offsets (u32 each) and the restart count (u32), all big-endian.

use std::cmp::Ordering;
use std::io;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::types::{Entry, Key};

const RESTART_INTERVAL: usize = 16;
const FLAG_TOMBSTONE: u8 = 0x01;

pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Append an entry. Keys must arrive in strictly increasing order; the
    /// caller (table writer, fed by merge or memtable) guarantees this.
    pub fn add_entry(&mut self, key: &[u8], entry: &Entry) {
        let shared = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared = key.len() - shared;
        let value = entry.value.as_deref().unwrap_or_default();

        self.buffer.write_u16::<BigEndian>(shared as u16).unwrap();
        self.buffer.write_u16::<BigEndian>(unshared as u16).unwrap();
        self.buffer.write_u64::<BigEndian>(entry.seq).unwrap();
        self.buffer
            .write_u8(if entry.is_tombstone() { FLAG_TOMBSTONE } else { 0 })
            .unwrap();
        self.buffer.write_u32::<BigEndian>(value.len() as u32).unwrap();
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}

#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block shorter than trailer".to_string()));
        }

        let count_offset = data.len() - 4;
        let num_restarts = (&data[count_offset..]).read_u32::<BigEndian>()? as usize;

        let restart_array_size = num_restarts * 4;
        if count_offset < restart_array_size {
            return Err(Error::Corruption(
                "block too short for restart array".to_string(),
            ));
        }

        let restart_offset = count_offset - restart_array_size;
        let mut cursor = &data[restart_offset..count_offset];
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for _ in 0..num_restarts {
            restart_positions.push(cursor.read_u32::<BigEndian>()?);
        }

        Ok(Self {
            data: data[..restart_offset].to_vec(),
            restart_positions,
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        let mut iter = Arc::new(self.clone()).iter();
        iter.seek(key)?;
        match iter.next() {
            Some(Ok((found, entry))) if found == key => Ok(Some(entry)),
            Some(Err(e)) => Err(e),
            _ => Ok(None),
        }
    }

    pub fn iter(self: Arc<Self>) -> BlockIterator {
        BlockIterator::new(self)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    current_offset: usize,
    last_key: Vec<u8>,
    pending: Option<(Key, Entry)>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            current_offset: 0,
            last_key: Vec::new(),
            pending: None,
        }
    }

    /// Reads the full key at a restart point without touching cursor state.
    fn restart_key(&self, offset: usize) -> Result<Vec<u8>> {
        let data = &self.block.data;
        let mut cursor = &data[offset..];

        let shared = cursor.read_u16::<BigEndian>()? as usize;
        let unshared = cursor.read_u16::<BigEndian>()? as usize;
        if shared != 0 {
            return Err(Error::Corruption(
                "restart point key has a shared prefix".to_string(),
            ));
        }

        let key_start = offset + 17;
        if key_start + unshared > data.len() {
            return Err(Error::Corruption("restart key out of bounds".to_string()));
        }
        Ok(data[key_start..key_start + unshared].to_vec())
    }

    /// Position the iterator so the next `next()` returns the first entry
    /// with key >= `target`, or nothing if no such entry exists.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.pending = None;

        // Binary search for the last restart whose key is < target.
        let mut left = 0;
        let mut right = self.block.restart_positions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let key = self.restart_key(self.block.restart_positions[mid] as usize)?;
            match key.as_slice().cmp(target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart = left.saturating_sub(1);

        self.current_offset = self
            .block
            .restart_positions
            .get(restart)
            .map_or(0, |&p| p as usize);
        self.last_key.clear();

        // Scan forward, buffering the first entry at or past the target.
        while let Some(result) = self.next() {
            let (key, entry) = result?;
            if key.as_slice() >= target {
                self.pending = Some((key, entry));
                break;
            }
        }
        Ok(())
    }

    fn decode_next(&mut self) -> Result<Option<(Key, Entry)>> {
        let data = &self.block.data;
        if self.current_offset >= data.len() {
            return Ok(None);
        }

        let mut pos = self.current_offset;
        if pos + 17 > data.len() {
            return Err(Error::Corruption("block entry header truncated".to_string()));
        }

        let mut cursor = &data[pos..];
        let shared = cursor.read_u16::<BigEndian>()? as usize;
        let unshared = cursor.read_u16::<BigEndian>()? as usize;
        let seq = cursor.read_u64::<BigEndian>()?;
        let flags = cursor.read_u8()?;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;
        pos += 17;

        if shared > self.last_key.len() || pos + unshared + value_len > data.len() {
            return Err(Error::Corruption("block entry out of bounds".to_string()));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&data[pos..pos + unshared]);
        pos += unshared;

        let entry = if flags & FLAG_TOMBSTONE != 0 {
            Entry::tombstone(seq)
        } else {
            Entry::put(seq, data[pos..pos + value_len].to_vec())
        };
        pos += value_len;

        self.current_offset = pos;
        self.last_key.clone_from(&key);

        Ok(Some((key, entry)))
    }
}

impl Iterator for BlockIterator {
    type Item = Result<(Key, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(pending) = self.pending.take() {
            return Some(Ok(pending));
        }
        self.decode_next().transpose()
    }
}

/// Chains the data blocks of one sorted run into a single entry stream,
/// loading blocks lazily from the file as the scan advances.
pub struct MultiBlockIterator {
    reader: std::fs::File,
    blocks: Vec<(u64, u64)>,
    current_iter: Option<BlockIterator>,
    next_block: usize,
}

impl MultiBlockIterator {
    pub fn new(reader: std::fs::File, blocks: Vec<(u64, u64)>) -> Self {
        Self {
            reader,
            blocks,
            current_iter: None,
            next_block: 0,
        }
    }

    /// Seek within the first block so the scan starts at `target`. Entries
    /// before the range start in later blocks cannot exist because block
    /// handles were already selected by the sparse index.
    pub fn seek_first_block(&mut self, target: &[u8]) -> Result<()> {
        if !self.blocks.is_empty() && self.next_block == 0 {
            self.load_next_block()?;
            if let Some(iter) = &mut self.current_iter {
                iter.seek(target)?;
            }
        }
        Ok(())
    }

    fn load_next_block(&mut self) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};

        if self.next_block >= self.blocks.len() {
            self.current_iter = None;
            return Ok(());
        }

        let (offset, size) = self.blocks[self.next_block];
        let mut data = vec![0u8; size as usize];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader
            .read_exact(&mut data)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    Error::Corruption("block truncated on disk".to_string())
                }
                _ => Error::Io(e),
            })?;

        self.current_iter = Some(Arc::new(Block::new(data)?).iter());
        self.next_block += 1;
        Ok(())
    }
}

impl Iterator for MultiBlockIterator {
    type Item = Result<(Key, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current_iter {
                if let Some(item) = iter.next() {
                    return Some(item);
                }
            }

            if let Err(e) = self.load_next_block() {
                return Some(Err(e));
            }
            self.current_iter.as_ref()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<(Vec<u8>, Entry)> {
        vec![
            (b"apple".to_vec(), Entry::put(1, b"fruit".to_vec())),
            (b"application".to_vec(), Entry::put(2, b"software".to_vec())),
            (b"banana".to_vec(), Entry::tombstone(3)),
            (b"band".to_vec(), Entry::put(4, b"music".to_vec())),
            (b"bandana".to_vec(), Entry::put(5, b"clothing".to_vec())),
        ]
    }

    fn build_block(entries: &[(Vec<u8>, Entry)]) -> Arc<Block> {
        let mut builder = Builder::new();
        for (key, entry) in entries {
            builder.add_entry(key, entry);
        }
        Arc::new(Block::new(builder.finish()).expect("failed to parse block"))
    }

    #[test]
    fn test_build_and_get() {
        let entries = sample_entries();
        let block = build_block(&entries);

        for (key, entry) in &entries {
            let found = block.get(key).unwrap().expect("key missing");
            assert_eq!(&found, entry);
        }
        assert!(block.get(b"unknown").unwrap().is_none());
    }

    #[test]
    fn test_tombstones_survive_the_block() {
        let block = build_block(&sample_entries());
        let found = block.get(b"banana").unwrap().expect("tombstone missing");
        assert!(found.is_tombstone());
        assert_eq!(found.seq, 3);
    }

    #[test]
    fn test_iteration_order() {
        let entries = sample_entries();
        let block = build_block(&entries);

        let decoded: Vec<_> = block.iter().map(|r| r.unwrap()).collect();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_seek_exact_and_between() {
        let block = build_block(&sample_entries());

        let mut iter = block.clone().iter();
        iter.seek(b"band").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, b"band".to_vec());

        let mut iter = block.clone().iter();
        iter.seek(b"bana").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, b"banana".to_vec());

        let mut iter = block.iter();
        iter.seek(b"zzz").unwrap();
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_seek_across_restart_intervals() {
        let entries: Vec<_> = (0..100)
            .map(|i| {
                (
                    format!("key_{:03}", i).into_bytes(),
                    Entry::put(i as u64, format!("value_{:03}", i).into_bytes()),
                )
            })
            .collect();
        let block = build_block(&entries);

        for probe in [0, 15, 16, 17, 50, 99] {
            let mut iter = block.clone().iter();
            iter.seek(format!("key_{:03}", probe).as_bytes()).unwrap();
            let (key, _) = iter.next().unwrap().unwrap();
            assert_eq!(key, format!("key_{:03}", probe).into_bytes());
        }
    }

    #[test]
    fn test_corrupt_trailer_rejected() {
        assert!(matches!(
            Block::new(vec![0, 1]),
            Err(Error::Corruption(_))
        ));
        // Restart count claims more restarts than the block holds.
        assert!(matches!(
            Block::new(vec![0xFF, 0xFF, 0xFF, 0xFF]),
            Err(Error::Corruption(_))
        ));
    }
}
