//! Write-ahead log segments, one per memtable.
//!
//! Every mutation is appended here before it touches the memtable, so a
//! crash can only lose writes that were never acknowledged. A segment is
//! deleted once its memtable has been flushed into a level-0 sorted run.
//!
//! # Record format
//!
//! ```text
//! +-----------+---------------------------------------------+-----------+
//! |len: u32   | payload                                     |crc32: u32 |
//! +-----------+---------------------------------------------+-----------+
//!             | seq: u64 | flags: u8 | key_len: u32 |
//!             | value_len: u32 | key | value        |
//! ```
//!
//! - All integers are big-endian.
//! - CRC-32/ISCSI covers the payload.
//! - Flag bit 0 marks a tombstone; tombstones carry no value bytes.
//!
//! By default every append is fsynced before returning, so an acknowledged
//! write survives a crash. With `sync_on_append` disabled, appends buffer
//! and durability is deferred to the next explicit [`Wal::sync`] (group
//! commit).

pub mod header;

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::types::{Entry, Key};
use header::{Header, HEADER_SIZE};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const FLAG_TOMBSTONE: u8 = 0x01;

pub struct Wal {
    file: File,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
    sync_on_append: bool,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("sync_on_append", &self.sync_on_append)
            .finish()
    }
}

impl Wal {
    /// Open a segment, creating it (with a fresh header) when absent.
    /// An existing segment has its header validated and is appended to.
    pub fn open(path: impl Into<PathBuf>, sync_on_append: bool) -> Result<Self> {
        let path = path.into();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            let mut f = file.try_clone()?;
            f.write_all(&Header::new().encode())?;
            f.sync_all()?;
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            let mut reader = file.try_clone()?;
            reader.read_exact(&mut buf)?;
            Header::decode(&buf)?;
        }

        let mut writer = BufWriter::new(file.try_clone()?);
        writer.seek(SeekFrom::End(0))?;

        Ok(Self {
            file,
            writer: Mutex::new(writer),
            path,
            sync_on_append,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    /// Append one entry. With `sync_on_append` the record is durable on disk
    /// before this returns; the caller must not update the memtable if this
    /// fails.
    pub fn append(&self, key: &[u8], entry: &Entry) -> Result<()> {
        let value = entry.value.as_deref();
        let mut payload =
            Vec::with_capacity(17 + key.len() + value.map_or(0, |v| v.len()));
        payload.write_u64::<BigEndian>(entry.seq)?;
        payload.write_u8(if entry.is_tombstone() { FLAG_TOMBSTONE } else { 0 })?;
        payload.write_u32::<BigEndian>(key.len() as u32)?;
        payload.write_u32::<BigEndian>(value.map_or(0, |v| v.len()) as u32)?;
        payload.extend_from_slice(key);
        if let Some(v) = value {
            payload.extend_from_slice(v);
        }

        let checksum = CRC32.checksum(&payload);

        let mut writer = self.writer.lock()?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        writer.write_u32::<BigEndian>(checksum)?;

        if self.sync_on_append {
            writer.flush()?;
            self.file.sync_data()?;
        }

        Ok(())
    }

    /// Flush buffered records and fsync the segment.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock()?.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replay all records in write order.
    pub fn replay(&self) -> Result<ReplayIterator> {
        ReplayIterator::new(&self.path)
    }

    /// Delete the segment file, consuming the handle.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        Ok(std::fs::remove_file(path)?)
    }
}

pub struct ReplayIterator {
    reader: BufReader<File>,
}

impl ReplayIterator {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(Self { reader })
    }

    fn read_record<R: Read>(reader: &mut R) -> Result<Option<(Key, Entry)>> {
        let record_len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; record_len];
        reader
            .read_exact(&mut payload)
            .map_err(|e| Error::Corruption(format!("truncated WAL payload: {e}")))?;

        let stored_crc = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Corruption(format!("truncated WAL checksum: {e}")))?;
        if CRC32.checksum(&payload) != stored_crc {
            return Err(Error::Corruption("WAL checksum mismatch".to_string()));
        }

        let mut cursor = Cursor::new(payload.as_slice());
        let seq = cursor.read_u64::<BigEndian>()?;
        let flags = cursor.read_u8()?;
        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;

        let mut key = vec![0u8; key_len];
        cursor
            .read_exact(&mut key)
            .map_err(|e| Error::Corruption(format!("truncated WAL key: {e}")))?;

        let entry = if flags & FLAG_TOMBSTONE != 0 {
            Entry::tombstone(seq)
        } else {
            let mut value = vec![0u8; value_len];
            cursor
                .read_exact(&mut value)
                .map_err(|e| Error::Corruption(format!("truncated WAL value: {e}")))?;
            Entry::put(seq, value)
        };

        Ok(Some((key, entry)))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<(Key, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        match Self::read_record(&mut self.reader) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
