//! The MANIFEST: the committed set of sorted runs.
//!
//! Where the WAL journals user data, the manifest records the database
//! structure: which runs exist, at which levels, with which key ranges,
//! plus the id and sequence counters recovery needs. It is a single
//! snapshot file rewritten on every flush and compaction commit, atomically
//! via write-temp + rename, so readers only ever observe a complete state.
//!
//! # File format
//!
//! ```text
//! +-----------+------------+----------+-------------+---------+--------+-----------+
//! |magic: u32 |version: u32|last_seq  |next_run_id  |levels   |levels  |crc32: u32 |
//! |           |            |u64       |u64          |count:u32|...     |           |
//! +-----------+------------+----------+-------------+---------+--------+-----------+
//! ```
//!
//! Big-endian throughout; the CRC-32/ISCSI checksum covers everything
//! before it. A checksum mismatch, unknown version or reference to a
//! missing run file is corruption and refuses to open.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::types::Key;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// "SILM" in ASCII.
const MANIFEST_MAGIC: u32 = 0x5349_4C4D;
const MANIFEST_FORMAT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TEMP_FILE: &str = "MANIFEST.tmp";

/// Metadata of one committed sorted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMeta {
    pub id: u64,
    pub level: u32,
    pub size: u64,
    pub entry_count: u64,
    pub min_key: Key,
    pub max_key: Key,
}

impl RunMeta {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.id).unwrap();
        buf.write_u32::<BigEndian>(self.level).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_u64::<BigEndian>(self.entry_count).unwrap();
        buf.write_u32::<BigEndian>(self.min_key.len() as u32).unwrap();
        buf.extend_from_slice(&self.min_key);
        buf.write_u32::<BigEndian>(self.max_key.len() as u32).unwrap();
        buf.extend_from_slice(&self.max_key);
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let id = cursor.read_u64::<BigEndian>()?;
        let level = cursor.read_u32::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        let entry_count = cursor.read_u64::<BigEndian>()?;

        let min_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut min_key = vec![0u8; min_key_len];
        cursor
            .read_exact(&mut min_key)
            .map_err(|e| Error::Corruption(format!("manifest min key: {e}")))?;

        let max_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut max_key = vec![0u8; max_key_len];
        cursor
            .read_exact(&mut max_key)
            .map_err(|e| Error::Corruption(format!("manifest max key: {e}")))?;

        Ok(Self {
            id,
            level,
            size,
            entry_count,
            min_key,
            max_key,
        })
    }
}

/// The runs of one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelMeta {
    pub level: u32,
    pub runs: Vec<RunMeta>,
}

impl LevelMeta {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.level).unwrap();
        buf.write_u32::<BigEndian>(self.runs.len() as u32).unwrap();
        for run in &self.runs {
            run.encode_into(buf);
        }
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let level = cursor.read_u32::<BigEndian>()?;
        let run_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut runs = Vec::with_capacity(run_count);
        for _ in 0..run_count {
            runs.push(RunMeta::decode_from(cursor)?);
        }
        Ok(Self { level, runs })
    }
}

/// The full committed state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestState {
    /// Highest sequence number contained in any committed run.
    pub last_seq: u64,
    pub next_run_id: u64,
    pub levels: Vec<LevelMeta>,
}

impl ManifestState {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(MANIFEST_MAGIC).unwrap();
        buf.write_u32::<BigEndian>(MANIFEST_FORMAT_VERSION).unwrap();
        buf.write_u64::<BigEndian>(self.last_seq).unwrap();
        buf.write_u64::<BigEndian>(self.next_run_id).unwrap();
        buf.write_u32::<BigEndian>(self.levels.len() as u32).unwrap();
        for level in &self.levels {
            level.encode_into(&mut buf);
        }

        let checksum = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(checksum).unwrap();
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Corruption("manifest shorter than checksum".to_string()));
        }

        let (payload, crc_bytes) = buf.split_at(buf.len() - 4);
        let stored_crc = (&crc_bytes[..]).read_u32::<BigEndian>()?;
        if CRC32.checksum(payload) != stored_crc {
            return Err(Error::Corruption("manifest checksum mismatch".to_string()));
        }

        let mut cursor = Cursor::new(payload);
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != MANIFEST_MAGIC {
            return Err(Error::Corruption(format!(
                "bad manifest magic: {:#010x}",
                magic
            )));
        }
        let version = cursor.read_u32::<BigEndian>()?;
        if version != MANIFEST_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported manifest format version: {}",
                version
            )));
        }

        let last_seq = cursor.read_u64::<BigEndian>()?;
        let next_run_id = cursor.read_u64::<BigEndian>()?;
        let level_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut levels = Vec::with_capacity(level_count);
        for _ in 0..level_count {
            levels.push(LevelMeta::decode_from(&mut cursor)?);
        }

        Ok(Self {
            last_seq,
            next_run_id,
            levels,
        })
    }

    /// All run metadata across levels.
    pub fn runs(&self) -> impl Iterator<Item = &RunMeta> {
        self.levels.iter().flat_map(|level| level.runs.iter())
    }
}

/// Handle to the on-disk manifest of one data directory.
pub struct Manifest {
    dir: PathBuf,
}

impl Manifest {
    /// Open the manifest, returning the committed state. A missing file is
    /// an empty database, not an error.
    pub fn open(dir: &Path) -> Result<(Self, ManifestState)> {
        let manifest = Self {
            dir: dir.to_path_buf(),
        };
        let path = manifest.path();

        let state = if path.exists() {
            let mut buf = Vec::new();
            File::open(&path)?.read_to_end(&mut buf)?;
            ManifestState::decode(&buf)?
        } else {
            ManifestState::default()
        };

        Ok((manifest, state))
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Atomically replace the committed state: write a temp file, fsync it,
    /// rename over the manifest, fsync the directory.
    pub fn commit(&self, state: &ManifestState) -> Result<()> {
        let temp_path = self.dir.join(MANIFEST_TEMP_FILE);

        let mut temp = File::create(&temp_path)?;
        temp.write_all(&state.encode())?;
        temp.sync_all()?;
        drop(temp);

        std::fs::rename(&temp_path, self.path())?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        tracing::debug!(
            last_seq = state.last_seq,
            next_run_id = state.next_run_id,
            levels = state.levels.len(),
            "committed manifest"
        );
        Ok(())
    }
}
