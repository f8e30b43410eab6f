//! The store: LSM orchestration across memtables and sorted runs.
//!
//! # Write path
//!
//! `put`/`delete` serialize under the write mutex, take the next sequence
//! number, append to the WAL (durable before acknowledging), then insert
//! into the active memtable. A full memtable is frozen and replaced behind
//! the same mutex; a full frozen queue makes the writer flush inline, so
//! writes block under pressure instead of dropping.
//!
//! # Read path
//!
//! `get` probes the active memtable, the frozen memtables newest-first,
//! then every level (L0 newest-first, deeper levels by key range), with
//! each run's bloom filter consulted before any disk read. The first hit
//! wins; a tombstone hit reads as not-found.
//!
//! `scan` snapshots all memtables and the current level set at call start.
//! The pinned run references keep retired files readable until the cursor
//! drops, so a scan observes a consistent snapshot regardless of
//! concurrent flushes and compactions.

use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::compaction;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::flush;
use crate::iterator::{EntryIter, ScanIterator};
use crate::memtable::ActiveMemtable;
use crate::recovery;
use crate::scheduler::Scheduler;
use crate::state::{LsmState, StateMetrics};
use crate::types::{Entry, Value};

pub struct Store {
    pub(crate) config: StoreConfig,
    pub(crate) state: Arc<LsmState>,
}

impl Store {
    /// Open a store with default configuration, recovering any existing
    /// state in the directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(StoreConfig::new(dir))
    }

    pub fn open_with_config(config: StoreConfig) -> Result<Self> {
        let state = Arc::new(recovery::recover(&config)?);
        Ok(Self { config, state })
    }

    /// Insert or overwrite a key. Durable once this returns (with the
    /// default per-append WAL sync).
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(key, Some(value))
    }

    /// Delete a key by writing a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.state.is_halted() {
            return Err(Error::Halted);
        }

        let _write = self.state.write_lock.lock()?;
        let seq = self.state.next_seq();
        let entry = match value {
            Some(value) => Entry::put(seq, value.to_vec()),
            None => Entry::tombstone(seq),
        };

        let needs_freeze = {
            let active = self.state.active_memtable.read()?;
            active.put(key.to_vec(), entry)?;
            active.size() >= self.config.memtable_size
        };
        if needs_freeze {
            self.freeze_active()?;
        }

        // Back-pressure: block the writer on an inline flush when the
        // frozen queue outruns the flusher.
        loop {
            let queued = self.state.frozen_memtables.read()?.len();
            if queued <= self.config.max_frozen_memtables {
                break;
            }
            if !flush::flush_oldest(&self.state, &self.config)? {
                // A background flush holds the pending flag; wait it out.
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        Ok(())
    }

    /// Look up a key. `None` means not found or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        Ok(self.lookup(key)?.and_then(|entry| entry.value))
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Entry>> {
        if let Some(entry) = self.state.active_memtable.read()?.get(key) {
            return Ok(Some(entry));
        }

        {
            let frozen = self.state.frozen_memtables.read()?;
            for memtable in frozen.iter().rev() {
                if let Some(entry) = memtable.get(key) {
                    return Ok(Some(entry));
                }
            }
        }

        let levels = self.state.level_snapshot();
        for level in levels.iter() {
            if let Some(entry) = level.get(key)? {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    /// Ordered scan over a key range, each live key once with its newest
    /// value. The iterator owns a snapshot: concurrent writes, flushes and
    /// compactions do not affect an open cursor.
    pub fn scan<R>(&self, range: R) -> Result<ScanIterator>
    where
        R: RangeBounds<Vec<u8>> + Clone + Send + 'static,
    {
        let mut sources: Vec<EntryIter> = Vec::new();

        sources.push(Box::new(
            self.state.active_memtable.read()?.scan(range.clone()),
        ));
        {
            let frozen = self.state.frozen_memtables.read()?;
            for memtable in frozen.iter().rev() {
                sources.push(Box::new(memtable.scan(range.clone())));
            }
        }

        let levels = self.state.level_snapshot();
        for level in levels.iter() {
            for run in &level.runs {
                sources.push(Box::new(run.scan(range.clone())?));
            }
        }

        Ok(ScanIterator::new(sources))
    }

    /// Fsync buffered WAL writes. A no-op under the default per-append
    /// sync; the durability point under group commit.
    pub fn sync(&self) -> Result<()> {
        self.state.active_memtable.read()?.sync()
    }

    /// Freeze the active memtable so the next flush persists it. Writes
    /// continue into a fresh memtable with its own WAL segment.
    pub fn freeze(&self) -> Result<()> {
        let _write = self.state.write_lock.lock()?;
        self.freeze_active()
    }

    /// Caller must hold the write lock.
    fn freeze_active(&self) -> Result<()> {
        if self.state.active_memtable.read()?.is_empty() {
            return Ok(());
        }

        let wal_id = self.state.next_wal_id();
        let wal_path = self.config.dir.join(recovery::wal_file_name(wal_id));
        let new_active = Arc::new(ActiveMemtable::new(
            &wal_path,
            wal_id,
            self.config.wal_sync_on_append,
        )?);

        let frozen = {
            let mut active = self.state.active_memtable.write()?;
            let frozen = active.freeze()?;
            *active = new_active;
            frozen
        };
        self.state
            .frozen_memtables
            .write()?
            .push_back(Arc::new(frozen));

        Ok(())
    }

    /// Flush the oldest frozen memtable into a level-0 run.
    pub fn flush(&self) -> Result<bool> {
        flush::flush_oldest(&self.state, &self.config)
    }

    /// Run one compaction job if any level is out of shape.
    pub fn compact(&self) -> Result<bool> {
        compaction::compact(&self.state, &self.config)
    }

    pub fn needs_flush(&self) -> bool {
        self.state.needs_flush()
    }

    pub fn needs_compaction(&self) -> bool {
        compaction::needs_compaction(&self.state.level_snapshot(), &self.config.compaction)
    }

    /// Spawn periodic background flush and compaction tasks.
    pub fn start_maintenance(self: &Arc<Self>) -> Scheduler {
        crate::scheduler::spawn_maintenance(self.clone())
    }

    pub fn metrics(&self) -> StateMetrics {
        self.state.metrics()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}
