//! Shared mutable state of the engine, with fine-grained locking.
//!
//! Lock roles:
//! - `write_lock` serializes the write path so sequence numbers are
//!   assigned in WAL order.
//! - `publish_lock` serializes flush/compaction publication (manifest
//!   commit + level swap); it is never held while serving reads.
//! - `levels` holds a copy-on-write snapshot: readers clone the `Arc` at
//!   query start and keep the runs they see pinned for the whole call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::level::Level;
use crate::manifest::{LevelMeta, Manifest, ManifestState};
use crate::memtable::{ActiveMemtable, FrozenMemtable};

pub struct LsmState {
    // Write path
    pub active_memtable: RwLock<Arc<ActiveMemtable>>,
    pub frozen_memtables: RwLock<VecDeque<Arc<FrozenMemtable>>>,
    pub write_lock: Mutex<()>,

    // Read path: copy-on-write level snapshot
    pub levels: RwLock<Arc<Vec<Level>>>,

    // Metadata
    pub manifest: Manifest,
    pub publish_lock: Mutex<()>,
    next_seq: AtomicU64,
    next_run_id: AtomicU64,
    next_wal_id: AtomicU64,
    last_published_seq: AtomicU64,

    // Coordination flags
    flush_pending: AtomicBool,
    compaction_running: AtomicBool,
    halted: AtomicBool,
}

impl LsmState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        active_memtable: ActiveMemtable,
        frozen_memtables: VecDeque<Arc<FrozenMemtable>>,
        levels: Vec<Level>,
        manifest: Manifest,
        next_seq: u64,
        next_run_id: u64,
        next_wal_id: u64,
        last_published_seq: u64,
    ) -> Self {
        Self {
            active_memtable: RwLock::new(Arc::new(active_memtable)),
            frozen_memtables: RwLock::new(frozen_memtables),
            write_lock: Mutex::new(()),
            levels: RwLock::new(Arc::new(levels)),
            manifest,
            publish_lock: Mutex::new(()),
            next_seq: AtomicU64::new(next_seq),
            next_run_id: AtomicU64::new(next_run_id),
            next_wal_id: AtomicU64::new(next_wal_id),
            last_published_seq: AtomicU64::new(last_published_seq),
            flush_pending: AtomicBool::new(false),
            compaction_running: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_run_id(&self) -> u64 {
        self.next_run_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek_next_run_id(&self) -> u64 {
        self.next_run_id.load(Ordering::SeqCst)
    }

    pub fn next_wal_id(&self) -> u64 {
        self.next_wal_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The level snapshot current at this instant. Runs referenced by the
    /// returned `Arc` cannot have their files deleted while it is held.
    pub fn level_snapshot(&self) -> Arc<Vec<Level>> {
        self.levels.read().unwrap().clone()
    }

    pub fn swap_levels(&self, levels: Vec<Level>) {
        *self.levels.write().unwrap() = Arc::new(levels);
    }

    pub fn needs_flush(&self) -> bool {
        !self.frozen_memtables.read().unwrap().is_empty()
            && !self.flush_pending.load(Ordering::SeqCst)
    }

    pub fn try_mark_flush_pending(&self) -> Option<FlushGuard> {
        if !self.flush_pending.swap(true, Ordering::SeqCst) {
            Some(FlushGuard { state: self })
        } else {
            None
        }
    }

    pub fn try_start_compaction(&self) -> Option<CompactionGuard> {
        if !self.compaction_running.swap(true, Ordering::SeqCst) {
            Some(CompactionGuard { state: self })
        } else {
            None
        }
    }

    pub fn last_published_seq(&self) -> u64 {
        self.last_published_seq.load(Ordering::SeqCst)
    }

    pub fn publish_seq(&self, seq: u64) {
        self.last_published_seq.fetch_max(seq, Ordering::SeqCst);
    }

    /// Permanently refuse further writes; set after the background
    /// compactor exhausted its retries.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// The manifest image of the current in-memory levels.
    pub fn manifest_state(&self, levels: &[Level]) -> ManifestState {
        ManifestState {
            last_seq: self.last_published_seq(),
            next_run_id: self.peek_next_run_id(),
            levels: levels
                .iter()
                .map(|level| LevelMeta {
                    level: level.level_num,
                    runs: level.runs.iter().map(|run| run.meta()).collect(),
                })
                .collect(),
        }
    }

    /// Verify that runs in L1 and deeper are sorted and pairwise disjoint.
    pub fn validate_level_disjointness(levels: &[Level]) -> Result<()> {
        for level in levels.iter().skip(1) {
            let mut previous_max: Option<&[u8]> = None;
            for run in &level.runs {
                if run.min_key > run.max_key {
                    return Err(Error::Corruption(format!(
                        "run {} at level {} has min key above max key",
                        run.id, level.level_num
                    )));
                }
                if let Some(prev) = previous_max {
                    if run.min_key.as_slice() <= prev {
                        return Err(Error::Corruption(format!(
                            "run {} at level {} overlaps its predecessor",
                            run.id, level.level_num
                        )));
                    }
                }
                previous_max = Some(&run.max_key);
            }
        }
        Ok(())
    }

    pub fn metrics(&self) -> StateMetrics {
        let levels = self.level_snapshot();
        StateMetrics {
            active_memtable_size: self.active_memtable.read().unwrap().size(),
            frozen_memtable_count: self.frozen_memtables.read().unwrap().len(),
            level_count: levels.len(),
            total_run_count: levels.iter().map(|l| l.run_count()).sum(),
            level_sizes: levels.iter().map(|l| l.size()).collect(),
            next_seq: self.next_seq.load(Ordering::SeqCst),
            halted: self.is_halted(),
        }
    }
}

/// Snapshot of engine state for observability and tests.
#[derive(Debug, Clone)]
pub struct StateMetrics {
    pub active_memtable_size: usize,
    pub frozen_memtable_count: usize,
    pub level_count: usize,
    pub total_run_count: usize,
    pub level_sizes: Vec<u64>,
    pub next_seq: u64,
    pub halted: bool,
}

/// RAII guard marking a flush in progress.
pub struct FlushGuard<'a> {
    state: &'a LsmState,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.state.flush_pending.store(false, Ordering::SeqCst);
    }
}

/// RAII guard marking a compaction in progress.
pub struct CompactionGuard<'a> {
    state: &'a LsmState,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.state.compaction_running.store(false, Ordering::SeqCst);
    }
}
