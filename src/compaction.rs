//! Leveled compaction.
//!
//! Triggers:
//! - L0 holds `level0_run_threshold` runs (runs there overlap, every extra
//!   run is another stop on the read path), or
//! - a deeper level exceeds its byte budget `base * growth^(L-1)`.
//!
//! A job takes either all L0 runs or the oldest run of the offending
//! level, plus every overlapping run one level down, and k-way merges them
//! in `(key, seq desc)` order. Only the highest-sequence entry per key
//! survives; a surviving tombstone is dropped entirely when the job writes
//! to the bottom-most populated level, reclaiming the space. Outputs roll
//! over at `max_output_bytes` and land key-disjoint in the target level.
//!
//! Publication: outputs are fully written and synced, the manifest commits
//! the new run set, the in-memory snapshot swaps, and only then are the
//! retired inputs marked obsolete. In-flight readers keep the retired
//! files pinned until their cursors drop.

use std::sync::Arc;

use crate::config::{CompactionConfig, StoreConfig};
use crate::error::Result;
use crate::iterator::{EntryIter, MergeIterator};
use crate::level::{Level, SortedRun};
use crate::manifest::RunMeta;
use crate::sstable::TableWriter;
use crate::state::LsmState;
use crate::types::Key;

pub struct CompactionJob {
    pub source_level: u32,
    /// Runs taken from the source level.
    pub inputs: Vec<Arc<SortedRun>>,
    /// Overlapping runs taken from the target level.
    pub targets: Vec<Arc<SortedRun>>,
}

impl CompactionJob {
    fn all_runs(&self) -> impl Iterator<Item = &Arc<SortedRun>> {
        self.inputs.iter().chain(self.targets.iter())
    }
}

/// Combined key span of a set of runs.
fn key_span(runs: &[Arc<SortedRun>]) -> Option<(Key, Key)> {
    let min = runs.iter().map(|run| run.min_key.clone()).min()?;
    let max = runs.iter().map(|run| run.max_key.clone()).max()?;
    Some((min, max))
}

/// Select the next compaction job, or None when every level is in shape.
pub fn pick_job(levels: &[Level], config: &CompactionConfig) -> Option<CompactionJob> {
    // L0 first: overlapping runs hurt every read.
    if let Some(l0) = levels.first() {
        if l0.run_count() >= config.level0_run_threshold {
            let inputs = l0.runs.clone();
            let (min, max) = key_span(&inputs)?;
            let targets = levels
                .get(1)
                .map(|l1| l1.overlapping(&min, &max))
                .unwrap_or_default();
            return Some(CompactionJob {
                source_level: 0,
                inputs,
                targets,
            });
        }
    }

    for level in levels.iter().skip(1) {
        if level.size() <= config.level_budget(level.level_num) {
            continue;
        }
        let victim = level.oldest_run()?;
        let targets = levels
            .get(level.level_num as usize + 1)
            .map(|next| next.overlapping(&victim.min_key, &victim.max_key))
            .unwrap_or_default();
        return Some(CompactionJob {
            source_level: level.level_num,
            inputs: vec![victim],
            targets,
        });
    }

    None
}

pub fn needs_compaction(levels: &[Level], config: &CompactionConfig) -> bool {
    pick_job(levels, config).is_some()
}

/// Run one compaction job if any is due. Returns false when nothing was
/// done (no job, or another compaction in flight).
///
/// On error the job is abandoned: inputs stay in place, partial outputs
/// are deleted, and the caller may retry.
pub fn compact(state: &LsmState, config: &StoreConfig) -> Result<bool> {
    let _guard = match state.try_start_compaction() {
        Some(guard) => guard,
        None => return Ok(false),
    };

    let snapshot = state.level_snapshot();
    let job = match pick_job(&snapshot, &config.compaction) {
        Some(job) => job,
        None => return Ok(false),
    };
    let target_level = job.source_level + 1;

    // Tombstones may be reclaimed only when nothing deeper can still hold
    // an older value for their keys.
    let bottom_most = snapshot
        .iter()
        .skip(target_level as usize + 1)
        .all(Level::is_empty);

    tracing::info!(
        source_level = job.source_level,
        target_level = target_level,
        inputs = job.inputs.len(),
        targets = job.targets.len(),
        bottom_most = bottom_most,
        "starting compaction"
    );

    let outputs = write_outputs(state, config, &job, target_level, bottom_most)?;
    let output_count = outputs.len();
    let output_entries: u64 = outputs.iter().map(|run| run.entry_count).sum();

    {
        let _publish = state.publish_lock.lock()?;
        let mut levels: Vec<Level> = state.level_snapshot().as_ref().clone();

        for run in &job.inputs {
            levels[job.source_level as usize].remove_run(run.id);
        }
        while levels.len() <= target_level as usize {
            let level_num = levels.len() as u32;
            levels.push(Level::new(level_num));
        }
        for run in &job.targets {
            levels[target_level as usize].remove_run(run.id);
        }
        for run in &outputs {
            levels[target_level as usize].add_run(run.clone());
        }

        LsmState::validate_level_disjointness(&levels)?;
        state.manifest.commit(&state.manifest_state(&levels))?;
        state.swap_levels(levels);
    }

    for run in job.all_runs() {
        run.mark_obsolete();
    }

    tracing::info!(
        source_level = job.source_level,
        target_level = target_level,
        retired = job.inputs.len() + job.targets.len(),
        outputs = output_count,
        entries = output_entries,
        "completed compaction"
    );
    Ok(true)
}

/// Merge the job's runs into one or more key-disjoint output runs at the
/// target level. Partial outputs are removed on error.
fn write_outputs(
    state: &LsmState,
    config: &StoreConfig,
    job: &CompactionJob,
    target_level: u32,
    drop_tombstones: bool,
) -> Result<Vec<Arc<SortedRun>>> {
    let mut outputs: Vec<Arc<SortedRun>> = Vec::new();

    let result = (|| -> Result<()> {
        let mut sources: Vec<EntryIter> = Vec::new();
        for run in job.all_runs() {
            sources.push(Box::new(run.iter()?));
        }
        let capacity_hint: u64 = job.all_runs().map(|run| run.entry_count).sum();

        let mut merged = MergeIterator::new(sources);
        let mut writer: Option<(u64, TableWriter)> = None;

        loop {
            let item = match merged.next() {
                Some(item) => item,
                None => break,
            };
            let (key, entry) = item?;

            if drop_tombstones && entry.is_tombstone() {
                continue;
            }

            if writer.is_none() {
                let run_id = state.next_run_id();
                let path = config
                    .dir
                    .join(SortedRun::file_name(target_level, run_id));
                writer = Some((
                    run_id,
                    TableWriter::create(
                        &path,
                        capacity_hint as usize,
                        config.bloom_fp_rate,
                        config.block_size,
                    )?,
                ));
            }

            let (_, table) = writer.as_mut().unwrap();
            table.add(&key, &entry)?;

            if table.written_bytes() >= config.compaction.max_output_bytes {
                let (run_id, table) = writer.take().unwrap();
                outputs.push(finish_output(config, target_level, run_id, table)?);
            }
        }

        if let Some((run_id, table)) = writer.take() {
            outputs.push(finish_output(config, target_level, run_id, table)?);
        }
        Ok(())
    })();

    if let Err(e) = result {
        for run in &outputs {
            run.mark_obsolete();
        }
        outputs.clear();
        return Err(e);
    }
    Ok(outputs)
}

fn finish_output(
    config: &StoreConfig,
    level: u32,
    run_id: u64,
    writer: TableWriter,
) -> Result<Arc<SortedRun>> {
    let summary = writer.finish()?;
    let meta = RunMeta {
        id: run_id,
        level,
        size: summary.file_size,
        entry_count: summary.entry_count,
        min_key: summary.min_key,
        max_key: summary.max_key,
    };
    Ok(Arc::new(SortedRun::open(&config.dir, &meta)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompactionConfig, StoreConfig};
    use crate::store::Store;
    use tempfile::TempDir;

    fn create_store(dir: &TempDir) -> Store {
        let config = StoreConfig::new(dir.path()).compaction(
            CompactionConfig::default()
                .level0_run_threshold(2)
                .level_base_bytes(1024)
                .max_output_bytes(64 * 1024),
        );
        Store::open_with_config(config).expect("failed to open store")
    }

    fn fill_and_flush(store: &Store, batch: usize, count: usize) {
        for i in 0..count {
            store
                .put(
                    format!("key_{:04}", i).as_bytes(),
                    format!("value_{}_{}", batch, i).as_bytes(),
                )
                .unwrap();
        }
        store.freeze().unwrap();
        store.flush().unwrap();
    }

    #[test]
    fn test_level0_threshold_triggers_job() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        fill_and_flush(&store, 0, 10);
        assert!(!store.needs_compaction());

        fill_and_flush(&store, 1, 10);
        assert!(store.needs_compaction());
    }

    #[test]
    fn test_compaction_collapses_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        fill_and_flush(&store, 0, 50);
        fill_and_flush(&store, 1, 50);

        assert!(store.compact().unwrap());

        let metrics = store.metrics();
        assert_eq!(metrics.level_count, 2);
        assert_eq!(metrics.level_sizes.len(), 2);

        let levels = store.state.level_snapshot();
        assert!(levels[0].is_empty(), "L0 should be drained");
        let l1_entries: u64 = levels[1].runs.iter().map(|r| r.entry_count).sum();
        assert_eq!(l1_entries, 50, "duplicate keys must collapse");

        // The newest batch wins for every key.
        for i in 0..50 {
            let value = store.get(format!("key_{:04}", i).as_bytes()).unwrap();
            assert_eq!(value, Some(format!("value_1_{}", i).into_bytes()));
        }
    }

    #[test]
    fn test_compaction_preserves_get_and_scan() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        fill_and_flush(&store, 0, 30);
        store.delete(b"key_0010").unwrap();
        store.put(b"key_0031", b"extra").unwrap();
        store.freeze().unwrap();
        store.flush().unwrap();

        let before: Vec<_> = store
            .scan(..)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        while store.compact().unwrap() {}

        let after: Vec<_> = store
            .scan(..)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(store.get(b"key_0010").unwrap(), None);
    }

    #[test]
    fn test_bottom_level_drops_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        for i in 0..20 {
            store
                .put(format!("key_{:04}", i).as_bytes(), b"value")
                .unwrap();
        }
        store.freeze().unwrap();
        store.flush().unwrap();

        for i in 0..10 {
            store.delete(format!("key_{:04}", i).as_bytes()).unwrap();
        }
        store.freeze().unwrap();
        store.flush().unwrap();

        while store.compact().unwrap() {}

        // Inspect the bottom level directly: no tombstones on disk.
        let levels = store.state.level_snapshot();
        let mut live = 0;
        for level in levels.iter() {
            for run in &level.runs {
                for item in run.iter().unwrap() {
                    let (_, entry) = item.unwrap();
                    assert!(!entry.is_tombstone(), "tombstone survived bottom-level compaction");
                    live += 1;
                }
            }
        }
        assert_eq!(live, 10);

        for i in 0..10 {
            assert_eq!(store.get(format!("key_{:04}", i).as_bytes()).unwrap(), None);
        }
        for i in 10..20 {
            assert!(store
                .get(format!("key_{:04}", i).as_bytes())
                .unwrap()
                .is_some());
        }
    }

    #[test]
    fn test_deeper_levels_stay_disjoint() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        for round in 0..6 {
            fill_and_flush(&store, round, 40);
            while store.compact().unwrap() {}
        }

        let levels = store.state.level_snapshot();
        crate::state::LsmState::validate_level_disjointness(&levels)
            .expect("levels must stay disjoint");
    }

    #[test]
    fn test_output_rollover_splits_runs() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path()).compaction(
            CompactionConfig::default()
                .level0_run_threshold(2)
                .max_output_bytes(2 * 1024),
        );
        let store = Store::open_with_config(config).unwrap();

        // Two flushes of ~20KB total force several output files.
        for batch in 0..2 {
            for i in 0..200 {
                store
                    .put(
                        format!("key_{:05}", i).as_bytes(),
                        format!("value_{}_{}", batch, "x".repeat(64)).as_bytes(),
                    )
                    .unwrap();
            }
            store.freeze().unwrap();
            store.flush().unwrap();
        }

        assert!(store.compact().unwrap());

        let levels = store.state.level_snapshot();
        assert!(
            levels[1].run_count() > 1,
            "expected multiple rolled-over outputs, got {}",
            levels[1].run_count()
        );
        crate::state::LsmState::validate_level_disjointness(&levels).unwrap();

        for i in 0..200 {
            assert!(store
                .get(format!("key_{:05}", i).as_bytes())
                .unwrap()
                .is_some());
        }
    }
}
