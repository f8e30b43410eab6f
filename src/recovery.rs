//! Startup recovery: manifest replay, run loading, WAL redo.
//!
//! Recovery order matters: the manifest names the durable runs, the WAL
//! segments hold everything newer. Every segment but the newest becomes a
//! frozen memtable (it was frozen or mid-flush at crash time); the newest
//! becomes the active memtable. Sequence numbering resumes past the
//! highest sequence seen anywhere.
//!
//! Run files not referenced by the manifest are leftovers of an
//! interrupted flush or compaction (outputs are written before the
//! manifest commits) and are deleted here; their contents are still
//! covered by the WAL or by the retired inputs the manifest kept.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::level::{Level, SortedRun};
use crate::manifest::{Manifest, ManifestState, MANIFEST_FILE};
use crate::memtable::{ActiveMemtable, FrozenMemtable};
use crate::state::LsmState;
use crate::wal::Wal;

pub fn wal_file_name(id: u64) -> String {
    format!("wal-{:08}.log", id)
}

pub(crate) fn recover(config: &StoreConfig) -> Result<LsmState> {
    let dir = &config.dir;
    std::fs::create_dir_all(dir)?;

    let (manifest, manifest_state) = Manifest::open(dir)?;

    let levels = open_levels(config, &manifest_state)?;
    LsmState::validate_level_disjointness(&levels)?;

    remove_orphan_files(config, &manifest_state);

    let (active, frozen, next_wal_id) = recover_memtables(config)?;

    let mut max_seq = manifest_state.last_seq;
    max_seq = max_seq.max(active.max_seq());
    for memtable in &frozen {
        max_seq = max_seq.max(memtable.max_seq());
    }

    let max_run_id = manifest_state.runs().map(|run| run.id).max();
    let next_run_id = manifest_state
        .next_run_id
        .max(max_run_id.map_or(0, |id| id + 1));

    tracing::info!(
        levels = levels.len(),
        runs = manifest_state.runs().count(),
        frozen_memtables = frozen.len(),
        next_seq = max_seq + 1,
        "recovery complete"
    );

    Ok(LsmState::new(
        active,
        frozen,
        levels,
        manifest,
        max_seq + 1,
        next_run_id,
        next_wal_id,
        manifest_state.last_seq,
    ))
}

fn open_levels(config: &StoreConfig, manifest_state: &ManifestState) -> Result<Vec<Level>> {
    let mut levels: Vec<Level> = Vec::new();

    for level_meta in &manifest_state.levels {
        while levels.len() <= level_meta.level as usize {
            levels.push(Level::new(levels.len() as u32));
        }
        for run_meta in &level_meta.runs {
            let run = SortedRun::open(&config.dir, run_meta).map_err(|e| match e {
                Error::Io(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Error::Corruption(format!(
                        "manifest references missing run file {}",
                        SortedRun::file_name(run_meta.level, run_meta.id)
                    ))
                }
                other => other,
            })?;
            levels[level_meta.level as usize].add_run(Arc::new(run));
        }
    }

    Ok(levels)
}

/// Delete run files the manifest does not know about, plus a stale
/// manifest temp file from an interrupted commit.
fn remove_orphan_files(config: &StoreConfig, manifest_state: &ManifestState) {
    let referenced: std::collections::HashSet<String> = manifest_state
        .runs()
        .map(|run| SortedRun::file_name(run.level, run.id))
        .collect();

    let entries = match std::fs::read_dir(&config.dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list data directory for orphan cleanup");
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let stale = (name.ends_with(".sst") && !referenced.contains(name.as_ref()))
            || name == format!("{}.tmp", MANIFEST_FILE);
        if stale {
            tracing::warn!(file = %name, "removing orphan file left by interrupted operation");
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!(file = %name, error = %e, "failed to remove orphan file");
            }
        }
    }
}

type MemtableRecovery = (ActiveMemtable, VecDeque<Arc<FrozenMemtable>>, u64);

fn recover_memtables(config: &StoreConfig) -> Result<MemtableRecovery> {
    let mut segments: Vec<(u64, PathBuf)> = std::fs::read_dir(&config.dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            let id = name
                .strip_prefix("wal-")?
                .strip_suffix(".log")?
                .parse::<u64>()
                .ok()?;
            Some((id, path))
        })
        .collect();
    segments.sort_by_key(|(id, _)| *id);

    let mut frozen = VecDeque::new();
    let (active, next_wal_id) = match segments.split_last() {
        Some(((active_id, active_path), rest)) => {
            for (id, path) in rest {
                let wal = Wal::open(path, config.wal_sync_on_append)?;
                frozen.push_back(Arc::new(FrozenMemtable::from_wal(wal, *id)?));
            }
            let wal = Wal::open(active_path, config.wal_sync_on_append)?;
            (ActiveMemtable::from_wal(wal, *active_id)?, active_id + 1)
        }
        None => {
            let path = config.dir.join(wal_file_name(0));
            (
                ActiveMemtable::new(&path, 0, config.wal_sync_on_append)?,
                1,
            )
        }
    };

    Ok((active, frozen, next_wal_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::TempDir;

    #[test]
    fn test_recover_empty_directory() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let state = recover(&StoreConfig::new(dir.path()))?;

        assert!(state.level_snapshot().is_empty());
        assert!(state.frozen_memtables.read().unwrap().is_empty());
        assert_eq!(state.active_memtable.read().unwrap().size(), 0);
        Ok(())
    }

    #[test]
    fn test_wal_redo_restores_unflushed_writes() -> Result<()> {
        let dir = TempDir::new().unwrap();

        {
            let store = Store::open(dir.path())?;
            store.put(b"key1", b"value1")?;
            store.put(b"key2", b"value2")?;
            store.delete(b"key1")?;
            // Dropped without flushing: only the WAL survives.
        }

        let store = Store::open(dir.path())?;
        assert_eq!(store.get(b"key1")?, None);
        assert_eq!(store.get(b"key2")?, Some(b"value2".to_vec()));

        // Sequences resume past the replayed ones.
        store.put(b"key1", b"rewritten")?;
        assert_eq!(store.get(b"key1")?, Some(b"rewritten".to_vec()));
        Ok(())
    }

    #[test]
    fn test_recover_flushed_runs_and_frozen_memtables() -> Result<()> {
        let dir = TempDir::new().unwrap();

        {
            let store = Store::open(dir.path())?;
            store.put(b"flushed", b"on_disk")?;
            store.freeze()?;
            store.flush()?;

            store.put(b"frozen", b"in_wal")?;
            store.freeze()?;
            store.put(b"active", b"in_wal_too")?;
        }

        let store = Store::open(dir.path())?;
        assert_eq!(store.get(b"flushed")?, Some(b"on_disk".to_vec()));
        assert_eq!(store.get(b"frozen")?, Some(b"in_wal".to_vec()));
        assert_eq!(store.get(b"active")?, Some(b"in_wal_too".to_vec()));

        let metrics = store.metrics();
        assert_eq!(metrics.total_run_count, 1);
        assert_eq!(metrics.frozen_memtable_count, 1);
        Ok(())
    }

    #[test]
    fn test_missing_run_file_is_corruption() -> Result<()> {
        let dir = TempDir::new().unwrap();

        {
            let store = Store::open(dir.path())?;
            store.put(b"key", b"value")?;
            store.freeze()?;
            store.flush()?;
        }

        // Remove the flushed run out from under the manifest.
        let run = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().ends_with(".sst"))
            .expect("expected a run file");
        std::fs::remove_file(run.path()).unwrap();

        assert!(matches!(
            Store::open(dir.path()),
            Err(Error::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn test_orphan_run_files_are_cleaned() -> Result<()> {
        let dir = TempDir::new().unwrap();

        {
            let store = Store::open(dir.path())?;
            store.put(b"key", b"value")?;
            store.freeze()?;
            store.flush()?;
        }

        // Simulate a crash between output write and manifest commit.
        let orphan = dir.path().join(SortedRun::file_name(1, 99));
        std::fs::write(&orphan, b"partial output").unwrap();

        let store = Store::open(dir.path())?;
        assert!(!orphan.exists(), "orphan run should be deleted");
        assert_eq!(store.get(b"key")?, Some(b"value".to_vec()));
        Ok(())
    }
}
