//! Flushing frozen memtables into level-0 sorted runs.

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::level::{Level, SortedRun};
use crate::manifest::RunMeta;
use crate::sstable::TableWriter;
use crate::state::LsmState;

/// Flush the oldest frozen memtable, if any. Returns false when another
/// flush holds the pending flag or there is nothing to flush.
///
/// The frozen memtable stays in the queue (and readable) until its run is
/// committed, so a failed flush loses nothing and is retried later.
pub fn flush_oldest(state: &LsmState, config: &StoreConfig) -> Result<bool> {
    let _guard = match state.try_mark_flush_pending() {
        Some(guard) => guard,
        None => return Ok(false),
    };

    let memtable = match state.frozen_memtables.read()?.front() {
        Some(memtable) => memtable.clone(),
        None => return Ok(false),
    };

    if memtable.is_empty() {
        state.frozen_memtables.write()?.pop_front();
        remove_wal(&memtable);
        return Ok(true);
    }

    let run_id = state.next_run_id();
    let path = config.dir.join(SortedRun::file_name(0, run_id));

    let run = match build_run(config, &memtable, run_id) {
        Ok(run) => run,
        Err(e) => {
            // Leave the memtable queued for retry; drop the partial file.
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
    };
    let entry_count = run.entry_count;

    {
        let _publish = state.publish_lock.lock()?;
        let mut levels: Vec<Level> = state.level_snapshot().as_ref().clone();
        if levels.is_empty() {
            levels.push(Level::new(0));
        }
        levels[0].add_run(run);

        state.publish_seq(memtable.max_seq());
        state.manifest.commit(&state.manifest_state(&levels))?;
        state.swap_levels(levels);
    }

    state.frozen_memtables.write()?.pop_front();
    remove_wal(&memtable);

    tracing::info!(
        run_id = run_id,
        wal_id = memtable.wal_id(),
        entries = entry_count,
        "flushed memtable to level-0 run"
    );
    Ok(true)
}

fn build_run(
    config: &StoreConfig,
    memtable: &crate::memtable::FrozenMemtable,
    run_id: u64,
) -> Result<Arc<SortedRun>> {
    let path = config.dir.join(SortedRun::file_name(0, run_id));
    let mut writer = TableWriter::create(
        &path,
        memtable.len(),
        config.bloom_fp_rate,
        config.block_size,
    )?;

    for record in memtable.iter() {
        let (key, entry) = record?;
        writer.add(&key, &entry)?;
    }
    let summary = writer.finish()?;

    let meta = RunMeta {
        id: run_id,
        level: 0,
        size: summary.file_size,
        entry_count: summary.entry_count,
        min_key: summary.min_key,
        max_key: summary.max_key,
    };
    Ok(Arc::new(SortedRun::open(&config.dir, &meta)?))
}

fn remove_wal(memtable: &crate::memtable::FrozenMemtable) {
    let path = memtable.wal_path();
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::warn!(wal_id = memtable.wal_id(), error = %e, "failed to delete flushed WAL segment");
    }
}

#[cfg(test)]
mod tests {
    use crate::config::StoreConfig;
    use crate::error::Result;
    use crate::store::Store;
    use tempfile::TempDir;

    fn create_store(dir: &TempDir) -> Store {
        Store::open_with_config(StoreConfig::new(dir.path())).expect("failed to open store")
    }

    #[test]
    fn test_flush_moves_data_to_level0() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        for i in 0..10 {
            store.put(
                format!("key_{:03}", i).as_bytes(),
                format!("value_{}", i).as_bytes(),
            )?;
        }
        store.freeze()?;
        assert!(store.flush()?, "flush should have run");

        let metrics = store.metrics();
        assert_eq!(metrics.frozen_memtable_count, 0);
        assert_eq!(metrics.total_run_count, 1);

        for i in 0..10 {
            let value = store.get(format!("key_{:03}", i).as_bytes())?;
            assert_eq!(value, Some(format!("value_{}", i).into_bytes()));
        }
        Ok(())
    }

    #[test]
    fn test_flush_with_nothing_to_do() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);
        assert!(!store.flush()?);
        Ok(())
    }

    #[test]
    fn test_flush_preserves_tombstones() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        store.put(b"kept", b"value")?;
        store.delete(b"dropped")?;
        store.freeze()?;
        store.flush()?;

        assert_eq!(store.get(b"kept")?, Some(b"value".to_vec()));
        assert_eq!(store.get(b"dropped")?, None);
        Ok(())
    }

    #[test]
    fn test_flush_deletes_wal_segment() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        store.put(b"key", b"value")?;
        store.freeze()?;
        store.flush()?;

        let wal_segments = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("wal-") && name.ends_with(".log")
            })
            .count();
        // Only the fresh active segment remains.
        assert_eq!(wal_segments, 1);
        Ok(())
    }

    #[test]
    fn test_multiple_flushes_stack_in_level0() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        for batch in 0..3 {
            for i in 0..5 {
                store.put(
                    format!("batch_{}_key_{}", batch, i).as_bytes(),
                    b"value",
                )?;
            }
            store.freeze()?;
            store.flush()?;
        }

        let metrics = store.metrics();
        assert_eq!(metrics.total_run_count, 3);

        for batch in 0..3 {
            for i in 0..5 {
                let key = format!("batch_{}_key_{}", batch, i);
                assert!(store.get(key.as_bytes())?.is_some(), "missing {}", key);
            }
        }
        Ok(())
    }
}
