use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the WAL segments, sorted-run files and MANIFEST.
    pub dir: PathBuf,

    /// Maximum active memtable size before it is frozen (default: 4MB)
    pub memtable_size: usize,

    /// How many frozen memtables may queue before writes block on an inline
    /// flush (default: 2)
    pub max_frozen_memtables: usize,

    /// Fsync every WAL append before acknowledging the write (default: true).
    /// Disabling this selects group commit; durability then requires
    /// explicit `sync()` calls.
    pub wal_sync_on_append: bool,

    /// Target false-positive rate for the per-run bloom filters (default: 1%)
    pub bloom_fp_rate: f64,

    /// Target data-block size inside sorted runs (default: 4KB)
    pub block_size: usize,

    /// Compaction policy configuration
    pub compaction: CompactionConfig,

    /// Background scheduler configuration
    pub scheduler: SchedulerConfig,
}

/// Leveled-compaction policy knobs.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Number of L0 runs that triggers an L0 -> L1 compaction (default: 4)
    pub level0_run_threshold: usize,

    /// Byte budget of L1; level L gets `level_base_bytes * growth^(L-1)`
    /// (default: 8MB)
    pub level_base_bytes: u64,

    /// Size ratio between adjacent levels (default: 10)
    pub level_growth_factor: u64,

    /// Compaction output files roll over at this size (default: 8MB)
    pub max_output_bytes: u64,

    /// Consecutive background-compaction failures tolerated before the
    /// engine is halted (default: 5)
    pub max_failures: u32,

    /// Base delay for exponential backoff between compaction retries
    /// (default: 500ms)
    pub retry_backoff: Duration,
}

/// Background maintenance cadence.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check for flushable frozen memtables (default: 1s)
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 10s)
    pub compaction_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./siltdb"),
            memtable_size: 4 * 1024 * 1024,
            max_frozen_memtables: 2,
            wal_sync_on_append: true,
            bloom_fp_rate: 0.01,
            block_size: 4096,
            compaction: CompactionConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            level0_run_threshold: 4,
            level_base_bytes: 8 * 1024 * 1024,
            level_growth_factor: 10,
            max_output_bytes: 8 * 1024 * 1024,
            max_failures: 5,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    pub fn max_frozen_memtables(mut self, count: usize) -> Self {
        self.max_frozen_memtables = count;
        self
    }

    pub fn wal_sync_on_append(mut self, enabled: bool) -> Self {
        self.wal_sync_on_append = enabled;
        self
    }

    pub fn bloom_fp_rate(mut self, rate: f64) -> Self {
        self.bloom_fp_rate = rate;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl CompactionConfig {
    pub fn level0_run_threshold(mut self, threshold: usize) -> Self {
        self.level0_run_threshold = threshold;
        self
    }

    pub fn level_base_bytes(mut self, bytes: u64) -> Self {
        self.level_base_bytes = bytes;
        self
    }

    pub fn level_growth_factor(mut self, factor: u64) -> Self {
        self.level_growth_factor = factor;
        self
    }

    pub fn max_output_bytes(mut self, bytes: u64) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn max_failures(mut self, count: u32) -> Self {
        self.max_failures = count;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Byte budget for a level. L0 is governed by run count, not bytes.
    pub fn level_budget(&self, level: u32) -> u64 {
        if level == 0 {
            return u64::MAX;
        }
        self.level_base_bytes
            .saturating_mul(self.level_growth_factor.saturating_pow(level - 1))
    }
}

impl SchedulerConfig {
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }
}
