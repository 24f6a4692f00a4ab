//! Store configuration, built with a chained-setter style `Config`.

use crate::gc::monitor::{GcMonitor, NoopGcMonitor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cache sizing: a byte budget, or disabled entirely.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheSize {
    Bytes(u64),
    Off,
}

/// Generational GC tuning knobs.
#[derive(Clone, Debug)]
pub struct GcOptions {
    /// When `true`, the background compaction trigger never fires
    /// (`compact()` can still be called inline).
    pub paused: bool,

    /// Disk-space-low guard threshold, as a percentage of directory size.
    pub memory_threshold_pct: u8,

    /// Skip compaction if `(reclaimable/total) * 100` is below this.
    pub gain_threshold_pct: u8,

    /// How many rebase-and-retry cycles to attempt on CAS failure.
    pub retry_count: u32,

    /// Whether to fall back to an exclusive-lock forced compaction after
    /// `retry_count` failed optimistic attempts.
    pub force_after_fail: bool,

    /// Seconds to wait for the exclusive lock during forced compaction.
    pub lock_wait_time: u64,

    /// Number of trailing generations retained by cleanup. Must be >= 2.
    pub retained_generations: u32,

    /// Cleanup rewrites (rather than keeps) an archive file once the
    /// reclaimable byte share reaches this percentage.
    pub rewrite_threshold_pct: u8,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            paused: false,
            memory_threshold_pct: 25,
            gain_threshold_pct: 10,
            retry_count: 5,
            force_after_fail: false,
            lock_wait_time: 60,
            retained_generations: 2,
            rewrite_threshold_pct: 25,
        }
    }
}

/// Store configuration.
#[derive(Clone)]
pub struct Config {
    pub(crate) path: PathBuf,
    pub(crate) max_file_size: u64,
    pub(crate) cache_size: CacheSize,
    pub(crate) memory_mapping: bool,
    pub(crate) segment_version: u8,
    pub(crate) gc_options: GcOptions,
    pub(crate) gc_monitor: Arc<dyn GcMonitor>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("max_file_size", &self.max_file_size)
            .field("cache_size", &self.cache_size)
            .field("memory_mapping", &self.memory_mapping)
            .field("segment_version", &self.segment_version)
            .field("gc_options", &self.gc_options)
            .finish_non_exhaustive()
    }
}

const DEFAULT_MAX_FILE_SIZE: u64 = 256 * 1024 * 1024;
const DEFAULT_CACHE_BYTES: u64 = 64 * 1024 * 1024;

impl Config {
    /// Starts a new configuration rooted at `path`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            cache_size: CacheSize::Bytes(DEFAULT_CACHE_BYTES),
            memory_mapping: true,
            segment_version: 1,
            gc_options: GcOptions::default(),
            gc_monitor: Arc::new(NoopGcMonitor),
        }
    }

    #[must_use]
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    #[must_use]
    pub fn cache_size(mut self, size: CacheSize) -> Self {
        self.cache_size = size;
        self
    }

    #[must_use]
    pub fn memory_mapping(mut self, enabled: bool) -> Self {
        self.memory_mapping = enabled;
        self
    }

    #[must_use]
    pub fn segment_version(mut self, version: u8) -> Self {
        self.segment_version = version;
        self
    }

    #[must_use]
    pub fn gc_options(mut self, options: GcOptions) -> Self {
        self.gc_options = options;
        self
    }

    /// Installs a custom [`GcMonitor`] to observe compaction/cleanup
    /// lifecycle events, replacing the default no-op monitor.
    #[must_use]
    pub fn gc_monitor(mut self, monitor: Arc<dyn GcMonitor>) -> Self {
        self.gc_monitor = monitor;
        self
    }

    /// Opens (or creates) the store described by this configuration.
    pub fn open(self) -> crate::Result<crate::store::Store> {
        crate::store::Store::open(self)
    }
}
