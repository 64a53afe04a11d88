//! Store configuration.

use std::path::{Path, PathBuf};

/// Default estimate of the fixed per-entry overhead in the database, in
/// bytes: row storage, b-tree structure, index entries and a share of page
/// headers. An empirical figure, not a contract; it only needs to be the
/// right order of magnitude for quota accounting.
pub const DEFAULT_STATIC_ENTRY_OVERHEAD: i64 = 550;

/// Configuration for a [`PersistentStore`](crate::PersistentStore).
///
/// # Example
///
/// ```ignore
/// let config = StoreConfig::new("/var/cache/app")
///     .with_max_bytes(100 * 1024 * 1024)
///     .with_static_entry_overhead(600);
/// let store = PersistentStore::new(config);
/// store.initialize().await?;
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the database file. Created on initialize.
    pub path: PathBuf,
    /// Total byte budget for the cache. Zero selects automatic sizing from
    /// the free disk space of the cache volume.
    pub max_bytes: i64,
    /// Per-entry static overhead estimate used in size accounting.
    pub static_entry_overhead: i64,
}

impl StoreConfig {
    /// Create a configuration for a cache rooted at `path`, with automatic
    /// sizing and the default overhead estimate.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes: 0,
            static_entry_overhead: DEFAULT_STATIC_ENTRY_OVERHEAD,
        }
    }

    /// Set the total byte budget. Zero means auto-size from free disk space.
    pub fn with_max_bytes(mut self, max_bytes: i64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Override the per-entry static overhead estimate.
    pub fn with_static_entry_overhead(mut self, overhead: i64) -> Self {
        self.static_entry_overhead = overhead;
        self
    }
}
