//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the heap files, index files, WAL and catalog.
    pub data_dir: PathBuf,
    /// Buffer pool capacity in 4 KiB frames.
    pub buffer_pool_frames: usize,
    /// fsync the WAL on every commit. Turning this off trades the
    /// durability of recent commits for throughput.
    pub sync_on_commit: bool,
    /// Background vacuum period; None disables the worker.
    pub vacuum_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("granitedb-data"),
            buffer_pool_frames: 128,
            sync_on_commit: true,
            vacuum_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Self::default()
        }
    }
}
