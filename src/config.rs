//! Storage layout and engine configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default fixed chunk size for backups (256 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Smallest accepted chunk size (4 KiB, the CBT block size)
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Largest accepted chunk size (16 MiB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Engine configuration: storage layout and tunables.
///
/// Every path is individually overridable; relative paths in the
/// sub-directory fields are resolved against `storage_root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for all persistent state
    pub storage_root: PathBuf,
    /// Chunk blob directory
    pub chunks_dir: PathBuf,
    /// Snapshot and manifest directory
    pub metadata_dir: PathBuf,
    /// Modification journal directory
    pub journal_dir: PathBuf,
    /// Persistent schedule list
    pub schedules_path: PathBuf,
    /// Fixed chunk size for backups, in bytes
    pub chunk_size: usize,
    /// Number of parallel file workers for backup and restore
    pub worker_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_storage_root("storage")
    }
}

impl Config {
    /// Build a configuration with all paths rooted at `storage_root`.
    pub fn with_storage_root<P: AsRef<Path>>(storage_root: P) -> Self {
        let root = storage_root.as_ref().to_path_buf();
        Self {
            chunks_dir: root.join("chunks"),
            metadata_dir: root.join("metadata"),
            journal_dir: root.join("journal"),
            schedules_path: root.join("schedules.json"),
            storage_root: root,
            chunk_size: DEFAULT_CHUNK_SIZE,
            worker_count: default_worker_count(),
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::io_at(path.as_ref().to_path_buf(), e))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::Configuration {
                reason: format!(
                    "chunk_size {} outside supported range {}..={}",
                    self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
                ),
            });
        }
        if self.worker_count == 0 {
            return Err(Error::Configuration {
                reason: "worker_count must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
