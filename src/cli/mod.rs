//! Command-line interface for chunkvault.
//!
//! Thin layer over the programmatic APIs: parses arguments, builds the
//! application context and maps results to exit codes.

use crate::config::Config;
use crate::{Error, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod backup;
pub mod maintenance;
pub mod restore;
pub mod schedule;
pub mod snapshots;
pub mod watch;

/// chunkvault - content-addressed, deduplicating backup and restore
#[derive(Parser)]
#[command(name = "chunkvault")]
#[command(about = "Content-addressed, chunk-deduplicating backup and restore engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand
#[derive(Args)]
pub struct GlobalArgs {
    /// Root directory for chunks, metadata and schedules
    #[arg(long, global = true)]
    pub storage_root: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl GlobalArgs {
    /// Resolve the effective configuration. `--storage-root` re-roots the
    /// layout from the config file (or the defaults), keeping tunables.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(root) = &self.storage_root {
            let mut rooted = Config::with_storage_root(root);
            rooted.chunk_size = config.chunk_size;
            rooted.worker_count = config.worker_count;
            config = rooted;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a backup snapshot
    Backup(backup::BackupArgs),
    /// Restore a snapshot into a directory
    Restore(restore::RestoreArgs),
    /// Inspect and manage snapshots
    Snapshots(snapshots::SnapshotsArgs),
    /// Verify chunk integrity and reclaim orphaned chunks
    Maintenance(maintenance::MaintenanceArgs),
    /// Manage scheduled backups
    Schedule(schedule::ScheduleArgs),
    /// Watch a directory and run the scheduler daemon
    Watch(watch::WatchArgs),
}

/// Process exit code for an error, per the CLI contract: 1 for user
/// errors, 2 for runtime errors, 3 for integrity failures.
pub fn exit_code(error: &Error) -> u8 {
    match error {
        Error::InvalidArgument { .. }
        | Error::Configuration { .. }
        | Error::Scheduling { .. }
        | Error::TomlParse(_)
        | Error::SnapshotNotFound { .. }
        | Error::FileNotFound { .. } => 1,
        Error::Integrity { .. } => 3,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(
            exit_code(&Error::InvalidArgument {
                reason: "bad".into()
            }),
            1
        );
        assert_eq!(
            exit_code(&Error::Integrity {
                reason: "mismatch".into()
            }),
            3
        );
        assert_eq!(exit_code(&Error::Cancelled), 2);
    }
}
