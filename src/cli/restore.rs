//! Restore command implementation.

use super::GlobalArgs;
use crate::restore::RestoreOptions;
use crate::{Error, Result, Vault};
use clap::Args;
use std::path::PathBuf;
use uuid::Uuid;

/// Arguments for the restore command
#[derive(Args)]
pub struct RestoreArgs {
    /// Snapshot id to restore
    pub snapshot: Uuid,

    /// Target directory
    pub target: PathBuf,

    /// Replace files that already exist at the target
    #[arg(long)]
    pub overwrite: bool,

    /// Skip files that already exist at the target
    #[arg(long)]
    pub skip_existing: bool,

    /// Keep a timestamped copy of files replaced by --overwrite
    #[arg(long)]
    pub backup_existing: bool,

    /// Re-hash every restored file after the run
    #[arg(long)]
    pub verify: bool,

    /// Do not restore modification times and permissions
    #[arg(long)]
    pub no_preserve_attributes: bool,

    /// Glob patterns selecting files to restore
    #[arg(long = "include")]
    pub include_patterns: Vec<String>,

    /// Glob patterns for files to skip
    #[arg(long = "exclude")]
    pub exclude_patterns: Vec<String>,

    /// Resolve everything but write nothing
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the restore command
pub async fn run(global: &GlobalArgs, args: RestoreArgs) -> Result<()> {
    let vault = Vault::open(global.load_config()?)?;

    let options = RestoreOptions {
        overwrite_existing: args.overwrite,
        skip_existing: args.skip_existing,
        backup_existing: args.backup_existing,
        verify_integrity: args.verify,
        preserve_attributes: !args.no_preserve_attributes,
        include_patterns: args.include_patterns,
        exclude_patterns: args.exclude_patterns,
        dry_run: args.dry_run,
        ..Default::default()
    };

    let snapshot = args.snapshot;
    let target = args.target.clone();
    let report =
        tokio::task::spawn_blocking(move || vault.restore(snapshot, &target, &options))
            .await
            .map_err(|e| Error::State {
                reason: format!("restore task failed: {}", e),
            })??;

    if args.dry_run {
        println!("Dry run for snapshot {}", report.snapshot_id);
    } else {
        println!("Restored snapshot {}", report.snapshot_id);
    }
    println!("  Files restored: {}", report.files_restored);
    println!("  Files skipped: {}", report.files_skipped);
    println!("  Bytes written: {}", report.bytes_written);
    println!("  Duration: {:.2?}", report.duration);
    if let Some(verified) = report.integrity_verified {
        println!("  Integrity verified: {}", verified);
    }
    for failure in &report.files_failed {
        eprintln!("  failed: {}: {}", failure.path.display(), failure.error);
    }

    if report.integrity_verified == Some(false) {
        return Err(Error::Integrity {
            reason: "post-restore verification failed".to_string(),
        });
    }
    if !report.success {
        return Err(Error::State {
            reason: format!("{} files failed", report.files_failed.len()),
        });
    }
    Ok(())
}
