//! Backup command implementation.

use super::GlobalArgs;
use crate::backup::BackupOptions;
use crate::cbt::CbtOptions;
use crate::{Error, Result, Vault};
use clap::Args;
use std::path::PathBuf;

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// Source directory to back up
    pub source: PathBuf,

    /// Snapshot name (autogenerated when omitted)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Snapshot description
    #[arg(short, long)]
    pub description: Option<String>,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Re-read every stored chunk after the backup
    #[arg(long)]
    pub verify: bool,

    /// Glob patterns selecting files to back up
    #[arg(long = "include")]
    pub include_patterns: Vec<String>,

    /// Glob patterns for files to skip
    #[arg(long = "exclude")]
    pub exclude_patterns: Vec<String>,

    /// Back up only files the change journal marked dirty
    #[arg(long)]
    pub incremental: bool,

    /// Abort the whole backup on the first file error
    #[arg(long)]
    pub strict: bool,
}

/// Run the backup command
pub async fn run(global: &GlobalArgs, args: BackupArgs) -> Result<()> {
    let config = global.load_config()?;
    let chunk_size = args.chunk_size.unwrap_or(config.chunk_size);
    let vault = if args.incremental {
        Vault::open_with_tracking(config, CbtOptions::default())?
    } else {
        Vault::open(config)?
    };

    let options = BackupOptions {
        snapshot_name: args.name,
        description: args.description,
        chunk_size,
        verify_integrity: args.verify,
        include_patterns: args.include_patterns,
        exclude_patterns: args.exclude_patterns,
        incremental: args.incremental,
        strict: args.strict,
        ..Default::default()
    };

    let source = args.source.clone();
    let report =
        tokio::task::spawn_blocking(move || vault.backup(&source, &options))
            .await
            .map_err(|e| Error::State {
                reason: format!("backup task failed: {}", e),
            })??;

    println!("Snapshot: {}", report.snapshot_id);
    println!("  Files backed up: {}", report.files_backed_up);
    println!("  Bytes processed: {}", report.bytes_processed);
    println!("  Duration: {:.2?}", report.duration);
    if let Some(verified) = report.integrity_verified {
        println!("  Integrity verified: {}", verified);
    }
    for failure in &report.files_failed {
        eprintln!("  failed: {}: {}", failure.path.display(), failure.error);
    }

    if report.integrity_verified == Some(false) {
        return Err(Error::Integrity {
            reason: "post-backup verification failed".to_string(),
        });
    }
    if !report.success {
        return Err(Error::State {
            reason: format!("{} files failed", report.files_failed.len()),
        });
    }
    Ok(())
}
