//! Store maintenance commands: verification and orphan sweep.

use super::GlobalArgs;
use crate::{Error, Result, Vault};
use clap::{Args, Subcommand};

/// Arguments for store maintenance
#[derive(Args)]
pub struct MaintenanceArgs {
    #[command(subcommand)]
    pub command: MaintenanceCommand,
}

#[derive(Subcommand)]
pub enum MaintenanceCommand {
    /// Re-read and re-hash every stored chunk
    Verify,
    /// Delete chunks no finalized snapshot references
    Sweep,
    /// Print store statistics
    Stats,
}

/// Run a maintenance subcommand
pub async fn run(global: &GlobalArgs, args: MaintenanceArgs) -> Result<()> {
    let vault = Vault::open(global.load_config()?)?;

    match args.command {
        MaintenanceCommand::Verify => {
            let stats = vault.store_stats();
            let corrupted =
                tokio::task::spawn_blocking(move || vault.verify_store())
                    .await
                    .map_err(|e| Error::State {
                        reason: format!("verify task failed: {}", e),
                    })??;
            println!("Checked {} chunks.", stats.chunk_count);
            if corrupted.is_empty() {
                println!("All chunks verified.");
            } else {
                for digest in &corrupted {
                    eprintln!("  corrupted: {}", digest);
                }
                return Err(Error::Integrity {
                    reason: format!("{} corrupted chunks", corrupted.len()),
                });
            }
        }
        MaintenanceCommand::Sweep => {
            let swept = vault.sweep_orphaned_chunks()?;
            println!(
                "Removed {} chunks, reclaimed {} bytes.",
                swept.removed_chunks, swept.reclaimed_bytes
            );
        }
        MaintenanceCommand::Stats => {
            let stats = vault.store_stats();
            println!("Chunks: {}", stats.chunk_count);
            println!("Stored bytes: {}", stats.total_bytes);
            println!("Snapshots: {}", vault.list_snapshots()?.len());
        }
    }
    Ok(())
}
