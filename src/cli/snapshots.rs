//! Snapshot management commands.

use super::GlobalArgs;
use crate::{Error, Result, Vault};
use clap::{Args, Subcommand};
use uuid::Uuid;

/// Arguments for snapshot management
#[derive(Args)]
pub struct SnapshotsArgs {
    #[command(subcommand)]
    pub command: SnapshotsCommand,
}

#[derive(Subcommand)]
pub enum SnapshotsCommand {
    /// List all snapshots
    List,
    /// Show one snapshot in detail
    Show {
        id: Uuid,

        /// Also list every file in the snapshot
        #[arg(long)]
        files: bool,
    },
    /// Delete a snapshot (chunks are kept; run maintenance sweep to
    /// reclaim them)
    Delete { id: Uuid },
}

/// Run a snapshots subcommand
pub async fn run(global: &GlobalArgs, args: SnapshotsArgs) -> Result<()> {
    let vault = Vault::open(global.load_config()?)?;

    match args.command {
        SnapshotsCommand::List => {
            let snapshots = vault.list_snapshots()?;
            if snapshots.is_empty() {
                println!("No snapshots.");
                return Ok(());
            }
            for snapshot in snapshots {
                println!(
                    "{}  {}  {}  {} files, {} bytes",
                    snapshot.id,
                    snapshot.created.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.name,
                    snapshot.file_count,
                    snapshot.total_bytes
                );
            }
        }
        SnapshotsCommand::Show { id, files } => {
            let snapshot = vault
                .get_snapshot(id)?
                .ok_or_else(|| Error::SnapshotNotFound { id: id.to_string() })?;
            println!("Snapshot {}", snapshot.id);
            println!("  Name: {}", snapshot.name);
            if !snapshot.description.is_empty() {
                println!("  Description: {}", snapshot.description);
            }
            if let Some(root) = snapshot.resolve_source_root() {
                println!("  Source root: {}", root.display());
            }
            println!("  Created: {}", snapshot.created);
            println!("  Files: {}", snapshot.file_count);
            println!("  Bytes: {}", snapshot.total_bytes);
            println!(
                "  Chunks: {} unique, {} deduplicated, {} bytes saved",
                snapshot.chunk_stats.unique_chunks,
                snapshot.chunk_stats.dedup_chunks,
                snapshot.chunk_stats.dedup_saved_bytes
            );
            if files {
                for manifest in vault.files_in_snapshot(id)? {
                    println!(
                        "  {}  {} bytes  {} chunks",
                        manifest.path.display(),
                        manifest.size,
                        manifest.chunks.len()
                    );
                }
            }
        }
        SnapshotsCommand::Delete { id } => {
            vault.delete_snapshot(id)?;
            println!("Deleted snapshot {}", id);
        }
    }
    Ok(())
}
