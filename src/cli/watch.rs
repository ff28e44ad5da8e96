//! Watch daemon: change tracking plus the backup scheduler.

use super::GlobalArgs;
use crate::cbt::CbtOptions;
use crate::{Result, Vault};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

/// Arguments for the watch daemon
#[derive(Args)]
pub struct WatchArgs {
    /// Directories to track for changes
    #[arg(required = true)]
    pub roots: Vec<PathBuf>,

    /// Watch only the top level of each root
    #[arg(long)]
    pub no_recursive: bool,

    /// Disable event debouncing
    #[arg(long)]
    pub no_debounce: bool,

    /// Debounce window in milliseconds
    #[arg(long, default_value = "500")]
    pub debounce_ms: u64,

    /// Also arm the persisted backup schedules
    #[arg(long)]
    pub with_scheduler: bool,
}

/// Run the watch daemon until interrupted
pub async fn run(global: &GlobalArgs, args: WatchArgs) -> Result<()> {
    let options = CbtOptions {
        recursive_watching: !args.no_recursive,
        event_debouncing_enabled: !args.no_debounce,
        debounce_timeout_ms: args.debounce_ms,
    };
    let vault = Vault::open_with_tracking(global.load_config()?, options)?;
    let Some(tracking) = vault.tracking() else {
        return Err(crate::Error::State {
            reason: "change tracking failed to start".to_string(),
        });
    };

    for root in &args.roots {
        let registration = tracking.enable_tracking(root)?;
        println!("Watching {} (registration {})", root.display(), registration);
    }

    let scheduler = if args.with_scheduler {
        let scheduler = vault.scheduler()?;
        scheduler.start();
        println!("Scheduler armed with {} schedules", scheduler.list_schedules().len());
        Some(scheduler)
    } else {
        None
    };

    println!("Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await.map_err(crate::Error::Io)?;
    info!("interrupt received, shutting down");

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    Ok(())
}
