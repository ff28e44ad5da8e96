//! Schedule management commands.

use super::GlobalArgs;
use crate::scheduler::DAILY_MINUTES;
use crate::{Result, Vault};
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Arguments for schedule management
#[derive(Args)]
pub struct ScheduleArgs {
    #[command(subcommand)]
    pub command: ScheduleCommand,
}

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Create a schedule
    Add {
        /// Schedule name
        #[arg(short, long)]
        name: String,

        /// Source directory to back up
        #[arg(short, long)]
        source: PathBuf,

        /// Interval between runs, in minutes
        #[arg(short, long, conflicts_with = "daily")]
        interval_minutes: Option<u64>,

        /// Run once per day (equivalent to an interval of 1440 minutes)
        #[arg(long)]
        daily: bool,

        /// Create the schedule disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List all schedules
    List,
    /// Delete a schedule
    Delete { id: String },
}

/// Run a schedule subcommand
pub async fn run(global: &GlobalArgs, args: ScheduleArgs) -> Result<()> {
    let vault = Vault::open(global.load_config()?)?;
    let scheduler = vault.scheduler()?;

    match args.command {
        ScheduleCommand::Add {
            name,
            source,
            interval_minutes,
            daily,
            disabled,
        } => {
            let interval = if daily {
                DAILY_MINUTES
            } else {
                interval_minutes.unwrap_or(DAILY_MINUTES)
            };
            let schedule = scheduler.add_schedule(&name, &source, interval, !disabled)?;
            println!("Added schedule {} ({})", schedule.name, schedule.id);
            println!("  Source: {}", schedule.source_path.display());
            println!("  Interval: {} minutes", schedule.interval_minutes);
            println!("  Enabled: {}", schedule.enabled);
        }
        ScheduleCommand::List => {
            let schedules = scheduler.list_schedules();
            if schedules.is_empty() {
                println!("No schedules.");
                return Ok(());
            }
            for schedule in schedules {
                println!(
                    "{}  {}  every {} min  enabled={}  last_run={}  last_result={}",
                    schedule.id,
                    schedule.name,
                    schedule.interval_minutes,
                    schedule.enabled,
                    schedule
                        .last_run
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "never".to_string()),
                    schedule.last_result.as_deref().unwrap_or("-"),
                );
            }
        }
        ScheduleCommand::Delete { id } => {
            scheduler.delete_schedule(&id)?;
            println!("Deleted schedule {}", id);
        }
    }
    Ok(())
}
