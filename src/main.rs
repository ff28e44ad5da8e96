//! chunkvault - content-addressed backup and restore
//!
//! Main binary entry point for the command-line interface.

use chunkvault::cli::{self, Cli, Commands};
use chunkvault::Error;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Backup(args) => cli::backup::run(&cli.global, args).await,
        Commands::Restore(args) => cli::restore::run(&cli.global, args).await,
        Commands::Snapshots(args) => cli::snapshots::run(&cli.global, args).await,
        Commands::Maintenance(args) => cli::maintenance::run(&cli.global, args).await,
        Commands::Schedule(args) => cli::schedule::run(&cli.global, args).await,
        Commands::Watch(args) => cli::watch::run(&cli.global, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {}", render_chain(&error));
            ExitCode::from(cli::exit_code(&error))
        }
    }
}

/// Render the error and its causes on a single line.
fn render_chain(error: &Error) -> String {
    let mut rendered = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
