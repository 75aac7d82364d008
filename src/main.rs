// ABOUTME: Command-line entry point for timescaledb-backup
// ABOUTME: Sets up logging, confirms destructive restores and dispatches subcommands

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use tracing_subscriber::EnvFilter;

use timescaledb_backup::cli::{Cli, Commands};
use timescaledb_backup::{dump, restore};

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("timescaledb_backup={}", default_level))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn confirm_restore(target: &str) -> Result<bool> {
    Confirm::new()
        .with_prompt(format!(
            "Restore will drop and recreate the timescaledb extension in {}. Continue?",
            target
        ))
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Dump(args) => {
            let config = args.into_config()?;
            dump(&config).await
        }
        Commands::Restore(args) => {
            let skip_prompt = args.yes;
            let config = args.into_config()?;
            let target = config
                .database_name()?
                .unwrap_or_else(|| "the target database".to_string());
            if !skip_prompt && !confirm_restore(&target)? {
                tracing::info!("Restore cancelled");
                return Ok(());
            }
            restore(&config).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Commands::Dump(args) => args.verbose,
        Commands::Restore(args) => args.verbose,
    };
    setup_logging(verbose);

    if let Err(err) = run(cli).await {
        tracing::error!("{:#}", err);
        std::process::exit(1);
    }
}
