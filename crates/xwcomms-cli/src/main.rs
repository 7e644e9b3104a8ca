//! xwcomms command-line entry point

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use xwcomms_cli::{cli::Cli, commands::CommandDispatcher, config::AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref().map(Path::new))
        .context("Failed to load configuration")?;
    setup_logging(cli.verbose || config.cli.verbose);
    match &cli.config {
        Some(path) => info!("Loaded configuration from: {}", path),
        None => debug!("Using default configuration layers"),
    }

    CommandDispatcher::execute(cli, config)
        .await
        .context("Command execution failed")?;
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}
