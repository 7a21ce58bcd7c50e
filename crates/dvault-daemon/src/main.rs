use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dvault_config::logging::{init_logging, LogLevel};
use dvault_daemon::Daemon;
use tokio::signal;

#[derive(Parser)]
#[command(name = "dvaultd")]
#[command(version, about = "dvault backup daemon", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Store root directory (overrides config)
    #[arg(long, env = "DVAULT_ROOT", global = true)]
    root: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(long, env = "DVAULT_LISTEN", global = true)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    dvault_config::reload().context("Failed to load configuration")?;
    let mut config = dvault_config::config().clone();
    if let Some(root) = cli.root {
        config.storage.root = root;
    }
    if let Some(listen) = cli.listen {
        config.daemon.listen = listen;
    }

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            let daemon = Daemon::bind(&config).await?;
            daemon.run_until(signal::ctrl_c()).await?;
        }
    }

    Ok(())
}
