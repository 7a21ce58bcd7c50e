//! # dvault CLI
//!
//! Command-line client for the dvault deduplicating backup daemon.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use dvault_cas::hash_to_hex;
use dvault_config::logging::{init_logging, LogLevel};
use dvault_config::{log_cli_debug, Config};
use dvault_ipc::client::DaemonClient;
use dvault_manifest::{EntryKind, VersionInfo};

pub mod gc;
pub mod sync;

use gc::{format_bytes, format_number};
use sync::UploadResult;

/// dvault - deduplicating, versioned file backup
#[derive(Parser)]
#[command(name = "dvault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon address (overrides config)
    #[arg(long, env = "DVAULT_SERVER", global = true)]
    server: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, or every file under a directory, as new versions
    Upload {
        #[arg(value_name = "LOCAL")]
        local: PathBuf,

        /// Remote path (defaults to /<file name>)
        #[arg(value_name = "REMOTE")]
        remote: Option<String>,
    },

    /// Download a version of a remote file
    Download {
        #[arg(value_name = "REMOTE")]
        remote: String,

        #[arg(value_name = "LOCAL")]
        local: PathBuf,

        /// Version index (defaults to the latest)
        #[arg(long)]
        version: Option<usize>,
    },

    /// List a remote directory
    Ls {
        #[arg(value_name = "REMOTE", default_value = "/")]
        path: String,
    },

    /// Show the versions of a remote file
    Versions {
        #[arg(value_name = "REMOTE")]
        path: String,
    },

    /// Create a remote directory and its parents
    Mkdir {
        #[arg(value_name = "REMOTE")]
        path: String,
    },

    /// Remove a remote file (all versions) or directory
    Rm {
        #[arg(value_name = "REMOTE")]
        path: String,
    },

    /// Delete one version without losing any other
    DeleteVersion {
        #[arg(value_name = "REMOTE")]
        path: String,

        #[arg(value_name = "INDEX")]
        index: usize,
    },

    /// Show store capacity and counters
    Status,

    /// Reclaim superseded versions and orphaned blocks now
    Gc,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Print the config file locations
    Path,

    /// Write a default config file
    Init {
        /// Write the global file instead of .dvault/config.toml
        #[arg(long)]
        global: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.verbose == 0 {
        LogLevel::Warn
    } else {
        LogLevel::from_verbosity(cli.verbose)
    });

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(server) = cli.server {
        config.client.server = server;
    }

    // Config commands never need the daemon.
    let command = match cli.command {
        Commands::Config { command } => return cmd_config(&config, command),
        other => other,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async_main(command, config))
}

async fn async_main(command: Commands, config: Config) -> Result<()> {
    log_cli_debug!("Connecting", server = config.client.server.as_str());
    let mut client = DaemonClient::connect_to(config.client.server.as_str())
        .await
        .with_context(|| format!("Is dvaultd running at {}?", config.client.server))?
        .with_max_frame(config.daemon.max_frame);

    match command {
        Commands::Upload { local, remote } => cmd_upload(&mut client, &local, remote).await,
        Commands::Download {
            remote,
            local,
            version,
        } => {
            let bytes = sync::download_file(&mut client, &remote, version, &local).await?;
            println!("{} -> {} ({})", remote, local.display(), format_bytes(bytes));
            Ok(())
        }
        Commands::Ls { path } => {
            for entry in client.list(&path).await? {
                match entry.kind {
                    EntryKind::Directory => println!("d  {}/", entry.name),
                    EntryKind::File => println!(
                        "f  {:<32} {:>4} versions  {}",
                        entry.name,
                        entry.versions,
                        format_bytes(entry.size)
                    ),
                }
            }
            Ok(())
        }
        Commands::Versions { path } => {
            for version in client.versions(&path).await? {
                println!("{}", format_version(&version));
            }
            Ok(())
        }
        Commands::Mkdir { path } => {
            client.make_dir(&path).await?;
            println!("Created {}", path);
            Ok(())
        }
        Commands::Rm { path } => {
            let versions = client.remove(&path).await?;
            println!("Removed {} ({} versions)", path, format_number(versions as u64));
            Ok(())
        }
        Commands::DeleteVersion { path, index } => {
            client.delete_version(&path, index).await?;
            println!("Deleted version {} of {}", index, path);
            Ok(())
        }
        Commands::Status => {
            gc::print_status(&client.status().await?);
            Ok(())
        }
        Commands::Gc => gc::run(&mut client).await,
        Commands::Config { .. } => Ok(()),
    }
}

async fn cmd_upload(client: &mut DaemonClient, local: &Path, remote: Option<String>) -> Result<()> {
    let remote = match remote {
        Some(remote) => remote,
        None => match local.file_name() {
            Some(name) => format!("/{}", name.to_string_lossy()),
            None => bail!("Cannot derive a remote path from {}", local.display()),
        },
    };

    let reports = if local.is_dir() {
        sync::upload_tree(client, local, &remote).await?
    } else {
        vec![sync::upload_file(client, local, &remote).await?]
    };

    for report in &reports {
        match report.result {
            UploadResult::Unchanged => println!("=  {} (unchanged)", report.remote),
            UploadResult::Committed(c) => println!(
                "+  {} version {} as {} ({} sent raw, {} blocks matched)",
                report.remote,
                c.index,
                if c.is_script { "script" } else { "blocks" },
                format_bytes(report.stats.raw_bytes),
                format_number(report.stats.matched_blocks)
            ),
        }
    }
    Ok(())
}

fn format_version(version: &VersionInfo) -> String {
    let created = Utc
        .timestamp_opt(version.created as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| version.created.to_string());
    let hash = hash_to_hex(&version.content_hash);
    format!(
        "{:>4}  {}  {:>12}  {:<7}  chunk {:<6}  {}",
        version.index,
        created,
        format_bytes(version.size),
        if version.is_script { "script" } else { "blocks" },
        version.chunk_size,
        &hash[..16]
    )
}

fn cmd_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(path) => println!("Global:  {}", path.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: {}", Path::new(".dvault/config.toml").display());
            Ok(())
        }
        ConfigCommands::Init { global, force } => {
            let path = if global {
                Config::global_config_path().context("No home directory for the global config")?
            } else {
                PathBuf::from(".dvault/config.toml")
            };
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, Config::default_toml()?)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}
