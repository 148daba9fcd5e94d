//! peerterm CLI
//!
//! Open a remote terminal on a peer behind NAT:
//! - `connect <peer>`: interactive session (Ctrl+] detaches)
//! - `online <peer>...`: presence query
//! - `config ...`: manage the client configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pt_client::commands;
use pt_client::commands::CLIENT_CONFIG_FILE;
use pt_core::config::{self, ClientConfig};

#[derive(Parser)]
#[command(name = "peerterm")]
#[command(author, version, about = "Remote terminal to peers behind NAT")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Rendezvous URL (overrides config)
    #[arg(short, long, global = true, env = "PEERTERM_RENDEZVOUS")]
    rendezvous: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a terminal on a peer and attach
    Connect {
        /// Peer ID to connect to
        peer: String,
        /// Never attempt a peer-to-peer channel
        #[arg(long)]
        relay_only: bool,
    },

    /// Show which peers are online
    Online {
        /// Peer IDs to check
        #[arg(required = true)]
        peers: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get specific config value
    Get { key: String },
    /// Set config value
    Set { key: String, value: String },
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    // stdout belongs to the remote terminal
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_path(CLIENT_CONFIG_FILE));

    match cli.command {
        Commands::Connect { peer, relay_only } => {
            let mut client_config = load_client_config(&config_path, cli.rendezvous)?;
            client_config.relay_only |= relay_only;
            commands::connect_command(client_config, &peer).await?;
        }

        Commands::Online { peers } => {
            let client_config = load_client_config(&config_path, cli.rendezvous)?;
            commands::online_command(&client_config, &peers).await?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(Some(&config_path))?,
            ConfigAction::Get { key } => commands::config_get(Some(&config_path), &key)?,
            ConfigAction::Set { key, value } => {
                commands::config_set(Some(&config_path), &key, &value)?
            }
            ConfigAction::Init { force } => commands::config_init(Some(&config_path), force)?,
            ConfigAction::Path => println!("{}", config_path.display()),
        },
    }

    Ok(())
}

fn load_client_config(path: &std::path::Path, rendezvous: Option<String>) -> Result<ClientConfig> {
    let mut client_config: ClientConfig = config::load_or_default(path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    if let Some(url) = rendezvous {
        client_config.rendezvous_url = url;
    }
    client_config
        .validate()
        .with_context(|| format!("Invalid config in {:?}", path))?;
    Ok(client_config)
}
