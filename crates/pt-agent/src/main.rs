//! peerterm agent
//!
//! Registers this machine with a rendezvous server and serves a shell to
//! clients that connect to its peer ID.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pt_agent::{Agent, PtyBackend};
use pt_core::config::{self, AgentConfig};
use pt_core::PeerId;

#[derive(Parser)]
#[command(name = "pt-agent")]
#[command(about = "peerterm agent - serve this machine's terminal through a rendezvous server")]
#[command(version)]
struct Args {
    /// Rendezvous URL, e.g. ws://rendezvous.example.com:21116/rendezvous
    #[arg(short, long, env = "PEERTERM_RENDEZVOUS")]
    rendezvous: Option<String>,

    /// Peer ID to register under (defaults to the hostname)
    #[arg(long)]
    id: Option<String>,

    /// Password clients must present (overrides config)
    #[arg(long, env = "PEERTERM_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Shell to serve (overrides config)
    #[arg(long)]
    shell: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("peerterm agent starting...");

    let mut config: AgentConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path("agent.toml");
        config::load_or_default(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            AgentConfig::default()
        })
    };

    if let Some(url) = args.rendezvous {
        config.rendezvous_url = url;
    }
    if let Some(id) = args.id {
        config.peer_id = id;
    }
    if let Some(password) = args.password {
        config.password = Some(password);
    }
    if let Some(shell) = args.shell {
        config.default_shell = Some(shell);
    }

    if !PeerId::is_valid(&config.peer_id) {
        anyhow::bail!(
            "Invalid peer ID '{}': use 1-64 letters, digits, '-', '_' or '.'",
            config.peer_id
        );
    }
    if config.password.is_none() {
        tracing::warn!("No password configured; anyone who knows the peer ID can log in");
    }

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }

        cancel_clone.cancel();
    });

    tracing::info!(
        "Serving as {} via {}",
        config.peer_id,
        config.rendezvous_url
    );

    let backend = Arc::new(PtyBackend::new(
        config.default_shell.clone(),
        config.default_env.clone(),
    ));
    Agent::new(config, backend)
        .run(cancel)
        .await
        .context("Agent stopped")?;

    tracing::info!("Agent shutdown complete");
    Ok(())
}
