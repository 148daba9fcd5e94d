//! Connect command implementation

use std::sync::Arc;

use anyhow::Result;

use pt_core::config::ClientConfig;
use pt_protocol::TerminalSize;

use crate::output::{print_error, print_info, print_success, print_warning};
use crate::session::TerminalClient;
use crate::terminal::{run_interactive, PromptPassword, StdoutSink};
use crate::transport::{RtcConnector, RtcSettings};

/// Execute the connect command - open a terminal on `peer` and attach
pub async fn connect_command(config: ClientConfig, peer: &str) -> Result<()> {
    print_info(&format!("Connecting to '{}'...", peer));

    let connector = config
        .direct_enabled()
        .then(|| RtcConnector::new(RtcSettings::with_stun(config.stun_urls.clone())));

    let (sink, closed) = StdoutSink::new();
    let mut client = TerminalClient::new(config, Arc::new(sink), Arc::new(PromptPassword));
    if let Some(connector) = connector {
        client = client.with_direct_connector(Arc::new(connector));
    }
    let client = Arc::new(client);

    let size = crossterm::terminal::size()
        .map(|(cols, rows)| TerminalSize::new(rows, cols))
        .unwrap_or_default();

    let info = match client.open(peer, size).await {
        Ok(info) => info,
        Err(e) => {
            print_error(&format!("Failed to connect to '{}': {}", peer, e));
            return Err(e.into());
        }
    };

    print_success(&format!(
        "Connected to {}@{} ({})",
        info.username, info.hostname, info.platform
    ));
    print_info("Press Ctrl+] to detach");

    match run_interactive(client, closed).await? {
        None => print_success("Detached from session"),
        Some(reason) if reason.is_error() => print_warning(&format!("Session ended: {}", reason)),
        Some(reason) => print_info(&format!("Session ended: {}", reason)),
    }

    Ok(())
}
