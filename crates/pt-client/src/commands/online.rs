//! Online command implementation

use anyhow::Result;

use pt_core::config::ClientConfig;

use crate::output::{format_presence, print_error};
use crate::rendezvous::RendezvousClient;

/// Execute the online command - show which peers are registered
pub async fn online_command(config: &ClientConfig, peers: &[String]) -> Result<()> {
    let mut rendezvous =
        match RendezvousClient::connect(&config.rendezvous_url, config.request_timeout).await {
            Ok(client) => client,
            Err(e) => {
                print_error(&format!("Failed to reach {}: {}", config.rendezvous_url, e));
                return Err(e.into());
            }
        };

    let online = rendezvous.query_presence(&config.my_id, peers).await;
    rendezvous.close().await;

    let online = match online {
        Ok(online) => online,
        Err(e) => {
            print_error(&format!("Presence query failed: {}", e));
            return Err(e.into());
        }
    };

    println!("{}", format_presence(peers, &online));
    Ok(())
}
