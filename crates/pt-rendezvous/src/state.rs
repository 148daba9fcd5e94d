//! Shared state of the rendezvous server

use std::sync::Arc;

use pt_core::config::RendezvousConfig;
use tokio_util::sync::CancellationToken;

use crate::directory::{Directory, DirectoryHandle, DirectorySettings};
use crate::relay::{BridgeLimits, RelayHub};

/// State shared by every connection handler
pub struct RendezvousState {
    /// Configuration
    pub config: RendezvousConfig,
    /// Relay base URL advertised in grants
    pub relay_base: String,
    /// Directory actor
    pub directory: DirectoryHandle,
    /// Relay token table
    pub hub: Arc<RelayHub>,
    /// Cancelled on shutdown
    pub shutdown: CancellationToken,
}

impl RendezvousState {
    /// Create the state and spawn the directory actor
    pub fn new(config: RendezvousConfig, relay_base: String, shutdown: CancellationToken) -> Self {
        let hub = Arc::new(RelayHub::new(BridgeLimits {
            max_frames: config.relay_max_pending_frames,
            max_bytes: config.relay_max_pending_bytes,
        }));

        let directory = Directory::spawn(
            Arc::clone(&hub),
            DirectorySettings {
                relay_base: relay_base.clone(),
                direct_answer_timeout: config.direct_answer_timeout,
                keep_alive: config.register_keep_alive,
            },
        );

        Self {
            config,
            relay_base,
            directory,
            hub,
            shutdown,
        }
    }
}
