//! Rendezvous server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the rendezvous server (directory + relay)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Address to bind the HTTP/WebSocket server to
    pub bind_address: String,

    /// Public base URL of the relay (e.g. `wss://relay.example.com`).
    ///
    /// When unset, `ws://{bound address}` is advertised.
    pub relay_url: Option<String>,

    /// How long the directory waits for a target's direct-mode answer
    #[serde(with = "duration_millis")]
    pub direct_answer_timeout: Duration,

    /// Frames a half-open relay session may buffer before it is closed
    pub relay_max_pending_frames: usize,

    /// Bytes a half-open relay session may buffer before it is closed
    pub relay_max_pending_bytes: usize,

    /// Lifetime of an unclaimed relay token, and of a retired token's tombstone
    #[serde(with = "duration_secs")]
    pub token_ttl: Duration,

    /// Interval of the relay token cleanup task
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,

    /// Keep-alive hint returned to registering peers, in seconds
    pub register_keep_alive: u32,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:21116".to_string(),
            relay_url: None,
            direct_answer_timeout: Duration::from_secs(3),
            relay_max_pending_frames: 1024,
            relay_max_pending_bytes: 4 * 1024 * 1024,
            token_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(15),
            register_keep_alive: 30,
        }
    }
}
