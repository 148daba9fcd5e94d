//! Relay: token table, per-token bridge actors, and token expiry

mod bridge;
mod cleanup;
mod hub;

pub use bridge::{
    BridgeCommand, BridgeGone, BridgeHandle, BridgeLimits, RelayBridge, REASON_ALREADY_PAIRED,
    REASON_BUFFER_OVERFLOW, REASON_PEER_CLOSED, REASON_SESSION_CLOSED,
};
pub use cleanup::run_token_cleanup;
pub use hub::{RelayHub, RelayReject};
