//! Relay token table
//!
//! Maps each relay token to its lifecycle slot. The directory reserves a
//! token when it allocates one; the first claim on a reserved token spawns
//! the bridge actor; a finished bridge leaves a tombstone so the token is
//! never served again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pt_protocol::RelayToken;
use thiserror::Error;
use tokio::time::Instant;

use super::bridge::{BridgeHandle, BridgeLimits, RelayBridge};

/// Why a claim could not be routed to a bridge
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayReject {
    /// The token was never allocated by the directory
    #[error("unknown relay token")]
    UnknownToken,

    /// The token's session already ended or expired
    #[error("relay token retired")]
    Retired,
}

#[derive(Debug)]
enum Slot {
    Reserved { at: Instant },
    Active { bridge: BridgeHandle },
    Retired { at: Instant },
}

/// Table of relay tokens and their bridges
pub struct RelayHub {
    slots: DashMap<RelayToken, Slot>,
    limits: BridgeLimits,
}

impl RelayHub {
    /// Create an empty hub
    pub fn new(limits: BridgeLimits) -> Self {
        Self {
            slots: DashMap::new(),
            limits,
        }
    }

    /// Reserve a freshly allocated token
    pub fn reserve(&self, token: RelayToken) {
        self.slots.insert(token, Slot::Reserved { at: Instant::now() });
    }

    /// Bridge serving `token`, spawning it on the first claim
    pub fn bridge_for(self: &Arc<Self>, token: RelayToken) -> Result<BridgeHandle, RelayReject> {
        let mut slot = match self.slots.entry(token) {
            Entry::Occupied(slot) => slot,
            Entry::Vacant(_) => return Err(RelayReject::UnknownToken),
        };

        match slot.get() {
            Slot::Active { bridge } if !bridge.is_closed() => return Ok(bridge.clone()),
            Slot::Active { .. } | Slot::Retired { .. } => return Err(RelayReject::Retired),
            Slot::Reserved { .. } => {}
        }

        let (bridge, handle) = RelayBridge::new(format!("{:?}", token), self.limits);
        slot.insert(Slot::Active {
            bridge: handle.clone(),
        });

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            bridge.run().await;
            hub.retire(token);
        });

        Ok(handle)
    }

    /// Mark a token as finished
    pub fn retire(&self, token: RelayToken) {
        self.slots.insert(token, Slot::Retired { at: Instant::now() });
    }

    /// Retire reservations older than `ttl` and forget tombstones older than `ttl`.
    ///
    /// Returns `(expired, forgotten)`.
    pub fn expire(&self, ttl: Duration) -> (usize, usize) {
        let now = Instant::now();
        let mut expired = 0;
        let mut forgotten = 0;

        self.slots.retain(|_, slot| match slot {
            Slot::Reserved { at } if now.duration_since(*at) >= ttl => {
                *slot = Slot::Retired { at: now };
                expired += 1;
                true
            }
            Slot::Retired { at } if now.duration_since(*at) >= ttl => {
                forgotten += 1;
                false
            }
            _ => true,
        });

        (expired, forgotten)
    }

    /// Number of bridges currently running
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Active { .. }))
            .count()
    }

    /// Number of tokens tracked in any state
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no tokens are tracked
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
