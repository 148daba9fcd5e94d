//! Peer registry owned by the directory actor

use std::collections::HashMap;

use bytes::Bytes;
use tokio::time::Instant;

use crate::conn::{ConnHandle, ConnId};

/// A registered peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// The peer's live rendezvous connection
    pub conn: ConnHandle,
    /// Opaque routing token supplied at registration
    pub uuid: Bytes,
    /// When this registration happened
    pub registered_at: Instant,
}

/// Mapping peer ID → record. Not shared; the directory actor owns it.
#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<String, PeerRecord>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` on `conn`. The last registration wins; the replaced
    /// record is returned.
    pub fn register(&mut self, id: String, conn: ConnHandle, uuid: Bytes) -> Option<PeerRecord> {
        let record = PeerRecord {
            conn,
            uuid,
            registered_at: Instant::now(),
        };
        self.peers.insert(id, record)
    }

    /// Remove every record owned by `conn`, returning the evicted entries.
    ///
    /// Records that were re-registered on another connection are kept.
    pub fn evict_conn(&mut self, conn: ConnId) -> Vec<(String, PeerRecord)> {
        let owned: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, record)| record.conn.id() == conn)
            .map(|(id, _)| id.clone())
            .collect();
        owned
            .into_iter()
            .filter_map(|id| self.peers.remove(&id).map(|record| (id, record)))
            .collect()
    }

    /// Look up a peer
    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// One flag per input ID, in input order, true iff registered
    pub fn query_presence(&self, ids: &[String]) -> Vec<bool> {
        ids.iter().map(|id| self.peers.contains_key(id)).collect()
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are registered
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
