//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a peer ID
pub const MAX_PEER_ID_LEN: usize = 64;

/// Name under which a peer registers with the directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Parse a peer ID, returning `None` when it is malformed.
    ///
    /// A valid ID is 1..=64 characters of ASCII alphanumerics, `-`, `_` or `.`.
    pub fn parse(id: &str) -> Option<Self> {
        if Self::is_valid(id) {
            Some(Self(id.to_string()))
        } else {
            None
        }
    }

    /// Check whether a string is a well-formed peer ID
    pub fn is_valid(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= MAX_PEER_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Nonce identifying one open attempt of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionNonce(pub u64);

impl SessionNonce {
    /// Generate a random nonce
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SessionNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Local username, hostname and platform reported on login
pub fn local_identity() -> (String, String, String) {
    (
        whoami::username(),
        gethostname::gethostname().to_string_lossy().into_owned(),
        std::env::consts::OS.to_string(),
    )
}
