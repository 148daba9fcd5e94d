//! Relay token type

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Length of a relay token in bytes (before hex encoding)
pub const RELAY_TOKEN_BYTES: usize = 16;

/// Unguessable identifier naming one relay bridge and the two connections it pairs
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayToken([u8; RELAY_TOKEN_BYTES]);

impl RelayToken {
    /// Generate a fresh token from the thread-local CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; RELAY_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a token from raw bytes
    pub fn from_bytes(bytes: [u8; RELAY_TOKEN_BYTES]) -> Self {
        Self(bytes)
    }

    /// Get the raw token bytes
    pub fn as_bytes(&self) -> &[u8; RELAY_TOKEN_BYTES] {
        &self.0
    }

    /// URL of this token's relay bridge under a relay base URL
    pub fn relay_url(&self, relay_base: &str) -> String {
        format!("{}/relay/{}", relay_base.trim_end_matches('/'), self)
    }
}

impl fmt::Display for RelayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// Tokens are bearer credentials for the relay; keep them out of debug logs.
impl fmt::Debug for RelayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayToken({}..)", &hex::encode(&self.0[..3]))
    }
}

impl FromStr for RelayToken {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; RELAY_TOKEN_BYTES];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| ProtocolError::InvalidToken(s.to_string()))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_display_parse() {
        let token = RelayToken::generate();
        let text = token.to_string();
        assert_eq!(text.len(), RELAY_TOKEN_BYTES * 2);
        assert_eq!(text.parse::<RelayToken>().unwrap(), token);
    }

    #[test]
    fn test_tokens_are_distinct() {
        let a = RelayToken::generate();
        let b = RelayToken::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_token_rejected() {
        assert!("not-hex".parse::<RelayToken>().is_err());
        assert!("abcd".parse::<RelayToken>().is_err());
    }

    #[test]
    fn test_debug_hides_token() {
        let token = RelayToken::from_bytes([0xAB; RELAY_TOKEN_BYTES]);
        let debug = format!("{:?}", token);
        assert_eq!(debug, "RelayToken(ababab..)");
    }

    #[test]
    fn test_relay_url() {
        let token = RelayToken::from_bytes([0xAB; RELAY_TOKEN_BYTES]);
        let expected = format!("ws://relay:21116/relay/{}", "ab".repeat(RELAY_TOKEN_BYTES));
        assert_eq!(token.relay_url("ws://relay:21116/"), expected);
        assert_eq!(token.relay_url("ws://relay:21116"), expected);
    }
}
