//! Callbacks a session reports to

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use pt_core::{SessionError, TransportKind};
use pt_protocol::PeerInfo;

/// Why an open session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    Local,
    /// The peer or the relay ended the session
    Remote(String),
    /// The session failed, or a newer `open()` superseded it
    Failed(SessionError),
}

impl CloseReason {
    /// Whether this should be shown to the user as an error
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            CloseReason::Local | CloseReason::Failed(SessionError::Superseded)
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed"),
            CloseReason::Remote(reason) => write!(f, "{}", reason),
            CloseReason::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Receives terminal output and lifecycle events.
///
/// Called from the session's driver task; implementations must not block.
pub trait SessionHandler: Send + Sync {
    /// Decoded terminal output, in arrival order
    fn on_output(&self, data: Bytes);

    /// The session reached `Open`
    fn on_open(&self, _peer: &PeerInfo, _transport: TransportKind) {}

    /// The session ended. Called exactly once per session that reached `Open`.
    fn on_close(&self, reason: CloseReason);
}

/// Supplies the password when the target issues a login challenge
#[async_trait]
pub trait PasswordProvider: Send + Sync {
    /// Ask for the password; `None` gives up the login
    async fn password(&self, prompt: &str) -> Option<String>;
}

/// Fixed password, for non-interactive use
#[async_trait]
impl PasswordProvider for String {
    async fn password(&self, _prompt: &str) -> Option<String> {
        Some(self.clone())
    }
}
