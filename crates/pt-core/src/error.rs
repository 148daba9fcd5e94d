//! Core error types for peerterm

use pt_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the peerterm ecosystem
#[derive(Error, Debug)]
pub enum PtError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a duplex byte transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish the underlying connection
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The connection was closed
    #[error("Connection closed: {0}")]
    Closed(String),

    /// A send failed
    #[error("Send failed: {0}")]
    Send(String),

    /// A receive failed
    #[error("Receive failed: {0}")]
    Receive(String),
}

/// Session-level errors surfaced to the caller of `open`, `send` and `close`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Malformed wire message from the peer or the directory
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// An outgoing message could not be encoded
    #[error("Protocol encode error: {0}")]
    ProtocolEncode(String),

    /// Target peer is not registered
    #[error("Peer not online: {0}")]
    NotFound(String),

    /// No response within the deadline
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Challenge rejected or repeated
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Underlying connection dropped or reset
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A newer open preempted this session
    #[error("Session superseded")]
    Superseded,

    /// Another open is already negotiating
    #[error("An open is already in progress")]
    OpenInProgress,

    /// The session was closed while an operation was pending
    #[error("Cancelled")]
    Cancelled,

    /// The directory rejected the punch-hole request
    #[error("Punch hole failed: {0}")]
    PunchHoleFailed(String),

    /// The session is not open
    #[error("Session is not open")]
    NotOpen,
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Serialization(_) => SessionError::ProtocolEncode(err.to_string()),
            _ => SessionError::ProtocolDecode(err.to_string()),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_maps_to_decode() {
        let err: SessionError = ProtocolError::EmptyMessage.into();
        assert!(matches!(err, SessionError::ProtocolDecode(_)));
    }

    #[test]
    fn test_oversized_outgoing_message_maps_to_encode() {
        let big = vec![0u8; pt_protocol::MAX_MESSAGE_SIZE];
        let err = pt_protocol::frame::encode_envelope(0x01, &big).unwrap_err();
        assert!(matches!(
            SessionError::from(err),
            SessionError::ProtocolEncode(_)
        ));
    }

    #[test]
    fn test_transport_error_wraps() {
        let err: SessionError = TransportError::Closed("peer closed".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Transport error: Connection closed: peer closed"
        );
    }
}
