//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Message was empty (no tag byte)
    #[error("Empty message")]
    EmptyMessage,

    /// Unknown message tag for this family
    #[error("Unknown {family} message type: {tag:#04x}")]
    UnknownMessageType { family: &'static str, tag: u8 },

    /// Received envelope exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Body did not match the tag (truncated or corrupt)
    #[error("Malformed {family} message body: {source}")]
    MalformedBody {
        family: &'static str,
        #[source]
        source: bincode::Error,
    },

    /// A body could not be encoded, including bodies over the size limit
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Relay token was not 32 hex characters
    #[error("Invalid relay token: {0}")]
    InvalidToken(String),
}
