//! Message envelope encoding/decoding
//!
//! Every transport message (one WebSocket binary message, one data-channel
//! message) carries exactly one protocol message:
//! - tag: 1 byte (u8), selects the variant within its message family
//! - body: bincode-encoded payload of that variant
//!
//! The transports already preserve message boundaries, so no length prefix
//! is carried.

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

/// Size of the envelope tag in bytes
pub const TAG_SIZE: usize = 1;

/// Maximum encoded message size (tag + body)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Bodies are capped so that tag + body never exceeds `MAX_MESSAGE_SIZE`
fn body_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit((MAX_MESSAGE_SIZE - TAG_SIZE) as u64)
}

/// Encode a tagged message body into a single envelope.
///
/// A body over the size limit fails with [`ProtocolError::Serialization`].
pub fn encode_envelope<T: Serialize>(tag: u8, body: &T) -> Result<Bytes, ProtocolError> {
    let payload = body_options().serialize(body)?;
    let size = TAG_SIZE + payload.len();

    let mut dst = BytesMut::with_capacity(size);
    dst.put_u8(tag);
    dst.extend_from_slice(&payload);
    Ok(dst.freeze())
}

/// Split an envelope into its tag and body
pub fn split_envelope(src: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if src.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: src.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    match src.split_first() {
        Some((tag, body)) => Ok((*tag, body)),
        None => Err(ProtocolError::EmptyMessage),
    }
}

/// Decode a variant body, attributing failures to the message family
pub fn decode_body<T: DeserializeOwned>(
    family: &'static str,
    body: &[u8],
) -> Result<T, ProtocolError> {
    body_options()
        .deserialize(body)
        .map_err(|source| ProtocolError::MalformedBody { family, source })
}
