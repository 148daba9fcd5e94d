//! Encode/decode contract shared by both message families

use bytes::Bytes;

use crate::error::ProtocolError;

/// A closed tagged union that travels as one envelope on the wire.
///
/// Decoding maps the tag byte to exactly one variant; an unrecognized tag or
/// a body that does not match it is a [`ProtocolError`], never a panic.
pub trait WireMessage: Sized {
    /// Family name used in error messages and logs
    const FAMILY: &'static str;

    /// Tag byte of this message's variant
    fn tag(&self) -> u8;

    /// Encode into a single envelope
    fn encode(&self) -> Result<Bytes, ProtocolError>;

    /// Decode a single envelope
    fn decode(src: &[u8]) -> Result<Self, ProtocolError>;
}
