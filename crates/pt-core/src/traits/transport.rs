//! Transport trait

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::error::TransportError;

/// Which kind of path a transport runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// WebSocket to the relay bridge
    Relay,
    /// Peer-to-peer data channel
    Direct,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Relay => write!(f, "relay"),
            TransportKind::Direct => write!(f, "direct"),
        }
    }
}

/// Duplex, message-preserving byte channel.
///
/// Each `send` delivers exactly one message to the other side's `recv`, in
/// order. The session layer is written against this trait only, so it does
/// not know whether it is relayed or direct.
#[async_trait]
pub trait Transport: Send {
    /// Send one message
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError>;

    /// Receive the next message; `Ok(None)` when the other side closed cleanly.
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Close the transport. Closing twice is a no-op.
    async fn close(&mut self, reason: &str);

    /// Kind of this transport
    fn kind(&self) -> TransportKind;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        (**self).recv().await
    }

    async fn close(&mut self, reason: &str) {
        (**self).close(reason).await
    }

    fn kind(&self) -> TransportKind {
        (**self).kind()
    }
}
