//! Peer-to-peer data channel transport
//!
//! A reliable, ordered, message-preserving channel. The ICE/DTLS stack that
//! carries it feeds inbound messages into an mpsc queue and drains outbound
//! ones from another; this type is the session-facing end of those queues.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use pt_core::{Transport, TransportError, TransportKind};

/// Default queue depth for [`DataChannelTransport::pair`]
pub const DATA_CHANNEL_QUEUE: usize = 256;

/// Item carried on a data channel queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One message
    Message(Bytes),
    /// The far side closed, with its reason
    Closed(String),
}

/// Session-facing end of a data channel
pub struct DataChannelTransport {
    outbound: Option<mpsc::Sender<ChannelEvent>>,
    inbound: mpsc::Receiver<ChannelEvent>,
    closed: bool,
}

impl DataChannelTransport {
    /// Wrap the queues of an established data channel
    pub fn new(outbound: mpsc::Sender<ChannelEvent>, inbound: mpsc::Receiver<ChannelEvent>) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            closed: false,
        }
    }

    /// Two connected ends, as if joined by a loss-free data channel
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(DATA_CHANNEL_QUEUE);
        let (b_tx, b_rx) = mpsc::channel(DATA_CHANNEL_QUEUE);
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }
}

#[async_trait]
impl Transport for DataChannelTransport {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| TransportError::Closed("data channel closed".to_string()))?;

        outbound
            .send(ChannelEvent::Message(message))
            .await
            .map_err(|_| TransportError::Closed("data channel closed".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(ChannelEvent::Message(message)) => Ok(Some(message)),
            Some(ChannelEvent::Closed(reason)) => {
                self.closed = true;
                if reason.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::Closed(reason))
                }
            }
            None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    async fn close(&mut self, reason: &str) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(ChannelEvent::Closed(reason.to_string())).await;
        }
        self.closed = true;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_preserves_order() {
        let (mut a, mut b) = DataChannelTransport::pair();
        for chunk in ["one", "two", "three"] {
            a.send(Bytes::from(chunk)).await.unwrap();
        }
        assert_eq!(b.recv().await.unwrap().unwrap(), "one");
        assert_eq!(b.recv().await.unwrap().unwrap(), "two");
        assert_eq!(b.recv().await.unwrap().unwrap(), "three");
        assert_eq!(a.kind(), TransportKind::Direct);
    }

    #[tokio::test]
    async fn test_close_carries_reason() {
        let (mut a, mut b) = DataChannelTransport::pair();
        a.close("bye").await;
        a.close("again").await;

        assert_eq!(
            b.recv().await,
            Err(TransportError::Closed("bye".to_string()))
        );
        assert_eq!(b.recv().await, Ok(None));
        assert!(a.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_peer_reads_as_clean_close() {
        let (a, mut b) = DataChannelTransport::pair();
        drop(a);
        assert_eq!(b.recv().await, Ok(None));
    }
}
