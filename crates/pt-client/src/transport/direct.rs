//! Offer/answer seam for peer-to-peer data channels
//!
//! A [`DirectConnector`] wraps whatever ICE stack is available. The session
//! asks it for an offer before the punch-hole request and, if the target
//! answers, hands the answer back to complete the channel. Every step is
//! bounded by a deadline; any failure means the relay is used instead.

use std::time::Duration;

use async_trait::async_trait;

use pt_core::config::IceServer;
use pt_core::{Transport, TransportError};

/// Starts peer-to-peer negotiations
#[async_trait]
pub trait DirectConnector: Send + Sync {
    /// Create a local offer and start candidate gathering
    async fn create_offer(
        &self,
        ice_server: Option<&IceServer>,
    ) -> Result<Box<dyn PendingOffer>, TransportError>;
}

/// A local offer waiting for its answer
#[async_trait]
pub trait PendingOffer: Send {
    /// Wait until candidate gathering is complete.
    ///
    /// Gathering may never signal completion; callers bound this with a timer.
    async fn gathering_complete(&mut self);

    /// Local description with whatever candidates were gathered so far
    async fn local_description(&self) -> Option<String>;

    /// Apply the remote answer and wait for the channel to open
    async fn accept(self: Box<Self>, answer: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Create an offer and wait up to `gather_timeout` for gathering.
///
/// Returns the encoded offer and the handle to complete it with, or `None`
/// when no offer could be created.
pub async fn gather_offer(
    connector: &dyn DirectConnector,
    ice_server: Option<&IceServer>,
    gather_timeout: Duration,
) -> Option<(String, Box<dyn PendingOffer>)> {
    let mut pending = match connector.create_offer(ice_server).await {
        Ok(pending) => pending,
        Err(e) => {
            tracing::warn!("Could not create direct offer, using relay: {}", e);
            return None;
        }
    };

    if tokio::time::timeout(gather_timeout, pending.gathering_complete())
        .await
        .is_err()
    {
        tracing::debug!(
            "Candidate gathering still running after {:?}, sending partial offer",
            gather_timeout
        );
    }

    match pending.local_description().await {
        Some(offer) => Some((offer, pending)),
        None => {
            tracing::warn!("Direct offer has no local description, using relay");
            None
        }
    }
}

/// Complete a direct channel within `connect_timeout`, or `None` to fall back.
pub async fn complete_direct(
    pending: Box<dyn PendingOffer>,
    answer: &str,
    connect_timeout: Duration,
) -> Option<Box<dyn Transport>> {
    match tokio::time::timeout(connect_timeout, pending.accept(answer)).await {
        Ok(Ok(transport)) => Some(transport),
        Ok(Err(e)) => {
            tracing::warn!("Direct connection failed, using relay: {}", e);
            None
        }
        Err(_) => {
            tracing::warn!(
                "Direct connection not open after {:?}, using relay",
                connect_timeout
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DataChannelTransport;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct StallingOffer {
        gathered: Arc<AtomicBool>,
        connect: bool,
    }

    #[async_trait]
    impl PendingOffer for StallingOffer {
        async fn gathering_complete(&mut self) {
            std::future::pending::<()>().await
        }

        async fn local_description(&self) -> Option<String> {
            self.gathered.store(true, Ordering::SeqCst);
            Some("partial-offer".to_string())
        }

        async fn accept(
            self: Box<Self>,
            answer: &str,
        ) -> Result<Box<dyn Transport>, TransportError> {
            if !self.connect {
                std::future::pending::<()>().await;
            }
            if answer != "answer" {
                return Err(TransportError::ConnectFailed("bad answer".to_string()));
            }
            let (local, _remote) = DataChannelTransport::pair();
            Ok(Box::new(local))
        }
    }

    struct Connector {
        gathered: Arc<AtomicBool>,
        connect: bool,
    }

    #[async_trait]
    impl DirectConnector for Connector {
        async fn create_offer(
            &self,
            _ice_server: Option<&IceServer>,
        ) -> Result<Box<dyn PendingOffer>, TransportError> {
            Ok(Box::new(StallingOffer {
                gathered: Arc::clone(&self.gathered),
                connect: self.connect,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_is_bounded() {
        let connector = Connector {
            gathered: Arc::new(AtomicBool::new(false)),
            connect: true,
        };

        let (offer, _pending) = gather_offer(&connector, None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(offer, "partial-offer");
        assert!(connector.gathered.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_falls_back() {
        let connector = Connector {
            gathered: Arc::new(AtomicBool::new(false)),
            connect: false,
        };
        let (_, pending) = gather_offer(&connector, None, Duration::from_millis(10))
            .await
            .unwrap();

        assert!(complete_direct(pending, "answer", Duration::from_secs(5))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_rejected_answer_falls_back() {
        let connector = Connector {
            gathered: Arc::new(AtomicBool::new(false)),
            connect: true,
        };
        let (_, pending) = gather_offer(&connector, None, Duration::from_millis(10))
            .await
            .unwrap();

        assert!(complete_direct(pending, "garbage", Duration::from_secs(1))
            .await
            .is_none());
    }
}
