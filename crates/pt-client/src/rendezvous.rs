//! Client side of the rendezvous directory
//!
//! Wraps a [`WebSocketTransport`] to `/rendezvous` with request/response
//! helpers. A terminal client opens one per punch-hole request; a
//! long-lived peer keeps one open and reads claim instructions from it.

use std::time::Duration;

use bytes::Bytes;

use pt_core::{SessionError, Transport, TransportError, TransportKind};
use pt_protocol::{
    ConnType, OnlineRequest, PresenceBits, PunchHoleFailure, PunchHoleRequest, PunchHoleResponse,
    RegisterPeer, RegisterPeerResponse, RelayGrant, RendezvousMessage, WireMessage,
};

use crate::transport::WebSocketTransport;

/// Connection to the rendezvous directory
pub struct RendezvousClient {
    transport: WebSocketTransport,
    request_timeout: Duration,
}

impl RendezvousClient {
    /// Connect to the directory at `url`
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, SessionError> {
        let transport = WebSocketTransport::connect(url, TransportKind::Relay).await?;
        Ok(Self {
            transport,
            request_timeout,
        })
    }

    /// Send one message
    pub async fn send(&mut self, message: RendezvousMessage) -> Result<(), SessionError> {
        let frame = message.encode()?;
        self.transport.send(frame).await?;
        Ok(())
    }

    /// Next message from the directory; `None` when it closed the connection
    pub async fn recv(&mut self) -> Result<Option<RendezvousMessage>, SessionError> {
        match self.transport.recv().await? {
            Some(frame) => Ok(Some(RendezvousMessage::decode(&frame)?)),
            None => Ok(None),
        }
    }

    /// Next message within the request deadline
    async fn recv_reply(&mut self, what: &'static str) -> Result<RendezvousMessage, SessionError> {
        match tokio::time::timeout(self.request_timeout, self.recv()).await {
            Ok(Ok(Some(message))) => Ok(message),
            Ok(Ok(None)) => Err(TransportError::Closed("directory closed the connection".into()).into()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Timeout(what)),
        }
    }

    /// Register as `id`
    pub async fn register(&mut self, id: &str, uuid: Bytes) -> Result<RegisterPeerResponse, SessionError> {
        self.send(RendezvousMessage::RegisterPeer(RegisterPeer {
            id: id.to_string(),
            uuid,
        }))
        .await?;

        loop {
            match self.recv_reply("registration response").await? {
                RendezvousMessage::RegisterPeerResponse(response) => return Ok(response),
                other => tracing::debug!("Ignoring {} while registering", other.kind()),
            }
        }
    }

    /// Presence of `peers`, in input order
    pub async fn query_presence(&mut self, my_id: &str, peers: &[String]) -> Result<Vec<bool>, SessionError> {
        self.send(RendezvousMessage::OnlineRequest(OnlineRequest {
            id: my_id.to_string(),
            peers: peers.to_vec(),
        }))
        .await?;

        loop {
            match self.recv_reply("presence response").await? {
                RendezvousMessage::OnlineResponse(response) => {
                    return Ok(PresenceBits::unpack(&response.states, peers.len()))
                }
                other => tracing::debug!("Ignoring {} while querying presence", other.kind()),
            }
        }
    }

    /// Ask the directory to connect us to `target`.
    ///
    /// One round trip; failures are terminal for this attempt.
    pub async fn punch_hole(&mut self, target: &str, offer: Option<String>) -> Result<RelayGrant, SessionError> {
        self.send(RendezvousMessage::PunchHoleRequest(PunchHoleRequest {
            id: target.to_string(),
            conn_type: ConnType::Terminal,
            offer,
        }))
        .await?;

        loop {
            match self.recv_reply("punch hole response").await? {
                RendezvousMessage::PunchHoleResponse(PunchHoleResponse::Relay(grant)) => {
                    return Ok(grant)
                }
                RendezvousMessage::PunchHoleResponse(PunchHoleResponse::Failure { failure, message }) => {
                    return Err(match failure {
                        PunchHoleFailure::TargetNotOnline => SessionError::NotFound(target.to_string()),
                        PunchHoleFailure::InvalidRequest | PunchHoleFailure::Other => {
                            SessionError::PunchHoleFailed(message)
                        }
                    })
                }
                other => tracing::debug!("Ignoring {} while punching hole", other.kind()),
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) {
        self.transport.close("done").await;
    }
}
