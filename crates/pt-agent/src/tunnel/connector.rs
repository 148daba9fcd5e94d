//! Outbound link to the rendezvous directory
//!
//! The agent keeps one registered WebSocket to `/rendezvous` open and reads
//! claim instructions from it. Each instruction names a relay token the
//! agent should claim to meet a client.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use pt_client::RendezvousClient;
use pt_core::auth::random_bytes;
use pt_core::config::AgentConfig;
use pt_core::SessionError;
use pt_protocol::{RelayResponse, RendezvousMessage, RequestRelay};

use super::reconnect::ExponentialBackoff;

/// Length of the per-process registration UUID
const UUID_BYTES: usize = 16;

/// Why the directory link could not be established
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The directory refused the registration; retrying will not help
    #[error("Registration rejected: {0}")]
    Rejected(String),

    /// Connecting or registering timed out
    #[error("Timed out connecting to {0}")]
    Timeout(String),

    /// Any other transport or protocol failure
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Registers with the directory, retrying with backoff
pub struct TunnelConnector {
    config: AgentConfig,
    uuid: Bytes,
}

impl TunnelConnector {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            uuid: random_bytes(UUID_BYTES),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connect and register, sleeping between failed attempts.
    ///
    /// Only a rejected registration is returned as an error; transport
    /// failures are retried indefinitely.
    pub async fn connect_with_retry(
        &self,
        backoff: &mut ExponentialBackoff,
    ) -> Result<ActiveTunnel, ConnectionError> {
        loop {
            match self.try_connect().await {
                Ok(tunnel) => {
                    tracing::info!(
                        "Registered as {} at {}",
                        self.config.peer_id,
                        self.config.rendezvous_url
                    );
                    backoff.reset();
                    return Ok(tunnel);
                }
                Err(ConnectionError::Rejected(reason)) => {
                    tracing::error!("Directory rejected registration: {}", reason);
                    return Err(ConnectionError::Rejected(reason));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<ActiveTunnel, ConnectionError> {
        let url = &self.config.rendezvous_url;
        let timeout = self.config.connect_timeout;

        tracing::debug!("Connecting to {}", url);
        let attempt = async {
            let mut rendezvous = RendezvousClient::connect(url, timeout).await?;
            let response = rendezvous
                .register(&self.config.peer_id, self.uuid.clone())
                .await?;
            Ok::<_, SessionError>((rendezvous, response))
        };

        let (rendezvous, response) = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ConnectionError::Timeout(url.clone()))??;

        if !response.accepted {
            rendezvous.close().await;
            return Err(ConnectionError::Rejected(
                response.reason.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        Ok(ActiveTunnel {
            rendezvous,
            keep_alive: Duration::from_secs(u64::from(response.keep_alive)),
        })
    }
}

/// Events read from a registered directory link
#[derive(Debug)]
pub enum TunnelEvent {
    /// A client asked for us; claim the token to meet it
    Claim(RequestRelay),
    /// The link is gone and must be re-established
    Disconnected(String),
}

/// A registered connection to the directory
pub struct ActiveTunnel {
    rendezvous: RendezvousClient,
    keep_alive: Duration,
}

impl ActiveTunnel {
    /// Keep-alive hint from the registration response
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Next claim instruction. Cancel-safe.
    pub async fn recv_event(&mut self) -> TunnelEvent {
        loop {
            match self.rendezvous.recv().await {
                Ok(Some(RendezvousMessage::RequestRelay(claim))) => {
                    return TunnelEvent::Claim(claim)
                }
                Ok(Some(other)) => {
                    tracing::debug!("Ignoring {} from directory", other.kind());
                }
                Ok(None) => {
                    return TunnelEvent::Disconnected("directory closed the connection".into())
                }
                Err(SessionError::ProtocolDecode(e)) => {
                    tracing::warn!("Undecodable message from directory: {}", e);
                }
                Err(e) => return TunnelEvent::Disconnected(e.to_string()),
            }
        }
    }

    /// Forward our reply to a direct-transport offer
    pub async fn respond(&mut self, response: RelayResponse) -> Result<(), SessionError> {
        self.rendezvous
            .send(RendezvousMessage::RelayResponse(response))
            .await
    }

    pub async fn close(self) {
        self.rendezvous.close().await;
    }
}
