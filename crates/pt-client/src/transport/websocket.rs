//! WebSocket transport
//!
//! Used for the directory connection and for relayed sessions. Each binary
//! WebSocket message carries exactly one wire message.

use std::borrow::Cow;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pt_core::{Transport, TransportError, TransportKind};
use pt_protocol::{RelayGrant, RendezvousMessage, RequestRelay, WireMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Message-oriented transport over a client WebSocket
pub struct WebSocketTransport {
    stream: WsStream,
    kind: TransportKind,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a WebSocket to `url`
    pub async fn connect(url: &str, kind: TransportKind) -> Result<Self, TransportError> {
        tracing::debug!("Connecting to {}", url);
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {}", url, e)))?;

        Ok(Self {
            stream,
            kind,
            closed: false,
        })
    }

    /// Connect to the relay bridge named by `grant` and claim it.
    ///
    /// `target` is the peer the session is with; it is informational for the
    /// relay, which only checks the token.
    pub async fn connect_relay(grant: &RelayGrant, target: &str) -> Result<Self, TransportError> {
        let url = grant.token.relay_url(&grant.relay_server);
        let mut transport = Self::connect(&url, TransportKind::Relay).await?;

        let claim = RendezvousMessage::RequestRelay(RequestRelay {
            token: grant.token,
            id: target.to_string(),
            relay_server: grant.relay_server.clone(),
            socket_addr: Bytes::new(),
            offer: None,
        });
        let frame = claim
            .encode()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        transport.send(frame).await?;

        tracing::debug!("Claimed relay session {:?}", grant.token);
        Ok(transport)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed("transport closed".to_string()));
        }
        self.stream
            .send(WsMessage::Binary(message.to_vec()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(WsMessage::Close(frame))) => {
                    self.closed = true;
                    return match frame {
                        Some(frame) if !frame.reason.is_empty() => {
                            Err(TransportError::Closed(frame.reason.into_owned()))
                        }
                        _ => Ok(None),
                    };
                }
                Some(Ok(WsMessage::Text(text))) => {
                    tracing::debug!("Ignoring {} byte text message", text.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(TransportError::Receive(e.to_string()));
                }
                None => {
                    self.closed = true;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Owned(reason.to_string()),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            tracing::debug!("Error closing WebSocket: {}", e);
        }
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}
