//! Relay connections
//!
//! The first message must be a `RequestRelay` claim naming the same token
//! as the URL. Everything after it is forwarded to the bridge untouched.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use pt_protocol::{RelayToken, RendezvousMessage, WireMessage, MAX_MESSAGE_SIZE};
use tokio_util::sync::CancellationToken;

use super::{finish_connection, next_frame};
use crate::conn::{run_writer, ConnHandle};
use crate::relay::BridgeHandle;
use crate::state::RendezvousState;

/// How long a relay connection may take to send its claim
const CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) async fn upgrade(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RendezvousState>>,
) -> Response {
    let token: RelayToken = match token.parse() {
        Ok(token) => token,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid relay token").into_response(),
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve(socket, remote, token, state))
}

async fn serve(socket: WebSocket, remote: SocketAddr, token: RelayToken, state: Arc<RendezvousState>) {
    let (sink, mut stream) = socket.split();
    let (conn, rx) = ConnHandle::new(remote);
    let done = CancellationToken::new();
    let writer = tokio::spawn(run_writer(sink, rx, done.clone(), conn.id()));

    tracing::debug!("Relay connection {} from {} for {:?}", conn.id(), remote, token);

    let bridge = match tokio::time::timeout(CLAIM_TIMEOUT, next_frame(&mut stream)).await {
        Ok(Some(frame)) => route_claim(&state, &conn, token, &frame).await,
        Ok(None) => None,
        Err(_) => {
            conn.close("claim timeout").await;
            None
        }
    };

    if let Some(bridge) = bridge {
        loop {
            let frame = tokio::select! {
                frame = next_frame(&mut stream) => frame,
                _ = done.cancelled() => None,
                _ = state.shutdown.cancelled() => None,
            };
            let Some(frame) = frame else { break };

            if bridge.frame(conn.id(), frame).await.is_err() {
                break;
            }
        }
        bridge.closed(conn.id()).await;
    }

    tracing::debug!("Relay connection {} closed", conn.id());
    finish_connection(conn, writer, done).await;
}

/// Validate the claim and hand the connection to its bridge
async fn route_claim(
    state: &RendezvousState,
    conn: &ConnHandle,
    token: RelayToken,
    frame: &[u8],
) -> Option<BridgeHandle> {
    let reason = match RendezvousMessage::decode(frame) {
        Ok(RendezvousMessage::RequestRelay(claim)) if claim.token == token => {
            match state.hub.bridge_for(token) {
                Ok(bridge) => {
                    if bridge.claim(conn.clone()).await.is_ok() {
                        return Some(bridge);
                    }
                    "session closed".to_string()
                }
                Err(reject) => reject.to_string(),
            }
        }
        Ok(RendezvousMessage::RequestRelay(_)) => "token mismatch".to_string(),
        Ok(other) => format!("expected relay claim, got {}", other.kind()),
        Err(e) => {
            tracing::warn!("Bad relay claim from {}: {}", conn.remote_addr(), e);
            "protocol error".to_string()
        }
    };

    tracing::debug!("Rejecting relay claim from {}: {}", conn.remote_addr(), reason);
    conn.close(reason).await;
    None
}
