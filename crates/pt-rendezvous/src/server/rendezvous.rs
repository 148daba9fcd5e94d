//! Directory connections

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures::StreamExt;
use pt_protocol::{RendezvousMessage, WireMessage, MAX_MESSAGE_SIZE};
use tokio_util::sync::CancellationToken;

use super::{finish_connection, next_frame};
use crate::conn::{run_writer, ConnHandle};
use crate::state::RendezvousState;

pub(super) async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RendezvousState>>,
) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve(socket, remote, state))
}

async fn serve(socket: WebSocket, remote: SocketAddr, state: Arc<RendezvousState>) {
    let (sink, mut stream) = socket.split();
    let (conn, rx) = ConnHandle::new(remote);
    let done = CancellationToken::new();
    let writer = tokio::spawn(run_writer(sink, rx, done.clone(), conn.id()));

    tracing::debug!("Rendezvous connection {} from {}", conn.id(), remote);

    loop {
        let frame = tokio::select! {
            frame = next_frame(&mut stream) => frame,
            _ = done.cancelled() => None,
            _ = state.shutdown.cancelled() => {
                conn.close("server shutting down").await;
                None
            }
        };
        let Some(frame) = frame else { break };

        match RendezvousMessage::decode(&frame) {
            Ok(message) => state.directory.inbound(conn.clone(), message).await,
            Err(e) => {
                tracing::warn!("Bad rendezvous message from {}: {}", remote, e);
                conn.close("protocol error").await;
                break;
            }
        }
    }

    state.directory.disconnected(conn.id()).await;
    tracing::debug!("Rendezvous connection {} closed", conn.id());
    finish_connection(conn, writer, done).await;
}
