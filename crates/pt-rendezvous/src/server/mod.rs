//! HTTP/WebSocket server exposing the directory and the relay
//!
//! - `GET /rendezvous`: long-lived directory connection
//! - `GET /relay/:token`: relay connection; first message claims the token
//! - `GET /health`: liveness check

mod relay;
mod rendezvous;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::StreamExt;
use pt_core::config::RendezvousConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conn::ConnHandle;
use crate::relay::run_token_cleanup;
use crate::state::RendezvousState;

/// How long a closing connection waits for its writer to flush
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Build the router for the given state
pub fn router(state: Arc<RendezvousState>) -> Router {
    Router::new()
        .route("/rendezvous", get(rendezvous::upgrade))
        .route("/relay/:token", get(relay::upgrade))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Rendezvous server bound to a socket
pub struct RendezvousServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<RendezvousState>,
}

impl RendezvousServer {
    /// Bind the listener and create the directory and relay.
    ///
    /// The server stops when `shutdown` is cancelled.
    pub async fn bind(config: RendezvousConfig, shutdown: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind_address))?;
        let local_addr = listener.local_addr()?;

        let relay_base = match &config.relay_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                if local_addr.ip().is_unspecified() {
                    tracing::warn!(
                        "Bound to {} without relay_url; remote peers may not reach the relay",
                        local_addr
                    );
                }
                format!("ws://{}", local_addr)
            }
        };

        let state = Arc::new(RendezvousState::new(config, relay_base, shutdown));
        Ok(Self {
            listener,
            local_addr,
            state,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared state
    pub fn state(&self) -> Arc<RendezvousState> {
        Arc::clone(&self.state)
    }

    /// Serve until shutdown
    pub async fn run(self) -> Result<()> {
        let shutdown = self.state.shutdown.clone();

        tokio::spawn(run_token_cleanup(
            Arc::clone(&self.state.hub),
            self.state.config.token_ttl,
            self.state.config.cleanup_interval,
            shutdown.clone(),
        ));

        tracing::info!(
            "Rendezvous server listening on {} (relay: {})",
            self.local_addr,
            self.state.relay_base
        );

        let app = router(Arc::clone(&self.state));
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

        tracing::info!("Rendezvous server stopped");
        Ok(())
    }
}

/// Next payload from a WebSocket; `None` once it is closed or broken
async fn next_frame(stream: &mut SplitStream<WebSocket>) -> Option<Bytes> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => return Some(Bytes::from(data)),
            Ok(Message::Text(text)) => return Some(Bytes::from(text.into_bytes())),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(e) => {
                tracing::debug!("WebSocket read error: {}", e);
                return None;
            }
        }
    }
    None
}

/// Drop our handle and let the writer flush, forcing it down after a grace period
async fn finish_connection(conn: ConnHandle, writer: JoinHandle<()>, done: CancellationToken) {
    let id = conn.id();
    drop(conn);
    if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
        tracing::debug!("Writer for {} did not finish, cancelling", id);
        done.cancel();
    }
}
