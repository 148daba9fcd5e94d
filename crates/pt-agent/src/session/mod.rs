//! Sessions served to connecting clients
//!
//! Each claim instruction from the directory becomes one task: answer the
//! client's offer if it made one, otherwise (or if the data channel never
//! opens) claim the relay token, then run the login handshake and serve a
//! terminal.

mod direct;
mod gate;
mod login;
mod terminal;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pt_client::transport::WebSocketTransport;
use pt_core::{SessionError, Transport};
use pt_protocol::{Message, RelayGrant, RelayResponse, RequestRelay};

pub use direct::{negotiate, DirectSettings};
pub use gate::PasswordGate;
pub use login::{accept_login, local_peer_info, WRONG_PASSWORD};
pub use terminal::{encode_output, serve_terminal, SessionEnd, TerminalSettings, DEFAULT_SERVICE};

use crate::pty::TerminalBackend;
use login::send_message;

/// Everything a session task needs, shared across sessions
pub struct SessionServer {
    gate: PasswordGate,
    backend: Arc<dyn TerminalBackend>,
    settings: TerminalSettings,
    /// Deadline for each step of the login handshake
    login_timeout: Duration,
    /// Offers are declined when unset
    direct: Option<DirectSettings>,
}

impl SessionServer {
    pub fn new(
        password: Option<&str>,
        backend: Arc<dyn TerminalBackend>,
        settings: TerminalSettings,
        login_timeout: Duration,
    ) -> Self {
        Self {
            gate: PasswordGate::new(password),
            backend,
            settings,
            login_timeout,
            direct: None,
        }
    }

    /// Answer peer-to-peer offers with `direct`
    pub fn with_direct(mut self, direct: Option<DirectSettings>) -> Self {
        self.direct = direct;
        self
    }

    /// Serve the client named by `claim`, directly or through the relay.
    ///
    /// Answers to offers go out through `answers`.
    pub async fn serve_claim(
        self: Arc<Self>,
        claim: RequestRelay,
        answers: mpsc::Sender<RelayResponse>,
        cancel: CancellationToken,
    ) -> Result<SessionEnd, SessionError> {
        let direct = match claim.offer.as_deref() {
            Some(offer) => tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
                direct = negotiate(self.direct.as_ref(), claim.token, offer, &answers) => direct,
            },
            None => None,
        };

        let mut transport: Box<dyn Transport> = match direct {
            Some(transport) => Box::new(transport),
            None => {
                tracing::info!("Client waiting on relay session {:?}", claim.token);
                let grant = RelayGrant {
                    token: claim.token,
                    relay_server: claim.relay_server,
                    answer: None,
                };
                let connect = WebSocketTransport::connect_relay(&grant, &claim.id);
                let transport = tokio::select! {
                    _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
                    connected = tokio::time::timeout(self.login_timeout, connect) => {
                        connected.map_err(|_| SessionError::Timeout("relay connection"))??
                    }
                };
                Box::new(transport)
            }
        };

        let result = self.serve(transport.as_mut(), &cancel).await;
        finish(transport.as_mut(), &result).await;
        result
    }

    /// Login then terminal, over an already connected transport
    pub async fn serve<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, SessionError> {
        let login = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
            login = accept_login(transport, &self.gate, self.login_timeout) => login?,
        };
        tracing::debug!("Serving terminal to {} (attempt {:016x})", login.my_id, login.session_id);

        serve_terminal(transport, self.backend.as_ref(), self.settings, cancel).await
    }
}

/// Tell the client why the session ended, then close the transport
async fn finish<T: Transport + ?Sized>(transport: &mut T, result: &Result<SessionEnd, SessionError>) {
    let (reason, notify) = match result {
        Ok(SessionEnd::Exited(_)) => ("terminal exited".to_string(), false),
        Ok(SessionEnd::ClientClosed) => ("closed".to_string(), false),
        Ok(SessionEnd::Shutdown) => ("agent shutting down".to_string(), true),
        Ok(SessionEnd::OpenFailed(message)) => (message.clone(), false),
        Err(e @ (SessionError::AuthFailure(_) | SessionError::Transport(_))) => (e.to_string(), false),
        Err(e) => (e.to_string(), true),
    };
    // The relay does not forward close frames, so the reason travels in-band.
    if notify {
        let _ = send_message(transport, &Message::CloseReason(reason.clone())).await;
    }
    transport.close(&reason).await;
}
