//! Terminal client session
//!
//! One [`TerminalClient`] serves one terminal tab. `open` runs
//! negotiation and login under a per-attempt cancellation token; once the
//! session is `Open` a [`SessionDriver`] task owns the transport and the
//! client only talks to it through an unbounded command queue, so `send`
//! never waits.
//!
//! Policy for overlapping calls:
//! - `open` while another open is negotiating or authenticating fails with
//!   [`SessionError::OpenInProgress`]
//! - `open` while a session is `Open` closes that session first (its
//!   handler sees `Failed(Superseded)`) and logs a warning
//! - `close` works from any state and is idempotent; an in-flight `open`
//!   resolves to [`SessionError::Cancelled`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pt_core::config::ClientConfig;
use pt_core::{SessionError, SessionNonce, Transport};
use pt_protocol::{Message, PeerInfo, RelayGrant, TerminalAction, TerminalSize};

use super::driver::{SessionCommand, SessionDriver};
use super::handler::{CloseReason, PasswordProvider, SessionHandler};
use super::login::{login, send_message, LoginParams};
use crate::rendezvous::RendezvousClient;
use crate::transport::{complete_direct, gather_offer, DirectConnector, PendingOffer, WebSocketTransport};

/// Observable state of a [`TerminalClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session yet
    Idle,
    /// Punch hole and transport selection in progress
    Negotiating,
    /// Login handshake in progress
    Authenticating,
    /// Terminal is open
    Open,
    /// Last session was closed
    Closed,
}

struct OpenSession {
    target: String,
    nonce: SessionNonce,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl OpenSession {
    /// Ask the driver to stop and wait until it reported the close
    async fn shutdown(self, reason: CloseReason) {
        let _ = self.commands.send(SessionCommand::Close(reason));
        if let Err(e) = self.task.await {
            tracing::error!("Session task for {} failed: {}", self.target, e);
        }
    }
}

enum Phase {
    Idle,
    Negotiating { attempt: u64, cancel: CancellationToken },
    Authenticating { attempt: u64, cancel: CancellationToken },
    Open { attempt: u64, session: OpenSession },
    Closed,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Negotiating { .. } => SessionState::Negotiating,
            Phase::Authenticating { .. } => SessionState::Authenticating,
            Phase::Open { .. } => SessionState::Open,
            Phase::Closed => SessionState::Closed,
        }
    }

    fn attempt(&self) -> Option<u64> {
        match self {
            Phase::Negotiating { attempt, .. }
            | Phase::Authenticating { attempt, .. }
            | Phase::Open { attempt, .. } => Some(*attempt),
            Phase::Idle | Phase::Closed => None,
        }
    }
}

struct Shared {
    phase: Mutex<Phase>,
    next_attempt: AtomicU64,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Negotiating -> Authenticating for `attempt`
    fn authenticating(&self, attempt: u64) -> Result<(), SessionError> {
        let mut phase = self.phase();
        match &*phase {
            Phase::Negotiating { attempt: current, cancel } if *current == attempt => {
                let cancel = cancel.clone();
                *phase = Phase::Authenticating { attempt, cancel };
                Ok(())
            }
            _ => Err(SessionError::Cancelled),
        }
    }

    /// A failed open returns to Idle, unless it was closed meanwhile
    fn reset(&self, attempt: u64) {
        let mut phase = self.phase();
        if matches!(&*phase, Phase::Negotiating { .. } | Phase::Authenticating { .. })
            && phase.attempt() == Some(attempt)
        {
            *phase = Phase::Idle;
        }
    }

    /// The driver of `attempt` ended on its own
    fn finished(&self, attempt: u64) {
        let mut phase = self.phase();
        if matches!(&*phase, Phase::Open { .. }) && phase.attempt() == Some(attempt) {
            *phase = Phase::Closed;
        }
    }
}

/// Client side of one terminal tab
pub struct TerminalClient {
    config: ClientConfig,
    handler: Arc<dyn SessionHandler>,
    passwords: Arc<dyn PasswordProvider>,
    connector: Option<Arc<dyn DirectConnector>>,
    shared: Arc<Shared>,
}

impl TerminalClient {
    /// Create an idle client.
    ///
    /// An out-of-range `chunk_size` is clamped below the frame limit.
    pub fn new(
        config: ClientConfig,
        handler: Arc<dyn SessionHandler>,
        passwords: Arc<dyn PasswordProvider>,
    ) -> Self {
        if config.effective_chunk_size() != config.chunk_size {
            tracing::warn!(
                "chunk_size {} out of range, using {}",
                config.chunk_size,
                config.effective_chunk_size()
            );
        }
        Self {
            config,
            handler,
            passwords,
            connector: None,
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Idle),
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    /// Use `connector` for peer-to-peer data channels when `p2p` is enabled
    pub fn with_direct_connector(mut self, connector: Arc<dyn DirectConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.shared.phase().state()
    }

    /// Open a terminal on `target`.
    ///
    /// Resolves once the login succeeded and the open action was sent.
    /// Failures leave the client `Idle` and are not retried.
    pub async fn open(&self, target: &str, size: TerminalSize) -> Result<PeerInfo, SessionError> {
        let attempt = self.shared.next_attempt.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let superseded = {
            let mut phase = self.shared.phase();
            if matches!(&*phase, Phase::Negotiating { .. } | Phase::Authenticating { .. }) {
                return Err(SessionError::OpenInProgress);
            }
            let negotiating = Phase::Negotiating {
                attempt,
                cancel: cancel.clone(),
            };
            match std::mem::replace(&mut *phase, negotiating) {
                Phase::Open { session, .. } => Some(session),
                _ => None,
            }
        };

        if let Some(session) = superseded {
            tracing::warn!(
                "Superseding open session {} with {} by a new open to {}",
                session.nonce,
                session.target,
                target
            );
            session
                .shutdown(CloseReason::Failed(SessionError::Superseded))
                .await;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.establish(attempt, target, size) => result,
        };

        match result {
            Ok((transport, peer, nonce)) => {
                self.promote(attempt, target, nonce, transport, peer).await
            }
            Err(e) => {
                tracing::warn!("Open to {} failed: {}", target, e);
                self.shared.reset(attempt);
                Err(e)
            }
        }
    }

    /// Send terminal input, split into ordered chunks of at most the
    /// effective chunk size.
    ///
    /// Never waits; fails with `NotOpen` unless the session is open.
    pub fn send(&self, data: Bytes) -> Result<(), SessionError> {
        let phase = self.shared.phase();
        let Phase::Open { session, .. } = &*phase else {
            return Err(SessionError::NotOpen);
        };

        let chunk_size = self.config.effective_chunk_size();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            session
                .commands
                .send(SessionCommand::Data(data.slice(offset..end)))
                .map_err(|_| SessionError::NotOpen)?;
            offset = end;
        }
        Ok(())
    }

    /// Tell the target about a new terminal size
    pub fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        let phase = self.shared.phase();
        let Phase::Open { session, .. } = &*phase else {
            return Err(SessionError::NotOpen);
        };
        session
            .commands
            .send(SessionCommand::Resize(size))
            .map_err(|_| SessionError::NotOpen)
    }

    /// Close the session from any state. Calling it again does nothing.
    ///
    /// Returns after the close callback of an open session has run.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.shared.phase(), Phase::Closed);
        match previous {
            Phase::Negotiating { cancel, .. } | Phase::Authenticating { cancel, .. } => {
                tracing::debug!("Cancelling open in progress");
                cancel.cancel();
            }
            Phase::Open { session, .. } => session.shutdown(CloseReason::Local).await,
            Phase::Idle | Phase::Closed => {}
        }
    }

    async fn establish(
        &self,
        attempt: u64,
        target: &str,
        size: TerminalSize,
    ) -> Result<(Box<dyn Transport>, PeerInfo, SessionNonce), SessionError> {
        let nonce = SessionNonce::generate();
        tracing::info!("Opening session {} to {}", nonce, target);

        let (offer, pending) = match self.prepare_direct().await {
            Some((offer, pending)) => (Some(offer), Some(pending)),
            None => (None, None),
        };

        let grant = tokio::time::timeout(self.config.request_timeout, self.punch_hole(target, offer))
            .await
            .map_err(|_| SessionError::Timeout("punch hole response"))??;

        let mut transport = self.select_transport(&grant, pending, target).await?;
        tracing::debug!("Session {} to {} uses {} transport", nonce, target, transport.kind());

        if let Err(e) = self.shared.authenticating(attempt) {
            transport.close("cancelled").await;
            return Err(e);
        }

        let params = LoginParams {
            target: target.to_string(),
            my_id: self.config.my_id.clone(),
            my_name: self.config.my_name.clone(),
            nonce,
            timeout: self.config.login_timeout,
        };

        let opened = async {
            let peer = login(transport.as_mut(), &params, self.passwords.as_ref()).await?;
            let open = Message::TerminalAction(TerminalAction::Open {
                size,
                service_id: None,
            });
            send_message(transport.as_mut(), &open).await?;
            Ok::<_, SessionError>(peer)
        }
        .await;

        match opened {
            Ok(peer) => Ok((transport, peer, nonce)),
            Err(e) => {
                transport.close(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn prepare_direct(&self) -> Option<(String, Box<dyn PendingOffer>)> {
        if !self.config.direct_enabled() {
            return None;
        }
        let Some(connector) = &self.connector else {
            tracing::debug!("Peer-to-peer enabled but no direct connector available");
            return None;
        };

        let ice_server = match self.config.ice_server() {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!("Ignoring TURN server: {}", e);
                None
            }
        };

        gather_offer(
            connector.as_ref(),
            ice_server.as_ref(),
            self.config.ice_gather_timeout,
        )
        .await
    }

    async fn punch_hole(&self, target: &str, offer: Option<String>) -> Result<RelayGrant, SessionError> {
        let mut rendezvous =
            RendezvousClient::connect(&self.config.rendezvous_url, self.config.request_timeout).await?;
        let grant = rendezvous.punch_hole(target, offer).await;
        rendezvous.close().await;
        grant
    }

    async fn select_transport(
        &self,
        grant: &RelayGrant,
        pending: Option<Box<dyn PendingOffer>>,
        target: &str,
    ) -> Result<Box<dyn Transport>, SessionError> {
        if let (Some(pending), Some(answer)) = (pending, grant.answer.as_deref()) {
            if let Some(transport) =
                complete_direct(pending, answer, self.config.direct_connect_timeout).await
            {
                tracing::info!("Direct channel to {} established", target);
                return Ok(transport);
            }
        }

        let relay = tokio::time::timeout(
            self.config.request_timeout,
            WebSocketTransport::connect_relay(grant, target),
        )
        .await
        .map_err(|_| SessionError::Timeout("relay connection"))??;
        Ok(Box::new(relay))
    }

    async fn promote(
        &self,
        attempt: u64,
        target: &str,
        nonce: SessionNonce,
        transport: Box<dyn Transport>,
        peer: PeerInfo,
    ) -> Result<PeerInfo, SessionError> {
        let kind = transport.kind();

        let rejected = {
            let mut phase = self.shared.phase();
            let current =
                matches!(&*phase, Phase::Authenticating { .. }) && phase.attempt() == Some(attempt);
            if current {
                let (commands, rx) = mpsc::unbounded_channel();
                let driver =
                    SessionDriver::new(target.to_string(), transport, rx, Arc::clone(&self.handler));
                let shared = Arc::clone(&self.shared);
                let handler = Arc::clone(&self.handler);
                let info = peer.clone();
                let task = tokio::spawn(async move {
                    handler.on_open(&info, kind);
                    let reason = driver.run().await;
                    shared.finished(attempt);
                    handler.on_close(reason);
                });

                *phase = Phase::Open {
                    attempt,
                    session: OpenSession {
                        target: target.to_string(),
                        nonce,
                        commands,
                        task,
                    },
                };
                None
            } else {
                Some(transport)
            }
        };

        if let Some(mut transport) = rejected {
            transport.close("cancelled").await;
            return Err(SessionError::Cancelled);
        }

        tracing::info!(
            "Session {} to {} open ({}@{}, {})",
            nonce,
            target,
            peer.username,
            peer.hostname,
            kind
        );
        Ok(peer)
    }
}
