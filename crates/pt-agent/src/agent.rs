//! Agent main loop
//!
//! Keeps the directory link up and hands every claim instruction to a
//! session task. Sessions run on the relay or a data channel, so they
//! outlive a dropped directory link; shutdown cancels them all. Answers to
//! direct offers come back from the session tasks and leave on whatever
//! link is current.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use pt_client::transport::RtcSettings;
use pt_core::config::AgentConfig;
use pt_protocol::RelayResponse;

use crate::pty::TerminalBackend;
use crate::session::{DirectSettings, SessionServer, TerminalSettings};
use crate::tunnel::{ActiveTunnel, ConnectionError, ExponentialBackoff, TunnelConnector, TunnelEvent};

/// Grace period for sessions to send their close reason on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Direct-offer replies waiting for the directory link
const ANSWER_QUEUE: usize = 16;

/// A registered peer serving terminals
pub struct Agent {
    connector: TunnelConnector,
    sessions: Arc<SessionServer>,
}

impl Agent {
    pub fn new(config: AgentConfig, backend: Arc<dyn TerminalBackend>) -> Self {
        let rtc = RtcSettings::with_stun(config.stun_urls.clone());
        Self::with_rtc_settings(config, backend, rtc)
    }

    /// Like [`Agent::new`], with explicit ICE settings for direct sessions
    pub fn with_rtc_settings(
        config: AgentConfig,
        backend: Arc<dyn TerminalBackend>,
        rtc: RtcSettings,
    ) -> Self {
        let direct = DirectSettings::from_config(&config, rtc);
        let settings = TerminalSettings {
            keep_alive_interval: config.keep_alive_interval,
            compression_threshold: config.compression_threshold,
            open_timeout: config.connect_timeout,
        };
        let sessions = Arc::new(
            SessionServer::new(
                config.password.as_deref(),
                backend,
                settings,
                config.connect_timeout,
            )
            .with_direct(direct),
        );

        Self {
            connector: TunnelConnector::new(config),
            sessions,
        }
    }

    /// Run until `shutdown` is cancelled or the directory rejects us
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ConnectionError> {
        let mut backoff = ExponentialBackoff::from_config(&self.connector.config().backoff);
        let mut sessions = JoinSet::new();
        let (answers_tx, mut answers) = mpsc::channel(ANSWER_QUEUE);

        let result = loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                connected = self.connector.connect_with_retry(&mut backoff) => connected,
            };
            let mut tunnel = match connected {
                Ok(tunnel) => tunnel,
                Err(e) => break Err(e),
            };
            tracing::debug!("Directory keep-alive hint: {:?}", tunnel.keep_alive());

            let disconnected = self
                .serve_tunnel(&mut tunnel, &mut sessions, &answers_tx, &mut answers, &shutdown)
                .await;
            tunnel.close().await;

            let Some(reason) = disconnected else {
                break Ok(());
            };

            let delay = backoff.next_delay();
            tracing::warn!("Directory link lost: {}. Reconnecting in {:?}", reason, delay);
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        shutdown.cancel();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Aborting {} lingering sessions", sessions.len());
            sessions.abort_all();
        }

        result
    }

    /// Serve claims until the link drops (`Some(reason)`) or shutdown (`None`)
    async fn serve_tunnel(
        &self,
        tunnel: &mut ActiveTunnel,
        sessions: &mut JoinSet<()>,
        answers_tx: &mpsc::Sender<RelayResponse>,
        answers: &mut mpsc::Receiver<RelayResponse>,
        shutdown: &CancellationToken,
    ) -> Option<String> {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return None,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => continue,
                Some(response) = answers.recv() => {
                    tracing::debug!(
                        "Replying to offer for {:?} (direct: {})",
                        response.token,
                        response.answer.is_some()
                    );
                    if let Err(e) = tunnel.respond(response).await {
                        return Some(e.to_string());
                    }
                    continue;
                }
                event = tunnel.recv_event() => event,
            };

            let claim = match event {
                TunnelEvent::Claim(claim) => claim,
                TunnelEvent::Disconnected(reason) => return Some(reason),
            };

            tracing::info!(
                "Claim for session {:?} (offer: {})",
                claim.token,
                claim.offer.is_some()
            );
            let server = Arc::clone(&self.sessions);
            let answers = answers_tx.clone();
            let cancel = shutdown.child_token();
            sessions.spawn(async move {
                let token = claim.token;
                match server.serve_claim(claim, answers, cancel).await {
                    Ok(end) => tracing::info!("Session {:?} ended: {:?}", token, end),
                    Err(e) => tracing::warn!("Session {:?} failed: {}", token, e),
                }
            });
        }
    }
}
