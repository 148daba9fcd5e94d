//! Answers to peer-to-peer offers
//!
//! A claim that carries an offer gets exactly one `RelayResponse` back
//! through the directory: an answer when one could be built, `None`
//! otherwise. After answering, the session waits a bounded time for the
//! client's data channel and falls back to the relay when it never opens.

use std::time::Duration;

use tokio::sync::mpsc;

use pt_client::transport::{answer_offer, DataChannelTransport, RtcSettings};
use pt_core::config::{AgentConfig, IceServer};
use pt_protocol::{RelayResponse, RelayToken};

/// How the agent answers offers
#[derive(Debug, Clone)]
pub struct DirectSettings {
    pub rtc: RtcSettings,
    pub turn: Option<IceServer>,
    pub gather_timeout: Duration,
    pub connect_timeout: Duration,
}

impl DirectSettings {
    /// Settings from `config`, or `None` when p2p is off
    pub fn from_config(config: &AgentConfig, rtc: RtcSettings) -> Option<Self> {
        if !config.p2p {
            return None;
        }
        let turn = config.ice_server().unwrap_or_else(|e| {
            tracing::warn!("Ignoring TURN server: {}", e);
            None
        });
        Some(Self {
            rtc,
            turn,
            gather_timeout: config.ice_gather_timeout,
            connect_timeout: config.direct_connect_timeout,
        })
    }
}

/// Answer `offer` for `token` and wait for the data channel.
///
/// Returns `None` when the session should use the relay instead.
pub async fn negotiate(
    settings: Option<&DirectSettings>,
    token: RelayToken,
    offer: &str,
    answers: &mpsc::Sender<RelayResponse>,
) -> Option<DataChannelTransport> {
    let Some(settings) = settings else {
        tracing::debug!("Declining direct offer for {:?}", token);
        respond(answers, token, None).await;
        return None;
    };

    let answered = answer_offer(
        &settings.rtc,
        settings.turn.as_ref(),
        offer,
        settings.gather_timeout,
    )
    .await;
    let (answer, pending) = match answered {
        Ok(answered) => answered,
        Err(e) => {
            tracing::warn!("Could not answer direct offer for {:?}: {}", token, e);
            respond(answers, token, None).await;
            return None;
        }
    };

    if !respond(answers, token, Some(answer)).await {
        return None;
    }

    match tokio::time::timeout(settings.connect_timeout, pending.connected()).await {
        Ok(Ok(transport)) => {
            tracing::info!("Direct channel open for {:?}", token);
            Some(transport)
        }
        Ok(Err(e)) => {
            tracing::warn!("Direct channel for {:?} failed, using relay: {}", token, e);
            None
        }
        Err(_) => {
            tracing::warn!(
                "Direct channel for {:?} not open after {:?}, using relay",
                token,
                settings.connect_timeout
            );
            None
        }
    }
}

async fn respond(
    answers: &mpsc::Sender<RelayResponse>,
    token: RelayToken,
    answer: Option<String>,
) -> bool {
    let sent = answers.send(RelayResponse { token, answer }).await;
    if sent.is_err() {
        tracing::debug!("Directory link gone, answer for {:?} dropped", token);
    }
    sent.is_ok()
}
