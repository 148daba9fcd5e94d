//! WebRTC data channels
//!
//! The client offers with [`RtcConnector`]; the agent answers with
//! [`answer_offer`]. Either way the opened channel ends up behind a
//! [`DataChannelTransport`]: the channel callbacks feed its inbound queue
//! and a pump task drains its outbound queue into the channel.
//!
//! Binary channel messages carry wire messages. A text message carries the
//! sender's close reason and is the last thing it sends.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use pt_core::config::IceServer;
use pt_core::{Transport, TransportError};

use super::data_channel::{ChannelEvent, DataChannelTransport, DATA_CHANNEL_QUEUE};
use super::direct::{DirectConnector, PendingOffer};

/// Label of the single data channel a session uses
pub const DATA_CHANNEL_LABEL: &str = "terminal";

/// Polls spent letting a close reason leave the send buffer
const DRAIN_POLLS: usize = 20;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// ICE settings shared by both ends
#[derive(Debug, Clone, Default)]
pub struct RtcSettings {
    /// STUN servers, as `stun:host:port`
    pub stun_urls: Vec<String>,
    /// Gather loopback candidates too, for peers on the same host
    pub include_loopback: bool,
}

impl RtcSettings {
    /// Settings using the given STUN servers
    pub fn with_stun(stun_urls: Vec<String>) -> Self {
        Self {
            stun_urls,
            include_loopback: false,
        }
    }

    fn api(&self) -> API {
        let mut engine = SettingEngine::default();
        if self.include_loopback {
            engine.set_include_loopback_candidate(true);
            engine.set_network_types(vec![NetworkType::Udp4]);
        }
        APIBuilder::new().with_setting_engine(engine).build()
    }

    fn configuration(&self, turn: Option<&IceServer>) -> RTCConfiguration {
        let mut ice_servers = Vec::new();
        if !self.stun_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn peer_connection(
        &self,
        turn: Option<&IceServer>,
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let pc = self
            .api()
            .new_peer_connection(self.configuration(turn))
            .await
            .map_err(failed("create peer connection"))?;
        Ok(Arc::new(pc))
    }
}

fn failed(step: &'static str) -> impl Fn(webrtc::Error) -> TransportError {
    move |e| TransportError::ConnectFailed(format!("{}: {}", step, e))
}

/// Closes a peer connection that was never handed to a transport
struct CloseOnDrop(Option<Arc<RTCPeerConnection>>);

impl CloseOnDrop {
    fn disarm(mut self) {
        self.0.take();
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(pc) = self.0.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = pc.close().await {
                    tracing::debug!("Error closing abandoned peer connection: {}", e);
                }
            });
        }
    }
}

/// A peer connection plus the queue its channel feeds
struct PeerLink {
    pc: Arc<RTCPeerConnection>,
    guard: CloseOnDrop,
    inbound_tx: mpsc::Sender<ChannelEvent>,
    inbound: mpsc::Receiver<ChannelEvent>,
    state: watch::Receiver<RTCPeerConnectionState>,
}

impl PeerLink {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let (inbound_tx, inbound) = mpsc::channel(DATA_CHANNEL_QUEUE);
        let (state_tx, state) = watch::channel(RTCPeerConnectionState::New);

        let failures = inbound_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |current: RTCPeerConnectionState| {
            tracing::debug!("Peer connection {}", current);
            let _ = state_tx.send(current);
            let failures = failures.clone();
            Box::pin(async move {
                if current == RTCPeerConnectionState::Failed {
                    let reason = "peer connection failed".to_string();
                    let _ = failures.send(ChannelEvent::Closed(reason)).await;
                }
            })
        }));

        Self {
            guard: CloseOnDrop(Some(Arc::clone(&pc))),
            pc,
            inbound_tx,
            inbound,
            state,
        }
    }

    /// Resolves once the connection failed or closed
    async fn broken(&self) {
        let mut state = self.state.clone();
        loop {
            if matches!(
                *state.borrow_and_update(),
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Hand the open `channel` to a transport and start its pump
    fn into_transport(self, channel: Arc<RTCDataChannel>) -> DataChannelTransport {
        let PeerLink {
            pc, guard, inbound, ..
        } = self;
        guard.disarm();

        let (outbound, rx) = mpsc::channel(DATA_CHANNEL_QUEUE);
        tokio::spawn(pump(pc, channel, rx));
        DataChannelTransport::new(outbound, inbound)
    }
}

/// Route a channel's messages and close into `inbound`
fn attach_inbound(channel: &RTCDataChannel, inbound: mpsc::Sender<ChannelEvent>) {
    let messages = inbound.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let messages = messages.clone();
        Box::pin(async move {
            let event = if message.is_string {
                ChannelEvent::Closed(String::from_utf8_lossy(&message.data).into_owned())
            } else {
                ChannelEvent::Message(message.data)
            };
            let _ = messages.send(event).await;
        })
    }));

    channel.on_close(Box::new(move || {
        let inbound = inbound.clone();
        Box::pin(async move {
            let _ = inbound.send(ChannelEvent::Closed(String::new())).await;
        })
    }));
}

/// Drain the session's outbound queue into the channel, then tear down
async fn pump(
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    mut outbound: mpsc::Receiver<ChannelEvent>,
) {
    while let Some(event) = outbound.recv().await {
        match event {
            ChannelEvent::Message(data) => {
                if let Err(e) = channel.send(&data).await {
                    tracing::debug!("Data channel send failed: {}", e);
                    break;
                }
            }
            ChannelEvent::Closed(reason) => {
                if channel.send_text(reason).await.is_ok() {
                    for _ in 0..DRAIN_POLLS {
                        if channel.buffered_amount().await == 0 {
                            break;
                        }
                        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = channel.close().await {
        tracing::debug!("Error closing data channel: {}", e);
    }
    if let Err(e) = pc.close().await {
        tracing::debug!("Error closing peer connection: {}", e);
    }
}

/// Offering side of a data channel
pub struct RtcConnector {
    settings: RtcSettings,
}

impl RtcConnector {
    pub fn new(settings: RtcSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl DirectConnector for RtcConnector {
    async fn create_offer(
        &self,
        ice_server: Option<&IceServer>,
    ) -> Result<Box<dyn PendingOffer>, TransportError> {
        let link = PeerLink::new(self.settings.peer_connection(ice_server).await?);

        let channel = link
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(failed("create data channel"))?;
        attach_inbound(&channel, link.inbound_tx.clone());

        let (opened_tx, opened) = oneshot::channel();
        channel.on_open(Box::new(move || {
            let _ = opened_tx.send(());
            Box::pin(async {})
        }));

        let offer = link
            .pc
            .create_offer(None)
            .await
            .map_err(failed("create offer"))?;
        let gathered = link.pc.gathering_complete_promise().await;
        link.pc
            .set_local_description(offer)
            .await
            .map_err(failed("set local offer"))?;

        Ok(Box::new(RtcOffer {
            link,
            channel,
            opened,
            gathered,
        }))
    }
}

struct RtcOffer {
    link: PeerLink,
    channel: Arc<RTCDataChannel>,
    opened: oneshot::Receiver<()>,
    gathered: mpsc::Receiver<()>,
}

#[async_trait]
impl PendingOffer for RtcOffer {
    async fn gathering_complete(&mut self) {
        let _ = self.gathered.recv().await;
    }

    async fn local_description(&self) -> Option<String> {
        self.link.pc.local_description().await.map(|d| d.sdp)
    }

    async fn accept(self: Box<Self>, answer: &str) -> Result<Box<dyn Transport>, TransportError> {
        let RtcOffer {
            link,
            channel,
            opened,
            ..
        } = *self;

        let answer =
            RTCSessionDescription::answer(answer.to_string()).map_err(failed("parse answer"))?;
        link.pc
            .set_remote_description(answer)
            .await
            .map_err(failed("set remote answer"))?;

        tokio::select! {
            opened = opened => opened.map_err(|_| {
                TransportError::ConnectFailed("data channel dropped before opening".to_string())
            })?,
            _ = link.broken() => {
                return Err(TransportError::ConnectFailed("peer connection failed".to_string()));
            }
        }

        Ok(Box::new(link.into_transport(channel)))
    }
}

/// Answer created for a client's offer, waiting for its data channel
pub struct PendingAnswer {
    link: PeerLink,
    channel: oneshot::Receiver<Arc<RTCDataChannel>>,
}

impl PendingAnswer {
    /// Wait for the offerer's channel to open
    pub async fn connected(self) -> Result<DataChannelTransport, TransportError> {
        let PendingAnswer { link, channel } = self;
        let channel = tokio::select! {
            channel = channel => channel.map_err(|_| {
                TransportError::ConnectFailed("peer connection closed before a channel opened".to_string())
            })?,
            _ = link.broken() => {
                return Err(TransportError::ConnectFailed("peer connection failed".to_string()));
            }
        };
        Ok(link.into_transport(channel))
    }
}

/// Answer `offer`, waiting up to `gather_timeout` for local candidates.
///
/// Returns the answer to send back and the handle that yields the channel.
pub async fn answer_offer(
    settings: &RtcSettings,
    ice_server: Option<&IceServer>,
    offer: &str,
    gather_timeout: Duration,
) -> Result<(String, PendingAnswer), TransportError> {
    let offer = RTCSessionDescription::offer(offer.to_string()).map_err(failed("parse offer"))?;
    let link = PeerLink::new(settings.peer_connection(ice_server).await?);

    let (channel_tx, channel) = oneshot::channel();
    let channel_tx = Arc::new(Mutex::new(Some(channel_tx)));
    let inbound = link.inbound_tx.clone();
    link.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let opened = channel_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let inbound = inbound.clone();
        Box::pin(async move {
            let Some(opened) = opened else {
                tracing::debug!("Ignoring extra data channel {}", channel.label());
                return;
            };
            attach_inbound(&channel, inbound);
            let ready = Arc::clone(&channel);
            channel.on_open(Box::new(move || {
                let _ = opened.send(ready);
                Box::pin(async {})
            }));
        })
    }));

    link.pc
        .set_remote_description(offer)
        .await
        .map_err(failed("set remote offer"))?;
    let answer = link
        .pc
        .create_answer(None)
        .await
        .map_err(failed("create answer"))?;
    let mut gathered = link.pc.gathering_complete_promise().await;
    link.pc
        .set_local_description(answer)
        .await
        .map_err(failed("set local answer"))?;

    if tokio::time::timeout(gather_timeout, gathered.recv())
        .await
        .is_err()
    {
        tracing::debug!(
            "Candidate gathering still running after {:?}, sending partial answer",
            gather_timeout
        );
    }

    let answer = link
        .pc
        .local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| TransportError::ConnectFailed("no local answer".to_string()))?;

    Ok((answer, PendingAnswer { link, channel }))
}
