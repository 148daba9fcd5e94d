//! The directory actor
//!
//! A single task owns the registry and the table of punch-holes waiting for
//! a direct-mode answer. Commands are processed strictly one at a time, so
//! presence queries and punch-holes always see a consistent registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pt_core::auth::random_bytes;
use pt_core::types::PeerId;
use pt_protocol::{
    OnlineResponse, PresenceBits, PunchHoleFailure, PunchHoleRequest, PunchHoleResponse,
    RegisterPeer, RegisterPeerResponse, RelayGrant, RelayResponse, RelayToken,
    RendezvousMessage, RequestRelay, WireMessage,
};
use tokio::sync::mpsc;

use super::registry::Registry;
use crate::conn::{ConnHandle, ConnId};
use crate::relay::RelayHub;

/// Size of the random socket address carried in claim instructions
const SOCKET_ADDR_BYTES: usize = 16;

/// Capacity of the directory's command queue
const COMMAND_QUEUE: usize = 1024;

/// Directory behaviour knobs
#[derive(Debug, Clone)]
pub struct DirectorySettings {
    /// Base URL advertised as the relay endpoint (`ws://host:port`)
    pub relay_base: String,
    /// How long to wait for a target's direct-mode answer
    pub direct_answer_timeout: Duration,
    /// Keep-alive hint returned on registration, in seconds
    pub keep_alive: u32,
}

/// Messages processed by the directory actor
#[derive(Debug)]
pub enum DirectoryCommand {
    /// A decoded message from a rendezvous connection
    Inbound {
        conn: ConnHandle,
        message: RendezvousMessage,
    },
    /// A rendezvous connection closed
    Disconnected(ConnId),
    /// The direct-answer deadline for a token passed
    AnswerDeadline(RelayToken),
}

/// Handle used by connection tasks to reach the directory
#[derive(Debug, Clone)]
pub struct DirectoryHandle {
    tx: mpsc::Sender<DirectoryCommand>,
}

impl DirectoryHandle {
    /// Deliver a decoded message from `conn`
    pub async fn inbound(&self, conn: ConnHandle, message: RendezvousMessage) {
        if self
            .tx
            .send(DirectoryCommand::Inbound { conn, message })
            .await
            .is_err()
        {
            tracing::warn!("Directory is gone, dropping inbound message");
        }
    }

    /// Report a closed connection
    pub async fn disconnected(&self, conn: ConnId) {
        let _ = self.tx.send(DirectoryCommand::Disconnected(conn)).await;
    }

}

/// Punch-hole waiting for the target's `RelayResponse`
#[derive(Debug)]
struct PendingAnswer {
    requester: ConnHandle,
    target: ConnId,
    grant: RelayGrant,
}

/// The directory actor
pub struct Directory {
    registry: Registry,
    pending: HashMap<RelayToken, PendingAnswer>,
    hub: Arc<RelayHub>,
    settings: DirectorySettings,
    rx: mpsc::Receiver<DirectoryCommand>,
    deadlines: mpsc::WeakSender<DirectoryCommand>,
}

impl Directory {
    /// Spawn the actor; it stops once every handle is dropped
    pub fn spawn(hub: Arc<RelayHub>, settings: DirectorySettings) -> DirectoryHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let directory = Self {
            registry: Registry::new(),
            pending: HashMap::new(),
            hub,
            settings,
            rx,
            deadlines: tx.downgrade(),
        };
        tokio::spawn(directory.run());
        DirectoryHandle { tx }
    }

    async fn run(mut self) {
        tracing::info!("Directory started (relay: {})", self.settings.relay_base);

        while let Some(command) = self.rx.recv().await {
            match command {
                DirectoryCommand::Inbound { conn, message } => self.on_message(conn, message),
                DirectoryCommand::Disconnected(conn) => self.on_disconnect(conn),
                DirectoryCommand::AnswerDeadline(token) => self.on_deadline(token),
            }
        }

        tracing::info!("Directory stopped");
    }

    fn on_message(&mut self, conn: ConnHandle, message: RendezvousMessage) {
        tracing::debug!("Directory <- {} from {}", message.kind(), conn.id());

        match message {
            RendezvousMessage::RegisterPeer(register) => self.on_register(conn, register),
            RendezvousMessage::OnlineRequest(request) => {
                let online = self.registry.query_presence(&request.peers);
                let response = OnlineResponse {
                    states: PresenceBits::pack(&online),
                };
                send(&conn, RendezvousMessage::OnlineResponse(response));
            }
            RendezvousMessage::PunchHoleRequest(request) => self.on_punch_hole(conn, request),
            RendezvousMessage::RelayResponse(response) => self.on_relay_response(conn, response),
            other => {
                tracing::warn!(
                    "Ignoring unexpected {} from {} ({})",
                    other.kind(),
                    conn.id(),
                    conn.remote_addr()
                );
            }
        }
    }

    fn on_register(&mut self, conn: ConnHandle, register: RegisterPeer) {
        if register.id.is_empty() {
            tracing::warn!("Empty peer id from {}, closing", conn.remote_addr());
            conn.try_close("empty peer id");
            return;
        }

        if !PeerId::is_valid(&register.id) {
            let response = RegisterPeerResponse {
                accepted: false,
                reason: Some(format!("invalid peer id: {}", register.id)),
                keep_alive: 0,
            };
            send(&conn, RendezvousMessage::RegisterPeerResponse(response));
            return;
        }

        let replaced = self
            .registry
            .register(register.id.clone(), conn.clone(), register.uuid.clone());
        match replaced {
            Some(previous) if previous.conn.id() != conn.id() => {
                if previous.uuid == register.uuid {
                    tracing::info!(
                        "Peer {} reconnected from {} (was {})",
                        register.id,
                        conn.remote_addr(),
                        previous.conn.remote_addr()
                    );
                } else {
                    tracing::warn!(
                        "Peer {} taken over by another instance at {}; {} had held it for {:?}",
                        register.id,
                        conn.remote_addr(),
                        previous.conn.remote_addr(),
                        previous.registered_at.elapsed()
                    );
                }
            }
            Some(_) => {}
            None => {
                tracing::info!("Peer {} registered from {}", register.id, conn.remote_addr());
            }
        }

        let response = RegisterPeerResponse {
            accepted: true,
            reason: None,
            keep_alive: self.settings.keep_alive,
        };
        send(&conn, RendezvousMessage::RegisterPeerResponse(response));
    }

    fn on_punch_hole(&mut self, requester: ConnHandle, request: PunchHoleRequest) {
        if !PeerId::is_valid(&request.id) {
            fail(
                &requester,
                PunchHoleFailure::InvalidRequest,
                format!("invalid peer id: {:?}", request.id),
            );
            return;
        }

        let target = match self.registry.get(&request.id) {
            Some(record) => record.conn.clone(),
            None => {
                tracing::debug!("Punch hole to offline peer {}", request.id);
                fail(
                    &requester,
                    PunchHoleFailure::TargetNotOnline,
                    format!("{} is not online", request.id),
                );
                return;
            }
        };

        let token = RelayToken::generate();
        self.hub.reserve(token);

        let claim = RequestRelay {
            token,
            id: request.id.clone(),
            relay_server: self.settings.relay_base.clone(),
            socket_addr: random_bytes(SOCKET_ADDR_BYTES),
            offer: request.offer.clone(),
        };
        if !send(&target, RendezvousMessage::RequestRelay(claim)) {
            self.hub.retire(token);
            fail(
                &requester,
                PunchHoleFailure::Other,
                format!("{} is unreachable", request.id),
            );
            return;
        }

        tracing::info!(
            "Punch hole {} -> {} via relay {:?} ({:?}, offer: {})",
            requester.remote_addr(),
            request.id,
            token,
            request.conn_type,
            request.offer.is_some()
        );

        let grant = RelayGrant {
            token,
            relay_server: self.settings.relay_base.clone(),
            answer: None,
        };

        if request.offer.is_none() {
            send(
                &requester,
                RendezvousMessage::PunchHoleResponse(PunchHoleResponse::Relay(grant)),
            );
            return;
        }

        self.pending.insert(
            token,
            PendingAnswer {
                requester,
                target: target.id(),
                grant,
            },
        );
        self.schedule_deadline(token);
    }

    fn schedule_deadline(&self, token: RelayToken) {
        let deadlines = self.deadlines.clone();
        let timeout = self.settings.direct_answer_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = deadlines.upgrade() {
                let _ = tx.send(DirectoryCommand::AnswerDeadline(token)).await;
            }
        });
    }

    fn on_relay_response(&mut self, conn: ConnHandle, response: RelayResponse) {
        let from_target = self
            .pending
            .get(&response.token)
            .is_some_and(|pending| pending.target == conn.id());
        if !from_target {
            tracing::debug!("Unsolicited relay response from {}", conn.id());
            return;
        }

        if let Some(pending) = self.pending.remove(&response.token) {
            tracing::debug!(
                "Target answered {:?} (direct: {})",
                response.token,
                response.answer.is_some()
            );
            let grant = RelayGrant {
                answer: response.answer,
                ..pending.grant
            };
            send(
                &pending.requester,
                RendezvousMessage::PunchHoleResponse(PunchHoleResponse::Relay(grant)),
            );
        }
    }

    fn on_deadline(&mut self, token: RelayToken) {
        // Already answered: nothing to do
        if let Some(pending) = self.pending.remove(&token) {
            tracing::debug!("No direct answer for {:?}, granting relay only", token);
            send(
                &pending.requester,
                RendezvousMessage::PunchHoleResponse(PunchHoleResponse::Relay(pending.grant)),
            );
        }
    }

    fn on_disconnect(&mut self, conn: ConnId) {
        for (id, record) in self.registry.evict_conn(conn) {
            tracing::info!(
                "Peer {} went offline after {:?}",
                id,
                record.registered_at.elapsed()
            );
        }

        let orphaned: Vec<RelayToken> = self
            .pending
            .iter()
            .filter(|(_, p)| p.requester.id() == conn || p.target == conn)
            .map(|(token, _)| *token)
            .collect();
        for token in orphaned {
            if let Some(pending) = self.pending.remove(&token) {
                if pending.requester.id() != conn {
                    send(
                        &pending.requester,
                        RendezvousMessage::PunchHoleResponse(PunchHoleResponse::Relay(
                            pending.grant,
                        )),
                    );
                }
            }
        }
    }
}

/// Encode and queue a message; false when it could not be queued
fn send(conn: &ConnHandle, message: RendezvousMessage) -> bool {
    match message.encode() {
        Ok(frame) => conn.try_send(frame),
        Err(e) => {
            tracing::error!("Failed to encode {}: {}", message.kind(), e);
            false
        }
    }
}

fn fail(conn: &ConnHandle, failure: PunchHoleFailure, message: String) {
    send(
        conn,
        RendezvousMessage::PunchHoleResponse(PunchHoleResponse::Failure { failure, message }),
    );
}
