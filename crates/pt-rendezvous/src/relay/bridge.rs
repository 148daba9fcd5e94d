//! Per-token relay bridge actor
//!
//! One bridge pairs exactly two connections that claimed the same relay
//! token and forwards their frames to each other verbatim. It never looks
//! inside a frame.
//!
//! # State machine
//!
//! ```text
//! Empty --claim(a)--> HalfOpen(a) --claim(b)--> Paired(a, b) --close--> Closed
//!                         |                                      ^
//!                         +--------- close(a) / overflow --------+
//! ```
//!
//! While half-open, frames from the initiator are queued and flushed to the
//! acceptor, in arrival order, the moment it claims. The acceptor only exists
//! once the bridge is paired, so it never needs a queue of its own.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::conn::{ConnHandle, ConnId};

/// Capacity of a bridge's command queue
const COMMAND_QUEUE: usize = 256;

/// Close reason sent to the survivor when its peer leaves
pub const REASON_PEER_CLOSED: &str = "peer closed";

/// Close reason for a claimant arriving after the bridge is paired
pub const REASON_ALREADY_PAIRED: &str = "session already paired";

/// Close reason when the half-open buffer limit is hit
pub const REASON_BUFFER_OVERFLOW: &str = "relay buffer overflow";

/// Close reason for a claim on a bridge that has already closed
pub const REASON_SESSION_CLOSED: &str = "session closed";

/// Limits applied to frames buffered while half-open
#[derive(Debug, Clone, Copy)]
pub struct BridgeLimits {
    /// Maximum number of buffered frames
    pub max_frames: usize,
    /// Maximum number of buffered bytes
    pub max_bytes: usize,
}

/// Messages processed by a bridge, one at a time
#[derive(Debug)]
pub enum BridgeCommand {
    /// A connection claims this session
    Claim(ConnHandle),
    /// A frame arrived from a connection
    Frame { from: ConnId, frame: Bytes },
    /// A connection went away
    Closed(ConnId),
}

/// The bridge actor has exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeGone;

/// Handle used by connection tasks to talk to a bridge
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Claim the session for `conn`
    pub async fn claim(&self, conn: ConnHandle) -> Result<(), BridgeGone> {
        self.tx
            .send(BridgeCommand::Claim(conn))
            .await
            .map_err(|_| BridgeGone)
    }

    /// Forward a frame from `from`
    pub async fn frame(&self, from: ConnId, frame: Bytes) -> Result<(), BridgeGone> {
        self.tx
            .send(BridgeCommand::Frame { from, frame })
            .await
            .map_err(|_| BridgeGone)
    }

    /// Report that `conn` closed
    pub async fn closed(&self, conn: ConnId) {
        let _ = self.tx.send(BridgeCommand::Closed(conn)).await;
    }

    /// Whether the bridge has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Frames waiting for the acceptor
#[derive(Debug, Default)]
struct PendingQueue {
    frames: VecDeque<Bytes>,
    bytes: usize,
}

impl PendingQueue {
    /// Push a frame; false when this would exceed `limits`
    fn push(&mut self, frame: Bytes, limits: BridgeLimits) -> bool {
        if self.frames.len() >= limits.max_frames || self.bytes + frame.len() > limits.max_bytes {
            return false;
        }
        self.bytes += frame.len();
        self.frames.push_back(frame);
        true
    }
}

#[derive(Debug)]
enum BridgeState {
    Empty,
    HalfOpen {
        initiator: ConnHandle,
        pending: PendingQueue,
    },
    Paired {
        initiator: ConnHandle,
        acceptor: ConnHandle,
    },
    Closed,
}

/// The relay bridge actor for one token
pub struct RelayBridge {
    label: String,
    limits: BridgeLimits,
    state: BridgeState,
    rx: mpsc::Receiver<BridgeCommand>,
}

impl RelayBridge {
    /// Create a bridge and the handle used to reach it.
    ///
    /// `label` only appears in logs.
    pub fn new(label: impl Into<String>, limits: BridgeLimits) -> (Self, BridgeHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let bridge = Self {
            label: label.into(),
            limits,
            state: BridgeState::Empty,
            rx,
        };
        (bridge, BridgeHandle { tx })
    }

    /// Process commands until the bridge closes
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
            if matches!(self.state, BridgeState::Closed) {
                break;
            }
        }

        // Late claims still queued get an explicit answer
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            if let BridgeCommand::Claim(conn) = command {
                conn.try_close(REASON_SESSION_CLOSED);
            }
        }

        tracing::debug!("Relay bridge {} finished", self.label);
    }

    async fn handle(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::Claim(conn) => self.on_claim(conn).await,
            BridgeCommand::Frame { from, frame } => self.on_frame(from, frame).await,
            BridgeCommand::Closed(conn) => self.on_close(conn).await,
        }
    }

    async fn on_claim(&mut self, conn: ConnHandle) {
        match std::mem::replace(&mut self.state, BridgeState::Closed) {
            BridgeState::Empty => {
                tracing::debug!("Relay {}: {} claimed as initiator", self.label, conn.id());
                self.state = BridgeState::HalfOpen {
                    initiator: conn,
                    pending: PendingQueue::default(),
                };
            }
            BridgeState::HalfOpen { initiator, pending } if initiator.id() == conn.id() => {
                tracing::trace!("Relay {}: duplicate claim from {}", self.label, conn.id());
                self.state = BridgeState::HalfOpen { initiator, pending };
            }
            BridgeState::HalfOpen { initiator, pending } => {
                tracing::info!(
                    "Relay {}: paired {} with {} ({} buffered frames)",
                    self.label,
                    initiator.id(),
                    conn.id(),
                    pending.frames.len()
                );
                for frame in pending.frames {
                    if conn.send(frame).await.is_err() {
                        initiator.close(REASON_PEER_CLOSED).await;
                        return;
                    }
                }
                self.state = BridgeState::Paired {
                    initiator,
                    acceptor: conn,
                };
            }
            BridgeState::Paired {
                initiator,
                acceptor,
            } => {
                if conn.id() != initiator.id() && conn.id() != acceptor.id() {
                    tracing::warn!(
                        "Relay {}: rejecting third claimant {} ({})",
                        self.label,
                        conn.id(),
                        conn.remote_addr()
                    );
                    conn.close(REASON_ALREADY_PAIRED).await;
                }
                self.state = BridgeState::Paired {
                    initiator,
                    acceptor,
                };
            }
            BridgeState::Closed => {
                conn.close(REASON_SESSION_CLOSED).await;
            }
        }
    }

    async fn on_frame(&mut self, from: ConnId, frame: Bytes) {
        match &mut self.state {
            BridgeState::HalfOpen { initiator, pending } if initiator.id() == from => {
                if !pending.push(frame, self.limits) {
                    tracing::warn!(
                        "Relay {}: buffer limit reached ({} frames, {} bytes), closing",
                        self.label,
                        pending.frames.len(),
                        pending.bytes
                    );
                    initiator.close(REASON_BUFFER_OVERFLOW).await;
                    self.state = BridgeState::Closed;
                }
            }
            BridgeState::Paired {
                initiator,
                acceptor,
            } => {
                let (to, other) = if from == initiator.id() {
                    (&*acceptor, &*initiator)
                } else if from == acceptor.id() {
                    (&*initiator, &*acceptor)
                } else {
                    return;
                };

                tracing::trace!("Relay {}: {} bytes from {}", self.label, frame.len(), from);
                if to.send(frame).await.is_err() {
                    other.close(REASON_PEER_CLOSED).await;
                    self.state = BridgeState::Closed;
                }
            }
            _ => {
                tracing::trace!("Relay {}: dropping frame from non-party {}", self.label, from);
            }
        }
    }

    async fn on_close(&mut self, conn: ConnId) {
        let survivor = match &self.state {
            BridgeState::HalfOpen { initiator, .. } if initiator.id() == conn => None,
            BridgeState::Paired {
                initiator,
                acceptor,
            } if initiator.id() == conn => Some(acceptor.clone()),
            BridgeState::Paired {
                initiator,
                acceptor,
            } if acceptor.id() == conn => Some(initiator.clone()),
            _ => return,
        };

        tracing::info!("Relay {}: {} closed, tearing down", self.label, conn);
        self.state = BridgeState::Closed;
        if let Some(survivor) = survivor {
            survivor.close(REASON_PEER_CLOSED).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Outbound;
    use std::net::SocketAddr;

    const LIMITS: BridgeLimits = BridgeLimits {
        max_frames: 4,
        max_bytes: 64,
    };

    fn conn() -> (ConnHandle, mpsc::Receiver<Outbound>) {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        ConnHandle::new(addr)
    }

    fn spawn_bridge() -> (BridgeHandle, tokio::task::JoinHandle<()>) {
        let (bridge, handle) = RelayBridge::new("test", LIMITS);
        (handle, tokio::spawn(bridge.run()))
    }

    async fn expect_frame(rx: &mut mpsc::Receiver<Outbound>, expected: &'static [u8]) {
        match rx.recv().await {
            Some(Outbound::Frame(frame)) => assert_eq!(&frame[..], expected),
            other => panic!("Expected frame {:?}, got {:?}", expected, other),
        }
    }

    async fn expect_close(rx: &mut mpsc::Receiver<Outbound>, expected: &str) {
        match rx.recv().await {
            Some(Outbound::Close(reason)) => assert_eq!(reason, expected),
            other => panic!("Expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_buffered_frames_flush_in_order_on_pairing() {
        let (bridge, _task) = spawn_bridge();
        let (a, _rx_a) = conn();
        let (b, mut rx_b) = conn();

        bridge.claim(a.clone()).await.unwrap();
        bridge.frame(a.id(), Bytes::from_static(b"1")).await.unwrap();
        bridge.frame(a.id(), Bytes::from_static(b"2")).await.unwrap();
        bridge.frame(a.id(), Bytes::from_static(b"3")).await.unwrap();
        bridge.claim(b.clone()).await.unwrap();
        bridge.frame(a.id(), Bytes::from_static(b"4")).await.unwrap();

        expect_frame(&mut rx_b, b"1").await;
        expect_frame(&mut rx_b, b"2").await;
        expect_frame(&mut rx_b, b"3").await;
        expect_frame(&mut rx_b, b"4").await;
    }

    #[tokio::test]
    async fn test_paired_forwarding_both_directions() {
        let (bridge, _task) = spawn_bridge();
        let (a, mut rx_a) = conn();
        let (b, mut rx_b) = conn();

        bridge.claim(a.clone()).await.unwrap();
        bridge.claim(b.clone()).await.unwrap();
        bridge
            .frame(b.id(), Bytes::from_static(b"\x00\xffraw"))
            .await
            .unwrap();
        bridge.frame(a.id(), Bytes::from_static(b"pong")).await.unwrap();

        expect_frame(&mut rx_a, b"\x00\xffraw").await;
        expect_frame(&mut rx_b, b"pong").await;
    }

    #[tokio::test]
    async fn test_duplicate_claim_is_noop() {
        let (bridge, _task) = spawn_bridge();
        let (a, _rx_a) = conn();
        let (b, mut rx_b) = conn();

        bridge.claim(a.clone()).await.unwrap();
        bridge.claim(a.clone()).await.unwrap();
        bridge.frame(a.id(), Bytes::from_static(b"x")).await.unwrap();
        bridge.claim(b.clone()).await.unwrap();

        expect_frame(&mut rx_b, b"x").await;
    }

    #[tokio::test]
    async fn test_third_claimant_rejected() {
        let (bridge, _task) = spawn_bridge();
        let (a, mut rx_a) = conn();
        let (b, _rx_b) = conn();
        let (c, mut rx_c) = conn();

        bridge.claim(a.clone()).await.unwrap();
        bridge.claim(b.clone()).await.unwrap();
        bridge.claim(c.clone()).await.unwrap();
        expect_close(&mut rx_c, REASON_ALREADY_PAIRED).await;

        // Frames from the rejected claimant go nowhere
        bridge.frame(c.id(), Bytes::from_static(b"spoof")).await.unwrap();
        bridge.frame(b.id(), Bytes::from_static(b"real")).await.unwrap();
        expect_frame(&mut rx_a, b"real").await;
    }

    #[tokio::test]
    async fn test_close_tears_down_survivor() {
        let (bridge, task) = spawn_bridge();
        let (a, mut rx_a) = conn();
        let (b, _rx_b) = conn();

        bridge.claim(a.clone()).await.unwrap();
        bridge.claim(b.clone()).await.unwrap();
        bridge.closed(b.id()).await;

        expect_close(&mut rx_a, REASON_PEER_CLOSED).await;
        task.await.unwrap();
        assert!(bridge.is_closed());
        assert_eq!(
            bridge.frame(a.id(), Bytes::from_static(b"late")).await,
            Err(BridgeGone)
        );
    }

    #[tokio::test]
    async fn test_half_open_close_drops_buffer() {
        let (bridge, task) = spawn_bridge();
        let (a, _rx_a) = conn();

        bridge.claim(a.clone()).await.unwrap();
        bridge.frame(a.id(), Bytes::from_static(b"lost")).await.unwrap();
        bridge.closed(a.id()).await;
        task.await.unwrap();
        assert!(bridge.is_closed());
    }

    #[tokio::test]
    async fn test_buffer_overflow_by_frames() {
        let (bridge, task) = spawn_bridge();
        let (a, mut rx_a) = conn();

        bridge.claim(a.clone()).await.unwrap();
        for _ in 0..=LIMITS.max_frames {
            let _ = bridge.frame(a.id(), Bytes::from_static(b"f")).await;
        }

        expect_close(&mut rx_a, REASON_BUFFER_OVERFLOW).await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_buffer_overflow_by_bytes() {
        let (bridge, task) = spawn_bridge();
        let (a, mut rx_a) = conn();

        bridge.claim(a.clone()).await.unwrap();
        bridge
            .frame(a.id(), Bytes::from(vec![0u8; LIMITS.max_bytes + 1]))
            .await
            .unwrap();

        expect_close(&mut rx_a, REASON_BUFFER_OVERFLOW).await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_from_stranger_ignored() {
        let (bridge, _task) = spawn_bridge();
        let (a, _rx_a) = conn();
        let (b, mut rx_b) = conn();
        let (stranger, _rx_s) = conn();

        bridge.claim(a.clone()).await.unwrap();
        bridge.closed(stranger.id()).await;
        bridge.frame(a.id(), Bytes::from_static(b"kept")).await.unwrap();
        bridge.claim(b.clone()).await.unwrap();

        expect_frame(&mut rx_b, b"kept").await;
    }
}
