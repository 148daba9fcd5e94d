//! Connection handles shared by the directory and the relay
//!
//! Every accepted WebSocket gets a [`ConnHandle`]: an ID plus a bounded
//! outbound queue drained by a dedicated writer task. Actors never touch the
//! socket directly; they push [`Outbound`] items and move on.

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of each connection's outbound queue
pub const OUTBOUND_QUEUE: usize = 256;

/// WebSocket close code used for application-level closes
const CLOSE_NORMAL: u16 = 1000;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next connection ID
    pub fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Item queued for a connection's writer task
#[derive(Debug)]
pub enum Outbound {
    /// One binary message
    Frame(Bytes),
    /// Close the connection with a reason, after everything queued before it
    Close(String),
}

/// The receiving side of a connection is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnGone;

/// Cheap, cloneable reference to a live connection
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: ConnId,
    remote_addr: SocketAddr,
    tx: mpsc::Sender<Outbound>,
}

impl ConnHandle {
    /// Create a handle and the queue its writer drains
    pub fn new(remote_addr: SocketAddr) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = Self {
            id: ConnId::next(),
            remote_addr,
            tx,
        };
        (handle, rx)
    }

    /// Connection ID
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Remote address of the connection
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue a frame, waiting for room
    pub async fn send(&self, frame: Bytes) -> Result<(), ConnGone> {
        self.tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| ConnGone)
    }

    /// Queue a frame without waiting; false when the queue is full or closed
    pub fn try_send(&self, frame: Bytes) -> bool {
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Outbound queue full for {} ({})", self.id, self.remote_addr);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close after the frames already queued
    pub async fn close(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close(reason.into())).await;
    }

    /// Close without waiting for queue room
    pub fn try_close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.tx.try_send(Outbound::Close(reason.clone())).is_err() {
            tracing::debug!("Could not queue close ({}) for {}", reason, self.id);
        }
    }

    /// Whether the writer task has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain a connection's outbound queue into its socket.
///
/// Cancels `done` on exit so the reader side stops too.
pub async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    done: CancellationToken,
    id: ConnId,
) {
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = done.cancelled() => None,
        };

        match item {
            Some(Outbound::Frame(frame)) => {
                if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                    tracing::debug!("Write to {} failed: {}", id, e);
                    break;
                }
            }
            Some(Outbound::Close(reason)) => {
                tracing::debug!("Closing {}: {}", id, reason);
                let frame = CloseFrame {
                    code: CLOSE_NORMAL,
                    reason: Cow::Owned(reason),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
            None => {
                let _ = sink.close().await;
                break;
            }
        }
    }

    done.cancel();
}
