//! Transports the session layer runs over
//!
//! Both implement [`pt_core::Transport`]: a WebSocket to the relay bridge
//! and a peer-to-peer data channel. [`direct`] holds the offer/answer seam
//! that produces data channels and [`rtc`] fills it with WebRTC.

pub mod data_channel;
pub mod direct;
pub mod rtc;
pub mod websocket;

pub use data_channel::DataChannelTransport;
pub use direct::{complete_direct, gather_offer, DirectConnector, PendingOffer};
pub use rtc::{answer_offer, PendingAnswer, RtcConnector, RtcSettings};
pub use websocket::WebSocketTransport;
