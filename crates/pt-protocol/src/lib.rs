//! pt-protocol: Wire protocol for peerterm
//!
//! This crate defines the two binary message families: the rendezvous
//! family spoken with the directory and the relay, and the session family
//! spoken end-to-end between a terminal client and the target peer.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod rendezvous;
pub mod token;

pub use codec::WireMessage;
pub use error::ProtocolError;
pub use frame::{MAX_MESSAGE_SIZE, TAG_SIZE};
pub use message::{
    AuthChallenge, LoginRequest, LoginResponse, Message, MessageType, PeerInfo, TerminalAction,
    TerminalData, TerminalResponse, TerminalSize, TestDelay, PROTOCOL_VERSION,
};
pub use rendezvous::{
    ConnType, OnlineRequest, OnlineResponse, PresenceBits, PunchHoleFailure, PunchHoleRequest,
    PunchHoleResponse, RegisterPeer, RegisterPeerResponse, RelayGrant, RelayResponse,
    RendezvousMessage, RendezvousType, RequestRelay,
};
pub use token::RelayToken;
