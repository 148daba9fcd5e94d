//! Rendezvous message family
//!
//! Messages exchanged with the directory on `/rendezvous` and used as the
//! first ("claim") message on `/relay/{token}`.
//!
//! # Message Flow
//!
//! 1. A reachable peer connects and sends `RegisterPeer`; the directory
//!    replies with `RegisterPeerResponse`
//! 2. Any client may send `OnlineRequest` and receives `OnlineResponse`
//! 3. A requester sends `PunchHoleRequest`; the directory pushes
//!    `RequestRelay` to the target's connection and answers the requester
//!    with `PunchHoleResponse`
//! 4. If the request carried a direct-transport offer, the target answers
//!    the directory with `RelayResponse` before the requester is answered
//! 5. Both sides open `/relay/{token}` and send `RequestRelay` as the claim

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::WireMessage;
use crate::error::ProtocolError;
use crate::frame::{decode_body, encode_envelope, split_envelope};
use crate::token::RelayToken;

/// Tag byte of each rendezvous variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RendezvousType {
    /// Peer registration (peer → directory)
    RegisterPeer = 0x01,
    /// Registration acknowledgment
    RegisterPeerResponse = 0x02,
    /// Presence query
    OnlineRequest = 0x03,
    /// Presence bitset
    OnlineResponse = 0x04,
    /// Request to reach a peer
    PunchHoleRequest = 0x05,
    /// Failure or relay grant
    PunchHoleResponse = 0x06,
    /// Claim instruction (directory → target, and claim on the relay)
    RequestRelay = 0x07,
    /// Target's reply to a claim instruction (direct-mode answer)
    RelayResponse = 0x08,
}

impl RendezvousType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::RegisterPeer),
            0x02 => Some(Self::RegisterPeerResponse),
            0x03 => Some(Self::OnlineRequest),
            0x04 => Some(Self::OnlineResponse),
            0x05 => Some(Self::PunchHoleRequest),
            0x06 => Some(Self::PunchHoleResponse),
            0x07 => Some(Self::RequestRelay),
            0x08 => Some(Self::RelayResponse),
            _ => None,
        }
    }
}

/// Peer registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPeer {
    /// Peer ID to register under
    pub id: String,
    /// Opaque installation identifier of the peer
    pub uuid: Bytes,
}

/// Registration acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPeerResponse {
    /// Whether registration was accepted
    pub accepted: bool,
    /// Reason if not accepted
    pub reason: Option<String>,
    /// Suggested keep-alive interval in seconds
    pub keep_alive: u32,
}

/// Presence query for a list of peer IDs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineRequest {
    /// ID of the asking client
    pub id: String,
    /// Peer IDs to check, in order
    pub peers: Vec<String>,
}

/// Presence bitset, one bit per requested peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineResponse {
    /// MSB-first packed bits, see [`PresenceBits`]
    pub states: Bytes,
}

/// Kind of connection a punch-hole request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnType {
    /// Unspecified
    Default,
    /// Remote terminal session
    #[default]
    Terminal,
}

/// Request to reach a specific peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchHoleRequest {
    /// Target peer ID
    pub id: String,
    /// Kind of connection
    pub conn_type: ConnType,
    /// Encoded local description for direct transport, if capable
    pub offer: Option<String>,
}

/// Why a punch-hole request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PunchHoleFailure {
    /// Malformed target ID
    InvalidRequest,
    /// Target is not registered
    TargetNotOnline,
    /// Anything else, see the message
    Other,
}

/// Connection instructions for a granted punch-hole request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayGrant {
    /// Token naming the relay bridge
    pub token: RelayToken,
    /// Relay base URL; the bridge lives at `{relay_server}/relay/{token}`
    pub relay_server: String,
    /// Target's description for direct setup, if it answered the offer
    pub answer: Option<String>,
}

/// Response to a punch-hole request; exactly one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PunchHoleResponse {
    /// Request failed; terminal for this attempt
    Failure {
        failure: PunchHoleFailure,
        message: String,
    },
    /// Request granted
    Relay(RelayGrant),
}

/// Claim instruction / claim message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRelay {
    /// Token of the relay bridge
    pub token: RelayToken,
    /// Target peer ID
    pub id: String,
    /// Relay base URL
    pub relay_server: String,
    /// Random 16-byte placeholder socket address
    pub socket_addr: Bytes,
    /// Requester's direct-transport offer, forwarded to the target
    pub offer: Option<String>,
}

/// Target's reply to a claim instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    /// Token from the claim instruction
    pub token: RelayToken,
    /// Direct-transport answer; absent when the target declines direct mode
    pub answer: Option<String>,
}

/// Rendezvous protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousMessage {
    RegisterPeer(RegisterPeer),
    RegisterPeerResponse(RegisterPeerResponse),
    OnlineRequest(OnlineRequest),
    OnlineResponse(OnlineResponse),
    PunchHoleRequest(PunchHoleRequest),
    PunchHoleResponse(PunchHoleResponse),
    RequestRelay(RequestRelay),
    RelayResponse(RelayResponse),
}

impl RendezvousMessage {
    /// Get the message type for this message
    pub fn message_type(&self) -> RendezvousType {
        match self {
            Self::RegisterPeer(_) => RendezvousType::RegisterPeer,
            Self::RegisterPeerResponse(_) => RendezvousType::RegisterPeerResponse,
            Self::OnlineRequest(_) => RendezvousType::OnlineRequest,
            Self::OnlineResponse(_) => RendezvousType::OnlineResponse,
            Self::PunchHoleRequest(_) => RendezvousType::PunchHoleRequest,
            Self::PunchHoleResponse(_) => RendezvousType::PunchHoleResponse,
            Self::RequestRelay(_) => RendezvousType::RequestRelay,
            Self::RelayResponse(_) => RendezvousType::RelayResponse,
        }
    }

    /// Short variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterPeer(_) => "register_peer",
            Self::RegisterPeerResponse(_) => "register_peer_response",
            Self::OnlineRequest(_) => "online_request",
            Self::OnlineResponse(_) => "online_response",
            Self::PunchHoleRequest(_) => "punch_hole_request",
            Self::PunchHoleResponse(_) => "punch_hole_response",
            Self::RequestRelay(_) => "request_relay",
            Self::RelayResponse(_) => "relay_response",
        }
    }
}

impl WireMessage for RendezvousMessage {
    const FAMILY: &'static str = "rendezvous";

    fn tag(&self) -> u8 {
        self.message_type().as_u8()
    }

    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let tag = self.tag();
        match self {
            Self::RegisterPeer(m) => encode_envelope(tag, m),
            Self::RegisterPeerResponse(m) => encode_envelope(tag, m),
            Self::OnlineRequest(m) => encode_envelope(tag, m),
            Self::OnlineResponse(m) => encode_envelope(tag, m),
            Self::PunchHoleRequest(m) => encode_envelope(tag, m),
            Self::PunchHoleResponse(m) => encode_envelope(tag, m),
            Self::RequestRelay(m) => encode_envelope(tag, m),
            Self::RelayResponse(m) => encode_envelope(tag, m),
        }
    }

    fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, body) = split_envelope(src)?;
        let message_type =
            RendezvousType::from_u8(tag).ok_or(ProtocolError::UnknownMessageType {
                family: Self::FAMILY,
                tag,
            })?;

        let family = Self::FAMILY;
        Ok(match message_type {
            RendezvousType::RegisterPeer => Self::RegisterPeer(decode_body(family, body)?),
            RendezvousType::RegisterPeerResponse => {
                Self::RegisterPeerResponse(decode_body(family, body)?)
            }
            RendezvousType::OnlineRequest => Self::OnlineRequest(decode_body(family, body)?),
            RendezvousType::OnlineResponse => Self::OnlineResponse(decode_body(family, body)?),
            RendezvousType::PunchHoleRequest => {
                Self::PunchHoleRequest(decode_body(family, body)?)
            }
            RendezvousType::PunchHoleResponse => {
                Self::PunchHoleResponse(decode_body(family, body)?)
            }
            RendezvousType::RequestRelay => Self::RequestRelay(decode_body(family, body)?),
            RendezvousType::RelayResponse => Self::RelayResponse(decode_body(family, body)?),
        })
    }
}

/// MSB-first presence bitset: bit `7 - (i % 8)` of byte `i / 8` is peer `i`
pub struct PresenceBits;

impl PresenceBits {
    /// Pack presence flags in input order
    pub fn pack(online: &[bool]) -> Bytes {
        let mut states = vec![0u8; online.len().div_ceil(8)];
        for (i, _) in online.iter().enumerate().filter(|(_, on)| **on) {
            states[i / 8] |= 0x80 >> (i % 8);
        }
        Bytes::from(states)
    }

    /// Whether peer `index` is marked online
    pub fn is_online(states: &[u8], index: usize) -> bool {
        states
            .get(index / 8)
            .map(|byte| byte & (0x80 >> (index % 8)) != 0)
            .unwrap_or(false)
    }

    /// Unpack `count` flags
    pub fn unpack(states: &[u8], count: usize) -> Vec<bool> {
        (0..count).map(|i| Self::is_online(states, i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for tag in 0x01..=0x08u8 {
            let message_type = RendezvousType::from_u8(tag).unwrap();
            assert_eq!(message_type.as_u8(), tag);
        }
        assert!(RendezvousType::from_u8(0x00).is_none());
        assert!(RendezvousType::from_u8(0x09).is_none());
    }

    #[test]
    fn test_punch_hole_request_codec() {
        let msg = RendezvousMessage::PunchHoleRequest(PunchHoleRequest {
            id: "alice".to_string(),
            conn_type: ConnType::Terminal,
            offer: None,
        });

        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], RendezvousType::PunchHoleRequest.as_u8());
        assert_eq!(RendezvousMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_empty_offer_distinct_from_absent() {
        let with_empty = RendezvousMessage::PunchHoleRequest(PunchHoleRequest {
            id: "alice".to_string(),
            conn_type: ConnType::Terminal,
            offer: Some(String::new()),
        });

        let decoded = RendezvousMessage::decode(&with_empty.encode().unwrap()).unwrap();
        match decoded {
            RendezvousMessage::PunchHoleRequest(req) => assert_eq!(req.offer, Some(String::new())),
            other => panic!("Expected PunchHoleRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag() {
        let result = RendezvousMessage::decode(&[0xFE, 0x00]);
        assert!(matches!(
            result,
            Err(ProtocolError::UnknownMessageType { tag: 0xFE, .. })
        ));
    }

    #[test]
    fn test_truncated_body() {
        let msg = RendezvousMessage::RelayResponse(RelayResponse {
            token: RelayToken::generate(),
            answer: Some("answer".to_string()),
        });
        let encoded = msg.encode().unwrap();
        let truncated = &encoded[..encoded.len() - 3];
        assert!(matches!(
            RendezvousMessage::decode(truncated),
            Err(ProtocolError::MalformedBody { .. })
        ));
    }

    #[test]
    fn test_presence_bits_order() {
        let states = PresenceBits::pack(&[true, false, false, true, false, false, false, false, true]);
        assert_eq!(states.as_ref(), &[0b1001_0000, 0b1000_0000]);
        assert_eq!(
            PresenceBits::unpack(&states, 9),
            vec![true, false, false, true, false, false, false, false, true]
        );
        assert!(!PresenceBits::is_online(&states, 42));
    }

    #[test]
    fn test_presence_bits_empty() {
        assert!(PresenceBits::pack(&[]).is_empty());
    }
}
