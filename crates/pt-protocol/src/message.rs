//! Session message family
//!
//! Messages exchanged end-to-end between the terminal client and the target
//! peer over whichever transport was negotiated. The relay never inspects
//! them.
//!
//! # Message Flow
//!
//! 1. Client sends `LoginRequest` without a password
//! 2. Target replies with `Hash` (salt + challenge) when a password is set
//! 3. Client resends `LoginRequest` carrying the digest
//! 4. Target replies with `LoginResponse` (peer info or error)
//! 5. Client sends `TerminalAction::Open`, target answers `TerminalResponse::Opened`
//! 6. Terminal I/O: `TerminalAction::Data` / `TerminalResponse::Data`
//! 7. Target sends `TestDelay` periodically; client echoes it unchanged
//! 8. Either side ends with `TerminalAction::Close`, `TerminalResponse::Closed`
//!    or `CloseReason`

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::WireMessage;
use crate::error::ProtocolError;
use crate::frame::{decode_body, encode_envelope, split_envelope};

/// Current protocol version string, sent in `LoginRequest` and `PeerInfo`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Tag byte of each session variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Login attempt
    LoginRequest = 0x01,
    /// Authentication challenge
    Hash = 0x02,
    /// Login result
    LoginResponse = 0x03,
    /// Client → target terminal action
    TerminalAction = 0x04,
    /// Target → client terminal response
    TerminalResponse = 0x05,
    /// Keep-alive echo
    TestDelay = 0x06,
    /// Close with reason
    CloseReason = 0x07,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::LoginRequest),
            0x02 => Some(Self::Hash),
            0x03 => Some(Self::LoginResponse),
            0x04 => Some(Self::TerminalAction),
            0x05 => Some(Self::TerminalResponse),
            0x06 => Some(Self::TestDelay),
            0x07 => Some(Self::CloseReason),
            _ => None,
        }
    }
}

/// Login attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Target peer ID
    pub username: String,
    /// Challenge digest; `None` on the first attempt
    pub password: Option<Bytes>,
    /// Requester's own ID
    pub my_id: String,
    /// Requester's display name
    pub my_name: String,
    /// Nonce unique per open attempt
    pub session_id: u64,
    /// Protocol version
    pub version: String,
}

/// Salt and challenge for the digest login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// Per-password salt
    pub salt: Bytes,
    /// Per-login challenge
    pub challenge: Bytes,
}

/// Information about the target returned on successful login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Local user on the target
    pub username: String,
    /// Hostname of the target
    pub hostname: String,
    /// Operating system of the target
    pub platform: String,
    /// Protocol version of the target
    pub version: String,
}

/// Login result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginResponse {
    /// Login rejected
    Error(String),
    /// Login accepted
    PeerInfo(PeerInfo),
}

/// A chunk of terminal bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalData {
    /// Payload (zstd frame when `compressed`)
    pub data: Bytes,
    /// Whether `data` is compressed
    pub compressed: bool,
}

impl TerminalData {
    /// Uncompressed data chunk
    pub fn raw(data: Bytes) -> Self {
        Self {
            data,
            compressed: false,
        }
    }
}

/// Client → target terminal actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalAction {
    /// Open a terminal
    Open {
        /// Initial size
        size: TerminalSize,
        /// Existing terminal service to reattach to
        service_id: Option<String>,
    },
    /// Input bytes
    Data(TerminalData),
    /// Resize the terminal
    Resize(TerminalSize),
    /// Close the terminal
    Close,
}

/// Target → client terminal responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalResponse {
    /// Result of an `Open` action
    Opened {
        service_id: String,
        success: bool,
        message: Option<String>,
    },
    /// Output bytes
    Data(TerminalData),
    /// Terminal process ended
    Closed { exit_code: Option<i32> },
    /// Terminal-level error
    Error { message: String },
}

/// Keep-alive message; the receiver echoes it unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDelay {
    /// Sender's timestamp in milliseconds
    pub time: u64,
    /// Whether the message originated at the client
    pub from_client: bool,
    /// Last measured round trip in milliseconds
    pub last_delay: u32,
}

/// Session protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    LoginRequest(LoginRequest),
    Hash(AuthChallenge),
    LoginResponse(LoginResponse),
    TerminalAction(TerminalAction),
    TerminalResponse(TerminalResponse),
    TestDelay(TestDelay),
    CloseReason(String),
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::LoginRequest(_) => MessageType::LoginRequest,
            Message::Hash(_) => MessageType::Hash,
            Message::LoginResponse(_) => MessageType::LoginResponse,
            Message::TerminalAction(_) => MessageType::TerminalAction,
            Message::TerminalResponse(_) => MessageType::TerminalResponse,
            Message::TestDelay(_) => MessageType::TestDelay,
            Message::CloseReason(_) => MessageType::CloseReason,
        }
    }

    /// Input data frame
    pub fn input(data: Bytes) -> Self {
        Message::TerminalAction(TerminalAction::Data(TerminalData::raw(data)))
    }
}

impl WireMessage for Message {
    const FAMILY: &'static str = "session";

    fn tag(&self) -> u8 {
        self.message_type().as_u8()
    }

    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let tag = self.tag();
        match self {
            Message::LoginRequest(m) => encode_envelope(tag, m),
            Message::Hash(m) => encode_envelope(tag, m),
            Message::LoginResponse(m) => encode_envelope(tag, m),
            Message::TerminalAction(m) => encode_envelope(tag, m),
            Message::TerminalResponse(m) => encode_envelope(tag, m),
            Message::TestDelay(m) => encode_envelope(tag, m),
            Message::CloseReason(m) => encode_envelope(tag, m),
        }
    }

    fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, body) = split_envelope(src)?;
        let message_type = MessageType::from_u8(tag).ok_or(ProtocolError::UnknownMessageType {
            family: Self::FAMILY,
            tag,
        })?;

        let family = Self::FAMILY;
        Ok(match message_type {
            MessageType::LoginRequest => Message::LoginRequest(decode_body(family, body)?),
            MessageType::Hash => Message::Hash(decode_body(family, body)?),
            MessageType::LoginResponse => Message::LoginResponse(decode_body(family, body)?),
            MessageType::TerminalAction => Message::TerminalAction(decode_body(family, body)?),
            MessageType::TerminalResponse => {
                Message::TerminalResponse(decode_body(family, body)?)
            }
            MessageType::TestDelay => Message::TestDelay(decode_body(family, body)?),
            MessageType::CloseReason => Message::CloseReason(decode_body(family, body)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in [
            MessageType::LoginRequest,
            MessageType::Hash,
            MessageType::LoginResponse,
            MessageType::TerminalAction,
            MessageType::TerminalResponse,
            MessageType::TestDelay,
            MessageType::CloseReason,
        ] {
            let byte = msg_type.as_u8();
            let recovered = MessageType::from_u8(byte).unwrap();
            assert_eq!(recovered, msg_type);
        }
    }

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
    }

    #[test]
    fn test_login_request_password_omitted_vs_empty() {
        let base = LoginRequest {
            username: "alice".to_string(),
            password: None,
            my_id: "bob".to_string(),
            my_name: "Bob".to_string(),
            session_id: 7,
            version: PROTOCOL_VERSION.to_string(),
        };
        let empty = LoginRequest {
            password: Some(Bytes::new()),
            ..base.clone()
        };

        let omitted = Message::decode(&Message::LoginRequest(base).encode().unwrap()).unwrap();
        let present = Message::decode(&Message::LoginRequest(empty).encode().unwrap()).unwrap();

        match (omitted, present) {
            (Message::LoginRequest(a), Message::LoginRequest(b)) => {
                assert_eq!(a.password, None);
                assert_eq!(b.password, Some(Bytes::new()));
            }
            other => panic!("Expected LoginRequest pair, got {:?}", other),
        }
    }

    #[test]
    fn test_data_frame_is_byte_exact() {
        let payload = Bytes::from_static(b"\x1b[31mred\x00\xff");
        let msg = Message::input(payload.clone());
        match Message::decode(&msg.encode().unwrap()).unwrap() {
            Message::TerminalAction(TerminalAction::Data(data)) => {
                assert_eq!(data.data, payload);
                assert!(!data.compressed);
            }
            other => panic!("Expected Data action, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_session_tag() {
        assert!(matches!(
            Message::decode(&[0x7F]),
            Err(ProtocolError::UnknownMessageType { tag: 0x7F, .. })
        ));
    }

    #[test]
    fn test_empty_session_message() {
        assert!(matches!(
            Message::decode(&[]),
            Err(ProtocolError::EmptyMessage)
        ));
    }
}
