//! Server side of the login handshake

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use pt_core::types::local_identity;
use pt_core::{SessionError, Transport, TransportError};
use pt_protocol::{LoginRequest, LoginResponse, Message, PeerInfo, WireMessage, PROTOCOL_VERSION};

use super::gate::PasswordGate;

/// Rejection sent when the digest does not match
pub const WRONG_PASSWORD: &str = "Wrong password";

pub(crate) async fn send_message<T: Transport + ?Sized>(
    transport: &mut T,
    message: &Message,
) -> Result<(), SessionError> {
    let frame = message.encode()?;
    transport.send(frame).await?;
    Ok(())
}

/// Next session message; `Ok(None)` on a clean close
pub(crate) async fn recv_message<T: Transport + ?Sized>(
    transport: &mut T,
) -> Result<Option<Message>, SessionError> {
    match transport.recv().await? {
        Some(frame) => Ok(Some(Message::decode(&frame)?)),
        None => Ok(None),
    }
}

/// Information we report about ourselves after a successful login
pub fn local_peer_info() -> PeerInfo {
    let (username, hostname, platform) = local_identity();
    PeerInfo {
        username,
        hostname,
        platform,
        version: PROTOCOL_VERSION.to_string(),
    }
}

/// Run the login handshake with a connecting client.
///
/// Without a configured password the first request is accepted. Otherwise
/// the client gets one challenge and one chance to answer it; a wrong or
/// missing digest is answered with an error and ends the session.
///
/// `timeout` bounds the wait for the first request and, separately, for
/// the answer to the challenge. Other messages do not extend either.
pub async fn accept_login<T: Transport + ?Sized>(
    transport: &mut T,
    gate: &PasswordGate,
    timeout: Duration,
) -> Result<LoginRequest, SessionError> {
    let mut issued: Option<Bytes> = None;
    let mut deadline = Instant::now() + timeout;

    loop {
        let message = match tokio::time::timeout_at(deadline, recv_message(transport)).await {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => {
                return Err(TransportError::Closed("client left during login".into()).into())
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SessionError::Timeout("login request")),
        };

        let request = match message {
            Message::LoginRequest(request) => request,
            Message::CloseReason(reason) => return Err(TransportError::Closed(reason).into()),
            other => {
                tracing::debug!("Ignoring {:?} before login", other.message_type());
                continue;
            }
        };

        if !gate.requires_password() {
            return accept(transport, request).await;
        }

        let Some(challenge) = issued.clone() else {
            let challenge = gate.challenge();
            issued = Some(challenge.challenge.clone());
            tracing::debug!("Challenging {}", request.my_id);
            send_message(transport, &Message::Hash(challenge)).await?;
            deadline = Instant::now() + timeout;
            continue;
        };

        let verified = request
            .password
            .as_deref()
            .map(|digest| gate.verify(&challenge, digest));
        return match verified {
            Some(true) => accept(transport, request).await,
            Some(false) => {
                tracing::warn!("Wrong password from {}", request.my_id);
                reject(transport, WRONG_PASSWORD).await
            }
            None => reject(transport, "Password required").await,
        };
    }
}

async fn accept<T: Transport + ?Sized>(
    transport: &mut T,
    request: LoginRequest,
) -> Result<LoginRequest, SessionError> {
    tracing::info!("{} ({}) logged in", request.my_id, request.my_name);
    let response = LoginResponse::PeerInfo(local_peer_info());
    send_message(transport, &Message::LoginResponse(response)).await?;
    Ok(request)
}

async fn reject<T: Transport + ?Sized>(
    transport: &mut T,
    reason: &str,
) -> Result<LoginRequest, SessionError> {
    let response = LoginResponse::Error(reason.to_string());
    send_message(transport, &Message::LoginResponse(response)).await?;
    Err(SessionError::AuthFailure(reason.to_string()))
}
