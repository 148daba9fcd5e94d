//! Challenge/digest login over an established transport

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use pt_core::auth::password_digest;
use pt_core::{SessionError, SessionNonce, Transport, TransportError};
use pt_protocol::{LoginRequest, LoginResponse, Message, PeerInfo, WireMessage, PROTOCOL_VERSION};

use super::handler::PasswordProvider;

/// Identity and deadline for one login
#[derive(Debug, Clone)]
pub struct LoginParams {
    /// Peer being logged into
    pub target: String,
    /// Our own peer ID
    pub my_id: String,
    /// Our display name
    pub my_name: String,
    /// Nonce of this open attempt
    pub nonce: SessionNonce,
    /// Deadline for the server's answer to each request we send.
    ///
    /// Keep-alives and ignored messages do not extend it.
    pub timeout: Duration,
}

impl LoginParams {
    fn request(&self, password: Option<Bytes>) -> LoginRequest {
        LoginRequest {
            username: self.target.clone(),
            password,
            my_id: self.my_id.clone(),
            my_name: self.my_name.clone(),
            session_id: self.nonce.0,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Send one session message
pub(crate) async fn send_message<T>(transport: &mut T, message: &Message) -> Result<(), SessionError>
where
    T: Transport + ?Sized,
{
    let frame = message.encode()?;
    transport.send(frame).await?;
    Ok(())
}

async fn recv_message<T>(
    transport: &mut T,
    deadline: Instant,
    what: &'static str,
) -> Result<Message, SessionError>
where
    T: Transport + ?Sized,
{
    match tokio::time::timeout_at(deadline, transport.recv()).await {
        Ok(Ok(Some(frame))) => Ok(Message::decode(&frame)?),
        Ok(Ok(None)) => Err(TransportError::Closed("connection closed during login".into()).into()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SessionError::Timeout(what)),
    }
}

/// Log in to the target.
///
/// The first request carries no password. A challenge is answered once
/// with the digest of the provided password; a second challenge fails the
/// login without asking again.
pub async fn login<T>(
    transport: &mut T,
    params: &LoginParams,
    passwords: &dyn PasswordProvider,
) -> Result<PeerInfo, SessionError>
where
    T: Transport + ?Sized,
{
    send_message(transport, &Message::LoginRequest(params.request(None))).await?;
    let mut deadline = Instant::now() + params.timeout;

    let mut digest_sent = false;
    loop {
        match recv_message(transport, deadline, "login response").await? {
            Message::Hash(challenge) => {
                if digest_sent {
                    return Err(SessionError::AuthFailure("challenge repeated".to_string()));
                }

                let prompt = format!("Password for {}: ", params.target);
                let password = passwords
                    .password(&prompt)
                    .await
                    .ok_or_else(|| SessionError::AuthFailure("no password given".to_string()))?;

                let digest = password_digest(&password, &challenge.salt, &challenge.challenge);
                digest_sent = true;
                let request = params.request(Some(Bytes::copy_from_slice(&digest)));
                send_message(transport, &Message::LoginRequest(request)).await?;
                deadline = Instant::now() + params.timeout;
            }
            Message::LoginResponse(LoginResponse::PeerInfo(peer)) => {
                tracing::debug!("Logged in to {} ({}@{})", params.target, peer.username, peer.hostname);
                return Ok(peer);
            }
            Message::LoginResponse(LoginResponse::Error(reason)) => {
                return Err(SessionError::AuthFailure(reason));
            }
            Message::TestDelay(delay) => {
                send_message(transport, &Message::TestDelay(delay)).await?;
            }
            Message::CloseReason(reason) => {
                return Err(TransportError::Closed(reason).into());
            }
            other => {
                tracing::debug!("Ignoring {:?} during login", other.message_type());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DataChannelTransport;
    use pt_protocol::{AuthChallenge, TestDelay};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingPassword {
        password: &'static str,
        asked: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl PasswordProvider for CountingPassword {
        async fn password(&self, _prompt: &str) -> Option<String> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Some(self.password.to_string())
        }
    }

    fn params() -> LoginParams {
        LoginParams {
            target: "alice".to_string(),
            my_id: "bob".to_string(),
            my_name: "bob-laptop".to_string(),
            nonce: SessionNonce(7),
            timeout: Duration::from_secs(5),
        }
    }

    fn peer_info() -> PeerInfo {
        PeerInfo {
            username: "alice".to_string(),
            hostname: "alice-host".to_string(),
            platform: "linux".to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    async fn next(server: &mut DataChannelTransport) -> Message {
        Message::decode(&server.recv().await.unwrap().unwrap()).unwrap()
    }

    fn challenge() -> Message {
        Message::Hash(AuthChallenge {
            salt: Bytes::from_static(b"s1"),
            challenge: Bytes::from_static(b"c1"),
        })
    }

    #[tokio::test]
    async fn test_login_without_challenge() {
        let (mut client, mut server) = DataChannelTransport::pair();
        let asked = Arc::new(AtomicUsize::new(0));
        let passwords = CountingPassword {
            password: "pw",
            asked: Arc::clone(&asked),
        };

        let server_task = tokio::spawn(async move {
            match next(&mut server).await {
                Message::LoginRequest(request) => {
                    assert_eq!(request.username, "alice");
                    assert_eq!(request.session_id, 7);
                    assert!(request.password.is_none());
                }
                other => panic!("Expected LoginRequest, got {:?}", other),
            }
            send_message(
                &mut server,
                &Message::LoginResponse(LoginResponse::PeerInfo(peer_info())),
            )
            .await
            .unwrap();
        });

        let peer = login(&mut client, &params(), &passwords).await.unwrap();
        assert_eq!(peer, peer_info());
        assert_eq!(asked.load(Ordering::SeqCst), 0);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_challenge_answered_with_digest() {
        let (mut client, mut server) = DataChannelTransport::pair();
        let asked = Arc::new(AtomicUsize::new(0));
        let passwords = CountingPassword {
            password: "pw",
            asked: Arc::clone(&asked),
        };

        let server_task = tokio::spawn(async move {
            let _first = next(&mut server).await;
            send_message(&mut server, &challenge()).await.unwrap();

            match next(&mut server).await {
                Message::LoginRequest(request) => {
                    let expected = password_digest("pw", b"s1", b"c1");
                    assert_eq!(request.password.as_deref(), Some(&expected[..]));
                }
                other => panic!("Expected LoginRequest, got {:?}", other),
            }
            send_message(
                &mut server,
                &Message::LoginResponse(LoginResponse::PeerInfo(peer_info())),
            )
            .await
            .unwrap();
        });

        login(&mut client, &params(), &passwords).await.unwrap();
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_challenge_is_final() {
        let (mut client, mut server) = DataChannelTransport::pair();
        let asked = Arc::new(AtomicUsize::new(0));
        let passwords = CountingPassword {
            password: "wrong",
            asked: Arc::clone(&asked),
        };

        tokio::spawn(async move {
            let _first = next(&mut server).await;
            send_message(&mut server, &challenge()).await.unwrap();
            let _second = next(&mut server).await;
            send_message(&mut server, &challenge()).await.unwrap();
            // keep the channel open until the client gives up
            let _ = server.recv().await;
        });

        let result = login(&mut client, &params(), &passwords).await;
        assert!(matches!(result, Err(SessionError::AuthFailure(_))));
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_error_response() {
        let (mut client, mut server) = DataChannelTransport::pair();
        tokio::spawn(async move {
            let _first = next(&mut server).await;
            send_message(
                &mut server,
                &Message::LoginResponse(LoginResponse::Error("Wrong password".to_string())),
            )
            .await
            .unwrap();
            let _ = server.recv().await;
        });

        let result = login(&mut client, &params(), &"pw".to_string()).await;
        assert_eq!(
            result,
            Err(SessionError::AuthFailure("Wrong password".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alives_do_not_extend_deadline() {
        let (mut client, mut server) = DataChannelTransport::pair();
        tokio::spawn(async move {
            let _first = next(&mut server).await;
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let delay = Message::TestDelay(TestDelay {
                    time: 1,
                    from_client: false,
                    last_delay: 0,
                });
                if send_message(&mut server, &delay).await.is_err() {
                    break;
                }
                // the echo, or None once the client gave up
                if server.recv().await.ok().flatten().is_none() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let result = login(&mut client, &params(), &"pw".to_string()).await;
        assert_eq!(result, Err(SessionError::Timeout("login response")));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (mut client, _server) = DataChannelTransport::pair();
        let result = login(&mut client, &params(), &"pw".to_string()).await;
        assert_eq!(result, Err(SessionError::Timeout("login response")));
    }
}
