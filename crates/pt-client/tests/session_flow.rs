//! Client session integration tests
//!
//! A real rendezvous server on a loopback port, a scripted target peer
//! ("alice") that registers and serves the login challenge, and a
//! `TerminalClient` ("bob") opening sessions to it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use pt_client::session::{CloseReason, PasswordProvider};
use pt_client::transport::{DataChannelTransport, DirectConnector, PendingOffer, WebSocketTransport};
use pt_client::{RendezvousClient, SessionHandler, SessionState, TerminalClient};
use pt_core::auth::{salted_password, verify_digest};
use pt_core::config::{ClientConfig, IceServer, RendezvousConfig, MAX_CHUNK_SIZE};
use pt_core::{SessionError, Transport, TransportError, TransportKind};
use pt_protocol::{
    AuthChallenge, LoginRequest, LoginResponse, Message, PeerInfo, RelayGrant, RelayResponse,
    RendezvousMessage, TerminalAction, TerminalResponse, TerminalSize, TestDelay, WireMessage,
    PROTOCOL_VERSION,
};
use pt_rendezvous::RendezvousServer;

const STEP: Duration = Duration::from_secs(5);

async fn start_server() -> (String, CancellationToken) {
    let config = RendezvousConfig {
        bind_address: "127.0.0.1:0".to_string(),
        direct_answer_timeout: Duration::from_secs(2),
        ..RendezvousConfig::default()
    };
    let cancel = CancellationToken::new();
    let server = RendezvousServer::bind(config, cancel.clone())
        .await
        .expect("Failed to bind server");
    let url = format!("ws://{}/rendezvous", server.local_addr());
    tokio::spawn(server.run());
    (url, cancel)
}

// ----------------------------------------------------------------------------
// Scripted target peer
// ----------------------------------------------------------------------------

/// One session served by the fake target, after login
struct PeerSession {
    /// Digest login request that was accepted
    login: LoginRequest,
    /// Messages bob sent after login
    inbound: mpsc::UnboundedReceiver<Message>,
    /// Messages to push to bob
    outbound: mpsc::UnboundedSender<Message>,
}

impl PeerSession {
    async fn next(&mut self) -> Message {
        timeout(STEP, self.inbound.recv())
            .await
            .expect("Timed out waiting for bob")
            .expect("Session ended")
    }

    fn push(&self, message: Message) {
        self.outbound.send(message).expect("Session ended");
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DirectPolicy {
    /// Reply to offers with an answer and serve the data channel
    Answer,
    /// Reply to offers without an answer
    Decline,
}

struct FakePeer {
    sessions: mpsc::UnboundedReceiver<PeerSession>,
    claims: Arc<Mutex<Vec<Option<String>>>>,
}

const SALT: &[u8] = b"s1";
const CHALLENGE: &[u8] = b"c1";

/// Register `id` and serve every claim it is sent
async fn spawn_peer(
    url: &str,
    id: &str,
    password: &'static str,
    policy: DirectPolicy,
    mut direct: mpsc::UnboundedReceiver<DataChannelTransport>,
) -> FakePeer {
    let mut rendezvous = RendezvousClient::connect(url, STEP).await.unwrap();
    let response = rendezvous
        .register(id, Bytes::from_static(b"uuid"))
        .await
        .unwrap();
    assert!(response.accepted);

    let (session_tx, sessions) = mpsc::unbounded_channel();
    let claims = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&claims);
    let id = id.to_string();

    tokio::spawn(async move {
        while let Ok(Some(message)) = rendezvous.recv().await {
            let RendezvousMessage::RequestRelay(claim) = message else {
                continue;
            };
            seen.lock().unwrap().push(claim.offer.clone());

            let transport: Box<dyn Transport> = match (&claim.offer, policy) {
                (Some(_), DirectPolicy::Answer) => {
                    rendezvous
                        .send(RendezvousMessage::RelayResponse(RelayResponse {
                            token: claim.token,
                            answer: Some("memory-answer".to_string()),
                        }))
                        .await
                        .unwrap();
                    Box::new(direct.recv().await.unwrap())
                }
                (offer, _) => {
                    if offer.is_some() {
                        rendezvous
                            .send(RendezvousMessage::RelayResponse(RelayResponse {
                                token: claim.token,
                                answer: None,
                            }))
                            .await
                            .unwrap();
                    }
                    let grant = RelayGrant {
                        token: claim.token,
                        relay_server: claim.relay_server.clone(),
                        answer: None,
                    };
                    Box::new(WebSocketTransport::connect_relay(&grant, &id).await.unwrap())
                }
            };

            tokio::spawn(serve_session(transport, password, session_tx.clone()));
        }
    });

    FakePeer { sessions, claims }
}

async fn recv_message(transport: &mut dyn Transport) -> Option<Message> {
    match transport.recv().await {
        Ok(Some(frame)) => Some(Message::decode(&frame).unwrap()),
        _ => None,
    }
}

async fn send_message(transport: &mut dyn Transport, message: Message) {
    let _ = transport.send(message.encode().unwrap()).await;
}

async fn serve_session(
    mut transport: Box<dyn Transport>,
    password: &'static str,
    sessions: mpsc::UnboundedSender<PeerSession>,
) {
    match recv_message(transport.as_mut()).await {
        Some(Message::LoginRequest(request)) => assert!(request.password.is_none()),
        other => panic!("Expected first LoginRequest, got {:?}", other),
    }

    send_message(
        transport.as_mut(),
        Message::Hash(AuthChallenge {
            salt: Bytes::from_static(SALT),
            challenge: Bytes::from_static(CHALLENGE),
        }),
    )
    .await;

    let login = match recv_message(transport.as_mut()).await {
        Some(Message::LoginRequest(request)) => request,
        _ => return,
    };
    let digest = login.password.clone().unwrap_or_default();
    if !verify_digest(&salted_password(password, SALT), CHALLENGE, &digest) {
        send_message(
            transport.as_mut(),
            Message::LoginResponse(LoginResponse::Error("Wrong password".to_string())),
        )
        .await;
        return;
    }

    send_message(
        transport.as_mut(),
        Message::LoginResponse(LoginResponse::PeerInfo(PeerInfo {
            username: "alice".to_string(),
            hostname: "alice-host".to_string(),
            platform: "linux".to_string(),
            version: PROTOCOL_VERSION.to_string(),
        })),
    )
    .await;

    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let _ = sessions.send(PeerSession {
        login,
        inbound,
        outbound,
    });

    loop {
        tokio::select! {
            message = recv_message(transport.as_mut()) => match message {
                Some(message) => {
                    if inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                None => break,
            },
            Some(message) = outbound_rx.recv() => send_message(transport.as_mut(), message).await,
        }
    }
}

// ----------------------------------------------------------------------------
// Client side helpers
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Recorder {
    output: Mutex<Vec<Bytes>>,
    opened: Mutex<Vec<TransportKind>>,
    closed: Mutex<Vec<CloseReason>>,
    notify: Notify,
}

impl SessionHandler for Recorder {
    fn on_output(&self, data: Bytes) {
        self.output.lock().unwrap().push(data);
        self.notify.notify_waiters();
    }

    fn on_open(&self, _peer: &PeerInfo, transport: TransportKind) {
        self.opened.lock().unwrap().push(transport);
        self.notify.notify_waiters();
    }

    fn on_close(&self, reason: CloseReason) {
        self.closed.lock().unwrap().push(reason);
        self.notify.notify_waiters();
    }
}

impl Recorder {
    /// Wait until `check` holds
    async fn wait_for(&self, check: impl Fn(&Recorder) -> bool) {
        timeout(STEP, async {
            loop {
                let notified = self.notify.notified();
                if check(self) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("Condition not reached");
    }
}

fn client_config(url: &str) -> ClientConfig {
    ClientConfig {
        rendezvous_url: url.to_string(),
        request_timeout: STEP,
        login_timeout: STEP,
        my_id: "bob".to_string(),
        my_name: "bob-laptop".to_string(),
        ..ClientConfig::default()
    }
}

fn bob(config: ClientConfig, password: &str) -> (TerminalClient, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let client = TerminalClient::new(config, recorder.clone(), Arc::new(password.to_string()));
    (client, recorder)
}

async fn relay_peer(url: &str, password: &'static str) -> FakePeer {
    let (_tx, rx) = mpsc::unbounded_channel();
    spawn_peer(url, "alice", password, DirectPolicy::Decline, rx).await
}

async fn next_session(alice: &mut FakePeer) -> PeerSession {
    timeout(STEP, alice.sessions.recv())
        .await
        .expect("Timed out waiting for session")
        .expect("Peer stopped")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_alice_bob_relay_session() {
    let (url, _server) = start_server().await;
    let mut alice = relay_peer(&url, "pw").await;
    let (client, recorder) = bob(client_config(&url), "pw");

    let peer = client.open("alice", TerminalSize::new(24, 80)).await.unwrap();
    assert_eq!(peer.hostname, "alice-host");
    assert_eq!(client.state(), SessionState::Open);

    let mut session = next_session(&mut alice).await;
    assert_eq!(session.login.username, "alice");
    assert_eq!(session.login.my_id, "bob");
    assert_eq!(
        session.next().await,
        Message::TerminalAction(TerminalAction::Open {
            size: TerminalSize::new(24, 80),
            service_id: None,
        })
    );

    client.send(Bytes::from_static(b"ls\n")).unwrap();
    assert_eq!(session.next().await, Message::input(Bytes::from_static(b"ls\n")));

    session.push(Message::TerminalResponse(TerminalResponse::Data(
        pt_protocol::TerminalData::raw(Bytes::from_static(b"README.md\r\n")),
    )));
    recorder
        .wait_for(|r| r.output.lock().unwrap().len() == 1)
        .await;
    assert_eq!(recorder.output.lock().unwrap()[0], "README.md\r\n");
    assert_eq!(recorder.opened.lock().unwrap().as_slice(), &[TransportKind::Relay]);

    // nothing else arrived for the single send
    assert!(session.inbound.try_recv().is_err());
}

#[tokio::test]
async fn test_keep_alive_echoed_over_relay() {
    let (url, _server) = start_server().await;
    let mut alice = relay_peer(&url, "pw").await;
    let (client, _recorder) = bob(client_config(&url), "pw");

    client.open("alice", TerminalSize::default()).await.unwrap();
    let mut session = next_session(&mut alice).await;
    let _open = session.next().await;

    let delay = TestDelay {
        time: 99,
        from_client: false,
        last_delay: 12,
    };
    session.push(Message::TestDelay(delay));
    assert_eq!(session.next().await, Message::TestDelay(delay));
}

#[tokio::test]
async fn test_large_send_arrives_as_ordered_chunks() {
    let (url, _server) = start_server().await;
    let mut alice = relay_peer(&url, "pw").await;
    let (client, _recorder) = bob(client_config(&url), "pw");

    client.open("alice", TerminalSize::default()).await.unwrap();
    let mut session = next_session(&mut alice).await;
    let _open = session.next().await;

    let payload: Vec<u8> = (0..150 * 1024).map(|i| (i % 251) as u8).collect();
    client.send(Bytes::from(payload.clone())).unwrap();

    let mut received = Vec::new();
    let mut chunks = 0;
    while received.len() < payload.len() {
        match session.next().await {
            Message::TerminalAction(TerminalAction::Data(data)) => {
                assert!(data.data.len() <= 46 * 1024);
                received.extend_from_slice(&data.data);
                chunks += 1;
            }
            other => panic!("Expected data, got {:?}", other),
        }
    }

    assert_eq!(received, payload);
    assert_eq!(chunks, 4);
}

#[tokio::test]
async fn test_oversized_chunk_size_is_clamped() {
    let (url, _server) = start_server().await;
    let mut alice = relay_peer(&url, "pw").await;
    let config = ClientConfig {
        chunk_size: 2 * 1024 * 1024,
        ..client_config(&url)
    };
    let (client, recorder) = bob(config, "pw");

    client.open("alice", TerminalSize::default()).await.unwrap();
    let mut session = next_session(&mut alice).await;
    let _open = session.next().await;

    let payload: Vec<u8> = (0..1536 * 1024).map(|i| (i % 253) as u8).collect();
    client.send(Bytes::from(payload.clone())).unwrap();

    let mut received = Vec::new();
    while received.len() < payload.len() {
        match session.next().await {
            Message::TerminalAction(TerminalAction::Data(data)) => {
                assert!(data.data.len() <= MAX_CHUNK_SIZE);
                received.extend_from_slice(&data.data);
            }
            other => panic!("Expected data, got {:?}", other),
        }
    }

    assert_eq!(received, payload);
    assert_eq!(client.state(), SessionState::Open);
    assert!(recorder.closed.lock().unwrap().is_empty());
}

/// Never answers; reports when it was asked
struct PendingPassword {
    asked: Notify,
}

#[async_trait]
impl PasswordProvider for PendingPassword {
    async fn password(&self, _prompt: &str) -> Option<String> {
        self.asked.notify_one();
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_close_while_password_pending_cancels_open() {
    let (url, _server) = start_server().await;
    let _alice = relay_peer(&url, "pw").await;
    let passwords = Arc::new(PendingPassword {
        asked: Notify::new(),
    });
    let recorder = Arc::new(Recorder::default());
    let client = Arc::new(TerminalClient::new(
        client_config(&url),
        recorder.clone(),
        passwords.clone(),
    ));

    let opening = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.open("alice", TerminalSize::default()).await }
    });
    timeout(STEP, passwords.asked.notified())
        .await
        .expect("Password never requested");
    assert_eq!(client.state(), SessionState::Authenticating);

    client.close().await;
    let result = timeout(STEP, opening)
        .await
        .expect("Open did not resolve after close")
        .unwrap();

    assert_eq!(result, Err(SessionError::Cancelled));
    assert_eq!(client.state(), SessionState::Closed);
    assert!(recorder.opened.lock().unwrap().is_empty());
    assert!(recorder.closed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_wrong_password_never_opens() {
    let (url, _server) = start_server().await;
    let _alice = relay_peer(&url, "pw").await;
    let (client, recorder) = bob(client_config(&url), "not-pw");

    let result = client.open("alice", TerminalSize::default()).await;
    assert_eq!(
        result,
        Err(SessionError::AuthFailure("Wrong password".to_string()))
    );
    assert_eq!(client.state(), SessionState::Idle);
    assert!(recorder.opened.lock().unwrap().is_empty());
    assert!(recorder.closed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_offline_target_fails_without_timeout() {
    let (url, _server) = start_server().await;
    let (client, _recorder) = bob(client_config(&url), "pw");

    let result = timeout(STEP, client.open("nobody", TerminalSize::default()))
        .await
        .expect("punch hole should fail within one round trip");
    assert_eq!(result, Err(SessionError::NotFound("nobody".to_string())));
    assert_eq!(client.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_close_twice_reports_once() {
    let (url, _server) = start_server().await;
    let mut alice = relay_peer(&url, "pw").await;
    let (client, recorder) = bob(client_config(&url), "pw");

    client.open("alice", TerminalSize::default()).await.unwrap();
    let mut session = next_session(&mut alice).await;
    let _open = session.next().await;

    client.close().await;
    client.close().await;

    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(recorder.closed.lock().unwrap().as_slice(), &[CloseReason::Local]);
    assert_eq!(
        session.next().await,
        Message::TerminalAction(TerminalAction::Close)
    );
    assert_eq!(client.send(Bytes::from_static(b"x")), Err(SessionError::NotOpen));
}

#[tokio::test]
async fn test_remote_exit_closes_session() {
    let (url, _server) = start_server().await;
    let mut alice = relay_peer(&url, "pw").await;
    let (client, recorder) = bob(client_config(&url), "pw");

    client.open("alice", TerminalSize::default()).await.unwrap();
    let session = next_session(&mut alice).await;
    session.push(Message::TerminalResponse(TerminalResponse::Closed {
        exit_code: Some(0),
    }));

    recorder
        .wait_for(|r| !r.closed.lock().unwrap().is_empty())
        .await;
    assert_eq!(
        recorder.closed.lock().unwrap().as_slice(),
        &[CloseReason::Remote("terminal exited with code 0".to_string())]
    );
    assert_eq!(client.state(), SessionState::Closed);

    client.close().await;
    assert_eq!(recorder.closed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_new_open_supersedes_open_session() {
    let (url, _server) = start_server().await;
    let mut alice = relay_peer(&url, "pw").await;
    let (client, recorder) = bob(client_config(&url), "pw");

    client.open("alice", TerminalSize::default()).await.unwrap();
    let first_session = next_session(&mut alice).await;
    client.open("alice", TerminalSize::default()).await.unwrap();
    let second_session = next_session(&mut alice).await;

    assert_eq!(client.state(), SessionState::Open);
    assert_eq!(
        recorder.closed.lock().unwrap().as_slice(),
        &[CloseReason::Failed(SessionError::Superseded)]
    );
    assert_ne!(first_session.login.session_id, second_session.login.session_id);
}

// ----------------------------------------------------------------------------
// Direct data channel
// ----------------------------------------------------------------------------

/// Data channel "ICE stack" joining bob to the fake peer in memory
struct MemoryConnector {
    to_peer: mpsc::UnboundedSender<DataChannelTransport>,
}

struct MemoryOffer {
    to_peer: mpsc::UnboundedSender<DataChannelTransport>,
}

#[async_trait]
impl DirectConnector for MemoryConnector {
    async fn create_offer(
        &self,
        _ice_server: Option<&IceServer>,
    ) -> Result<Box<dyn PendingOffer>, TransportError> {
        Ok(Box::new(MemoryOffer {
            to_peer: self.to_peer.clone(),
        }))
    }
}

#[async_trait]
impl PendingOffer for MemoryOffer {
    async fn gathering_complete(&mut self) {}

    async fn local_description(&self) -> Option<String> {
        Some("memory-offer".to_string())
    }

    async fn accept(self: Box<Self>, answer: &str) -> Result<Box<dyn Transport>, TransportError> {
        if answer != "memory-answer" {
            return Err(TransportError::ConnectFailed(format!("unexpected answer {}", answer)));
        }
        let (local, remote) = DataChannelTransport::pair();
        self.to_peer
            .send(remote)
            .map_err(|_| TransportError::ConnectFailed("peer gone".to_string()))?;
        Ok(Box::new(local))
    }
}

fn direct_config(url: &str) -> ClientConfig {
    ClientConfig {
        p2p: true,
        ..client_config(url)
    }
}

#[tokio::test]
async fn test_direct_channel_used_when_answered() {
    let (url, _server) = start_server().await;
    let (to_peer, from_bob) = mpsc::unbounded_channel();
    let mut alice = spawn_peer(&url, "alice", "pw", DirectPolicy::Answer, from_bob).await;

    let (client, recorder) = bob(direct_config(&url), "pw");
    let client = client.with_direct_connector(Arc::new(MemoryConnector { to_peer }));

    client.open("alice", TerminalSize::default()).await.unwrap();
    let mut session = next_session(&mut alice).await;
    let _open = session.next().await;

    client.send(Bytes::from_static(b"whoami\n")).unwrap();
    assert_eq!(session.next().await, Message::input(Bytes::from_static(b"whoami\n")));

    recorder
        .wait_for(|r| !r.opened.lock().unwrap().is_empty())
        .await;
    assert_eq!(recorder.opened.lock().unwrap().as_slice(), &[TransportKind::Direct]);
    assert_eq!(
        alice.claims.lock().unwrap().as_slice(),
        &[Some("memory-offer".to_string())]
    );
}

#[tokio::test]
async fn test_declined_offer_falls_back_to_relay() {
    let (url, _server) = start_server().await;
    let (to_peer, from_bob) = mpsc::unbounded_channel();
    let mut alice = spawn_peer(&url, "alice", "pw", DirectPolicy::Decline, from_bob).await;

    let (client, recorder) = bob(direct_config(&url), "pw");
    let client = client.with_direct_connector(Arc::new(MemoryConnector { to_peer }));

    client.open("alice", TerminalSize::default()).await.unwrap();
    let _session = next_session(&mut alice).await;

    recorder
        .wait_for(|r| !r.opened.lock().unwrap().is_empty())
        .await;
    assert_eq!(recorder.opened.lock().unwrap().as_slice(), &[TransportKind::Relay]);
}

#[tokio::test]
async fn test_relay_only_sends_no_offer() {
    let (url, _server) = start_server().await;
    let (to_peer, from_bob) = mpsc::unbounded_channel();
    let mut alice = spawn_peer(&url, "alice", "pw", DirectPolicy::Answer, from_bob).await;

    let config = ClientConfig {
        relay_only: true,
        ..direct_config(&url)
    };
    let (client, recorder) = bob(config, "pw");
    let client = client.with_direct_connector(Arc::new(MemoryConnector { to_peer }));

    client.open("alice", TerminalSize::default()).await.unwrap();
    let _session = next_session(&mut alice).await;

    recorder
        .wait_for(|r| !r.opened.lock().unwrap().is_empty())
        .await;
    assert_eq!(recorder.opened.lock().unwrap().as_slice(), &[TransportKind::Relay]);
    assert_eq!(alice.claims.lock().unwrap().as_slice(), &[None]);
}
