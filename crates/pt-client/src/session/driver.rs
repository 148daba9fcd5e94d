//! Task that owns an open session's transport

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use pt_core::{SessionError, Transport, TransportError};
use pt_protocol::{Message, TerminalAction, TerminalResponse, TerminalSize, WireMessage};

use super::handler::{CloseReason, SessionHandler};
use super::login::send_message;
use super::output::OutputDecoder;

/// Requests from the session owner to its driver
#[derive(Debug)]
pub enum SessionCommand {
    /// One input chunk, already split to the chunk size
    Data(Bytes),
    /// New terminal size
    Resize(TerminalSize),
    /// End the session, after the commands queued before it
    Close(CloseReason),
}

/// Streams one open session between the transport and the handler
pub struct SessionDriver {
    target: String,
    transport: Box<dyn Transport>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    handler: Arc<dyn SessionHandler>,
    decoder: OutputDecoder,
}

impl SessionDriver {
    /// Create a driver for an authenticated transport
    pub fn new(
        target: String,
        transport: Box<dyn Transport>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        Self {
            target,
            transport,
            commands,
            handler,
            decoder: OutputDecoder::new(),
        }
    }

    /// Run until either side ends the session, then close the transport.
    ///
    /// Returns why the session ended; reporting it is up to the caller.
    pub async fn run(mut self) -> CloseReason {
        let reason = loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => ControlFlow::Break(CloseReason::Local),
                },
                frame = self.transport.recv() => match frame {
                    Ok(Some(frame)) => self.on_frame(frame).await,
                    Ok(None) => ControlFlow::Break(CloseReason::Remote("connection closed".to_string())),
                    Err(TransportError::Closed(reason)) => ControlFlow::Break(CloseReason::Remote(reason)),
                    Err(e) => ControlFlow::Break(CloseReason::Failed(e.into())),
                },
            };

            if let ControlFlow::Break(reason) = flow {
                break reason;
            }
        };

        tracing::info!("Session with {} ended: {}", self.target, reason);
        self.transport.close(&reason.to_string()).await;
        reason
    }

    async fn send(&mut self, message: Message) -> ControlFlow<CloseReason> {
        match send_message(self.transport.as_mut(), &message).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(CloseReason::Failed(e)),
        }
    }

    async fn on_command(&mut self, command: SessionCommand) -> ControlFlow<CloseReason> {
        match command {
            SessionCommand::Data(chunk) => {
                tracing::trace!("Sending {} input bytes", chunk.len());
                self.send(Message::input(chunk)).await
            }
            SessionCommand::Resize(size) => {
                self.send(Message::TerminalAction(TerminalAction::Resize(size)))
                    .await
            }
            SessionCommand::Close(reason) => {
                let _ = self
                    .send(Message::TerminalAction(TerminalAction::Close))
                    .await;
                ControlFlow::Break(reason)
            }
        }
    }

    async fn on_frame(&mut self, frame: Bytes) -> ControlFlow<CloseReason> {
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Malformed message from {}: {}", self.target, e);
                return ControlFlow::Break(CloseReason::Failed(e.into()));
            }
        };

        match message {
            Message::TerminalResponse(TerminalResponse::Data(data)) => {
                match self.decoder.decode(data) {
                    Ok(output) => {
                        tracing::trace!("Received {} output bytes", output.len());
                        self.handler.on_output(output);
                        ControlFlow::Continue(())
                    }
                    Err(e) => ControlFlow::Break(CloseReason::Failed(SessionError::ProtocolDecode(
                        format!("bad compressed frame: {}", e),
                    ))),
                }
            }
            Message::TestDelay(delay) => self.send(Message::TestDelay(delay)).await,
            Message::TerminalResponse(TerminalResponse::Opened {
                service_id,
                success,
                message,
            }) => {
                if success {
                    tracing::debug!("Terminal {} opened on {}", service_id, self.target);
                    ControlFlow::Continue(())
                } else {
                    let reason = message.unwrap_or_else(|| "terminal open failed".to_string());
                    ControlFlow::Break(CloseReason::Remote(reason))
                }
            }
            Message::TerminalResponse(TerminalResponse::Closed { exit_code }) => {
                let reason = match exit_code {
                    Some(code) => format!("terminal exited with code {}", code),
                    None => "terminal exited".to_string(),
                };
                ControlFlow::Break(CloseReason::Remote(reason))
            }
            Message::TerminalResponse(TerminalResponse::Error { message }) => {
                ControlFlow::Break(CloseReason::Remote(message))
            }
            Message::CloseReason(reason) => ControlFlow::Break(CloseReason::Remote(reason)),
            other => {
                tracing::debug!("Ignoring {:?} on open session", other.message_type());
                ControlFlow::Continue(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DataChannelTransport;
    use pt_protocol::{TerminalData, TestDelay};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        output: Mutex<Vec<Bytes>>,
    }

    impl SessionHandler for Recorder {
        fn on_output(&self, data: Bytes) {
            self.output.lock().unwrap().push(data);
        }

        fn on_close(&self, _reason: CloseReason) {}
    }

    fn start() -> (
        mpsc::UnboundedSender<SessionCommand>,
        DataChannelTransport,
        Arc<Recorder>,
        tokio::task::JoinHandle<CloseReason>,
    ) {
        let (local, remote) = DataChannelTransport::pair();
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder::default());
        let driver = SessionDriver::new("alice".to_string(), Box::new(local), rx, recorder.clone());
        (tx, remote, recorder, tokio::spawn(driver.run()))
    }

    async fn next(remote: &mut DataChannelTransport) -> Message {
        Message::decode(&remote.recv().await.unwrap().unwrap()).unwrap()
    }

    async fn push(remote: &mut DataChannelTransport, message: Message) {
        remote.send(message.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_echoed_unchanged() {
        let (_tx, mut remote, _recorder, _task) = start();
        let delay = TestDelay {
            time: 1234,
            from_client: false,
            last_delay: 17,
        };
        push(&mut remote, Message::TestDelay(delay)).await;
        assert_eq!(next(&mut remote).await, Message::TestDelay(delay));
    }

    #[tokio::test]
    async fn test_output_in_order_and_decompressed() {
        let (_tx, mut remote, recorder, task) = start();
        let compressed = zstd::encode_all(&b"second"[..], 3).unwrap();

        push(
            &mut remote,
            Message::TerminalResponse(TerminalResponse::Data(TerminalData::raw(Bytes::from_static(
                b"first",
            )))),
        )
        .await;
        push(
            &mut remote,
            Message::TerminalResponse(TerminalResponse::Data(TerminalData {
                data: Bytes::from(compressed),
                compressed: true,
            })),
        )
        .await;
        push(
            &mut remote,
            Message::TerminalResponse(TerminalResponse::Closed { exit_code: Some(0) }),
        )
        .await;

        let reason = task.await.unwrap();
        assert_eq!(
            reason,
            CloseReason::Remote("terminal exited with code 0".to_string())
        );
        let output = recorder.output.lock().unwrap().clone();
        assert_eq!(output, vec![Bytes::from("first"), Bytes::from("second")]);
    }

    #[tokio::test]
    async fn test_local_close_flushes_queued_input() {
        let (tx, mut remote, _recorder, task) = start();
        tx.send(SessionCommand::Data(Bytes::from_static(b"ls\n")))
            .unwrap();
        tx.send(SessionCommand::Close(CloseReason::Local)).unwrap();

        assert_eq!(next(&mut remote).await, Message::input(Bytes::from_static(b"ls\n")));
        assert_eq!(
            next(&mut remote).await,
            Message::TerminalAction(TerminalAction::Close)
        );
        assert_eq!(task.await.unwrap(), CloseReason::Local);
    }

    #[tokio::test]
    async fn test_failed_open_ends_session() {
        let (_tx, mut remote, _recorder, task) = start();
        push(
            &mut remote,
            Message::TerminalResponse(TerminalResponse::Opened {
                service_id: String::new(),
                success: false,
                message: Some("shell not allowed".to_string()),
            }),
        )
        .await;
        assert_eq!(
            task.await.unwrap(),
            CloseReason::Remote("shell not allowed".to_string())
        );
    }

    #[tokio::test]
    async fn test_garbage_ends_session() {
        let (_tx, mut remote, _recorder, task) = start();
        remote.send(Bytes::from_static(&[0xEE, 1, 2])).await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            CloseReason::Failed(SessionError::ProtocolDecode(_))
        ));
    }
}
