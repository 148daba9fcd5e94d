//! Terminal session loop
//!
//! After login the client opens a terminal; from then on input, resize and
//! close actions flow in, output and keep-alive messages flow out, until
//! either side ends the session.

use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use pt_client::session::{inflate_into, MAX_INFLATED_SIZE};
use pt_core::{SessionError, Transport};
use pt_protocol::{
    Message, TerminalAction, TerminalData, TerminalResponse, TerminalSize, TestDelay,
};

use super::login::{recv_message, send_message};
use crate::pty::{TerminalBackend, TerminalProcess};

/// Service name reported when the client did not ask for one
pub const DEFAULT_SERVICE: &str = "terminal";

/// Output chunks buffered between the reader task and the session loop
const OUTPUT_QUEUE: usize = 256;

const READ_BUFFER: usize = 4096;

/// Polls spent waiting for an exit code after the output stream ended
const EXIT_POLLS: usize = 20;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Tunables for a terminal session
#[derive(Debug, Clone, Copy)]
pub struct TerminalSettings {
    pub keep_alive_interval: Duration,
    pub compression_threshold: usize,
    /// How long to wait for the client's open action
    pub open_timeout: Duration,
}

/// How a terminal session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The process exited on its own
    Exited(Option<i32>),
    /// The client closed or left
    ClientClosed,
    /// The agent is shutting down
    Shutdown,
    /// The terminal could not be started
    OpenFailed(String),
}

/// Wrap process output for the wire, compressing large chunks
pub fn encode_output(data: Bytes, threshold: usize) -> TerminalData {
    if data.len() < threshold {
        return TerminalData::raw(data);
    }

    match zstd::encode_all(&data[..], 0) {
        Ok(compressed) if compressed.len() < data.len() => TerminalData {
            data: Bytes::from(compressed),
            compressed: true,
        },
        Ok(_) => TerminalData::raw(data),
        Err(e) => {
            tracing::warn!("Output compression failed, sending raw: {}", e);
            TerminalData::raw(data)
        }
    }
}

fn decode_input(data: TerminalData) -> std::io::Result<Bytes> {
    if !data.compressed {
        return Ok(data.data);
    }
    let mut input = Vec::new();
    inflate_into(&data.data, MAX_INFLATED_SIZE, &mut input)?;
    Ok(Bytes::from(input))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wait for the client to open a terminal, then serve it until one side ends
pub async fn serve_terminal<T: Transport + ?Sized>(
    transport: &mut T,
    backend: &dyn TerminalBackend,
    settings: TerminalSettings,
    cancel: &CancellationToken,
) -> Result<SessionEnd, SessionError> {
    let (size, service_id) = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
        opened = tokio::time::timeout(settings.open_timeout, wait_for_open(transport)) => {
            match opened {
                Ok(Ok(Some(open))) => open,
                Ok(Ok(None)) => return Ok(SessionEnd::ClientClosed),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(SessionError::Timeout("terminal open")),
            }
        }
    };
    let service_id = service_id.unwrap_or_else(|| DEFAULT_SERVICE.to_string());

    let mut process = match backend.spawn(size) {
        Ok(process) => process,
        Err(e) => {
            let message = format!("{:#}", e);
            tracing::error!("Failed to start terminal: {}", message);
            let response = TerminalResponse::Opened {
                service_id,
                success: false,
                message: Some(message.clone()),
            };
            send_message(transport, &Message::TerminalResponse(response)).await?;
            return Ok(SessionEnd::OpenFailed(message));
        }
    };

    let reader = match process.take_reader() {
        Ok(reader) => reader,
        Err(e) => {
            process.kill();
            let message = format!("{:#}", e);
            let response = TerminalResponse::Opened {
                service_id,
                success: false,
                message: Some(message.clone()),
            };
            send_message(transport, &Message::TerminalResponse(response)).await?;
            return Ok(SessionEnd::OpenFailed(message));
        }
    };

    let response = TerminalResponse::Opened {
        service_id,
        success: true,
        message: None,
    };
    if let Err(e) = send_message(transport, &Message::TerminalResponse(response)).await {
        process.kill();
        return Err(e);
    }
    tracing::info!("Terminal opened ({}x{}), pid {:?}", size.cols, size.rows, process.pid());

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
    let reader_cancel = CancellationToken::new();
    let reader_task = spawn_output_reader(reader, output_tx, reader_cancel.clone());

    let result = run_open(transport, process.as_mut(), output_rx, settings, cancel).await;

    reader_cancel.cancel();
    if !matches!(result, Ok(SessionEnd::Exited(_))) {
        process.kill();
    }
    // The reader unblocks once the process is gone.
    let _ = tokio::time::timeout(Duration::from_millis(500), reader_task).await;

    result
}

async fn wait_for_open<T: Transport + ?Sized>(
    transport: &mut T,
) -> Result<Option<(TerminalSize, Option<String>)>, SessionError> {
    loop {
        match recv_message(transport).await? {
            Some(Message::TerminalAction(TerminalAction::Open { size, service_id })) => {
                return Ok(Some((size, service_id)))
            }
            Some(Message::TerminalAction(TerminalAction::Close)) | Some(Message::CloseReason(_)) => {
                return Ok(None)
            }
            Some(other) => {
                tracing::debug!("Ignoring {:?} before terminal open", other.message_type());
            }
            None => return Ok(None),
        }
    }
}

async fn run_open<T: Transport + ?Sized>(
    transport: &mut T,
    process: &mut dyn TerminalProcess,
    mut output_rx: mpsc::Receiver<Bytes>,
    settings: TerminalSettings,
    cancel: &CancellationToken,
) -> Result<SessionEnd, SessionError> {
    let period = settings.keep_alive_interval;
    let mut keep_alive = interval_at(Instant::now() + period, period);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_delay = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),

            message = recv_message(transport) => {
                let message = match message {
                    Ok(Some(message)) => message,
                    Ok(None) => return Ok(SessionEnd::ClientClosed),
                    Err(SessionError::Transport(e)) => {
                        tracing::debug!("Client transport ended: {}", e);
                        return Ok(SessionEnd::ClientClosed);
                    }
                    Err(e) => return Err(e),
                };

                match message {
                    Message::TerminalAction(TerminalAction::Data(data)) => {
                        let input = decode_input(data)
                            .map_err(|e| SessionError::ProtocolDecode(e.to_string()))?;
                        tracing::trace!("{} bytes of input", input.len());
                        if let Err(e) = process.write(&input) {
                            tracing::error!("Failed to write input: {:#}", e);
                        }
                    }
                    Message::TerminalAction(TerminalAction::Resize(size)) => {
                        if let Err(e) = process.resize(size) {
                            tracing::error!("Failed to resize terminal: {:#}", e);
                        }
                    }
                    Message::TerminalAction(TerminalAction::Close) => {
                        tracing::info!("Client closed the terminal");
                        return Ok(SessionEnd::ClientClosed);
                    }
                    Message::CloseReason(reason) => {
                        tracing::info!("Client closed: {}", reason);
                        return Ok(SessionEnd::ClientClosed);
                    }
                    Message::TestDelay(delay) if !delay.from_client => {
                        let elapsed = now_millis().saturating_sub(delay.time);
                        last_delay = u32::try_from(elapsed).unwrap_or(u32::MAX);
                        tracing::trace!("Round trip {} ms", last_delay);
                    }
                    other => {
                        tracing::debug!("Ignoring {:?} on open terminal", other.message_type());
                    }
                }
            }

            output = output_rx.recv() => match output {
                Some(chunk) => {
                    let data = encode_output(chunk, settings.compression_threshold);
                    let frame = Message::TerminalResponse(TerminalResponse::Data(data));
                    send_message(transport, &frame).await?;
                }
                None => {
                    let exit_code = wait_for_exit(process).await;
                    tracing::info!("Terminal exited with {:?}", exit_code);
                    let closed = Message::TerminalResponse(TerminalResponse::Closed { exit_code });
                    send_message(transport, &closed).await?;
                    return Ok(SessionEnd::Exited(exit_code));
                }
            },

            _ = keep_alive.tick() => {
                let delay = TestDelay {
                    time: now_millis(),
                    from_client: false,
                    last_delay,
                };
                send_message(transport, &Message::TestDelay(delay)).await?;
            }
        }
    }
}

/// Exit code after the output stream ended; kills the process if it lingers
async fn wait_for_exit(process: &mut dyn TerminalProcess) -> Option<i32> {
    for _ in 0..EXIT_POLLS {
        match process.try_wait() {
            Ok(Some(code)) => return Some(code),
            Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
            Err(e) => {
                tracing::warn!("Failed to poll terminal process: {:#}", e);
                break;
            }
        }
    }
    process.kill()
}

/// Read process output on a blocking thread until EOF or cancellation
fn spawn_output_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER];

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("Terminal output EOF");
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // A PTY master reports EIO once the child side is gone.
                    if !cancel.is_cancelled() {
                        tracing::debug!("Terminal output closed: {}", e);
                    }
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_output_sent_raw() {
        let data = encode_output(Bytes::from_static(b"ls\r\n"), 1024);
        assert!(!data.compressed);
        assert_eq!(data.data, "ls\r\n");
    }

    #[test]
    fn test_large_output_compressed() {
        let payload = Bytes::from(vec![b'a'; 4096]);
        let data = encode_output(payload.clone(), 1024);
        assert!(data.compressed);
        assert!(data.data.len() < payload.len());
        assert_eq!(zstd::decode_all(&data.data[..]).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_oversized_compressed_input_rejected() {
        let bomb = zstd::encode_all(&vec![b'y'; MAX_INFLATED_SIZE + 1][..], 3).unwrap();
        let input = TerminalData {
            data: Bytes::from(bomb),
            compressed: true,
        };
        assert!(decode_input(input).is_err());

        let small = encode_output(Bytes::from(vec![b'y'; 4096]), 1024);
        assert_eq!(decode_input(small).unwrap().len(), 4096);
    }

    #[test]
    fn test_incompressible_output_sent_raw() {
        let payload = pt_core::auth::random_bytes(2048);
        let data = encode_output(payload.clone(), 1024);
        assert!(!data.compressed);
        assert_eq!(data.data, payload);
    }
}
