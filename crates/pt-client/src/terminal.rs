//! Interactive raw-mode terminal bound to a [`TerminalClient`]

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use crossterm::event::{KeyCode, KeyModifiers};
use tokio::sync::mpsc;

use pt_protocol::TerminalSize;

use crate::session::{CloseReason, PasswordProvider, SessionHandler, TerminalClient};

/// Writes session output to stdout and reports the close
pub struct StdoutSink {
    closed: mpsc::UnboundedSender<CloseReason>,
}

impl StdoutSink {
    /// Sink plus the receiver that yields the close reason
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CloseReason>) {
        let (closed, rx) = mpsc::unbounded_channel();
        (Self { closed }, rx)
    }
}

impl SessionHandler for StdoutSink {
    fn on_output(&self, data: Bytes) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(&data).and_then(|()| stdout.flush()) {
            tracing::debug!("Failed to write terminal output: {}", e);
        }
    }

    fn on_close(&self, reason: CloseReason) {
        let _ = self.closed.send(reason);
    }
}

/// Asks for the password on the controlling terminal without echo
pub struct PromptPassword;

#[async_trait]
impl PasswordProvider for PromptPassword {
    async fn password(&self, prompt: &str) -> Option<String> {
        let prompt = prompt.to_string();
        match tokio::task::spawn_blocking(move || read_hidden(&prompt)).await {
            Ok(Ok(password)) => password,
            Ok(Err(e)) => {
                tracing::warn!("Could not read password: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("Password prompt failed: {}", e);
                None
            }
        }
    }
}

/// Read one line with echo off; `None` on Esc or Ctrl+C
fn read_hidden(prompt: &str) -> std::io::Result<Option<String>> {
    use crossterm::event::{self, Event, KeyEvent, KeyEventKind};
    use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

    let mut stderr = std::io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;

    enable_raw_mode()?;
    let read = || -> std::io::Result<Option<String>> {
        let mut password = String::new();
        loop {
            let Event::Key(KeyEvent {
                code,
                modifiers,
                kind,
                ..
            }) = event::read()?
            else {
                continue;
            };
            if kind == KeyEventKind::Release {
                continue;
            }
            match code {
                KeyCode::Enter => return Ok(Some(password)),
                KeyCode::Esc => return Ok(None),
                KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => return Ok(None),
                KeyCode::Backspace => {
                    password.pop();
                }
                KeyCode::Char(c) => password.push(c),
                _ => {}
            }
        }
    };
    let result = read();
    disable_raw_mode()?;
    writeln!(stderr)?;

    result
}

/// Run the interactive terminal until the user detaches (Ctrl+]) or the
/// session ends.
///
/// Returns the close reason when the session ended by itself.
pub async fn run_interactive(
    client: Arc<TerminalClient>,
    mut closed: mpsc::UnboundedReceiver<CloseReason>,
) -> Result<Option<CloseReason>> {
    use crossterm::{
        event::{self, Event, KeyEvent, KeyEventKind},
        terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
        ExecutableCommand,
    };

    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    stdout.execute(EnterAlternateScreen)?;

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
    let event_handle = tokio::task::spawn_blocking(move || {
        while !event_tx.is_closed() {
            if event::poll(std::time::Duration::from_millis(10)).unwrap_or(false) {
                if let Ok(evt) = event::read() {
                    if event_tx.blocking_send(evt).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let outcome = loop {
        tokio::select! {
            Some(evt) = event_rx.recv() => match evt {
                Event::Key(KeyEvent { code, modifiers, kind, .. }) => {
                    if kind == KeyEventKind::Release {
                        continue;
                    }
                    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char(']') {
                        break None;
                    }
                    let data = key_to_bytes(code, modifiers);
                    if !data.is_empty() {
                        if let Err(e) = client.send(Bytes::from(data)) {
                            tracing::debug!("Dropping input: {}", e);
                        }
                    }
                }
                Event::Resize(cols, rows) => {
                    if let Err(e) = client.resize(TerminalSize::new(rows, cols)) {
                        tracing::debug!("Dropping resize: {}", e);
                    }
                }
                Event::Paste(text) => {
                    let _ = client.send(Bytes::from(text.into_bytes()));
                }
                _ => {}
            },
            reason = closed.recv() => break reason,
        }
    };

    drop(event_rx);
    let _ = event_handle.await;
    stdout.execute(LeaveAlternateScreen)?;
    disable_raw_mode()?;

    if outcome.is_none() {
        client.close().await;
    }
    Ok(outcome)
}

/// Convert a key event to the bytes a terminal would send
pub fn key_to_bytes(code: KeyCode, modifiers: KeyModifiers) -> Vec<u8> {
    use KeyCode::*;

    match code {
        Char(c) => {
            if modifiers.contains(KeyModifiers::CONTROL) && c.is_ascii_alphabetic() {
                // Ctrl+A = 0x01, Ctrl+B = 0x02, etc.
                vec![(c.to_ascii_lowercase() as u8) - b'a' + 1]
            } else if modifiers.contains(KeyModifiers::ALT) {
                let mut bytes = vec![0x1b];
                bytes.extend_from_slice(c.to_string().as_bytes());
                bytes
            } else {
                c.to_string().into_bytes()
            }
        }
        Enter => vec![b'\r'],
        Tab => vec![b'\t'],
        BackTab => vec![0x1b, b'[', b'Z'],
        Backspace => vec![0x7f],
        Esc => vec![0x1b],
        Up => vec![0x1b, b'[', b'A'],
        Down => vec![0x1b, b'[', b'B'],
        Right => vec![0x1b, b'[', b'C'],
        Left => vec![0x1b, b'[', b'D'],
        Home => vec![0x1b, b'[', b'H'],
        End => vec![0x1b, b'[', b'F'],
        PageUp => vec![0x1b, b'[', b'5', b'~'],
        PageDown => vec![0x1b, b'[', b'6', b'~'],
        Delete => vec![0x1b, b'[', b'3', b'~'],
        Insert => vec![0x1b, b'[', b'2', b'~'],
        F(n) => match n {
            1 => b"\x1bOP".to_vec(),
            2 => b"\x1bOQ".to_vec(),
            3 => b"\x1bOR".to_vec(),
            4 => b"\x1bOS".to_vec(),
            5 => b"\x1b[15~".to_vec(),
            6 => b"\x1b[17~".to_vec(),
            7 => b"\x1b[18~".to_vec(),
            8 => b"\x1b[19~".to_vec(),
            9 => b"\x1b[20~".to_vec(),
            10 => b"\x1b[21~".to_vec(),
            11 => b"\x1b[23~".to_vec(),
            12 => b"\x1b[24~".to_vec(),
            _ => vec![],
        },
        _ => vec![],
    }
}
