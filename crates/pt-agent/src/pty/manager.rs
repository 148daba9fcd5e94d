//! PTY-backed terminals
//!
//! Spawns shells on a pseudo-terminal using the portable-pty crate.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use pt_protocol::TerminalSize;

use super::{TerminalBackend, TerminalProcess};

/// Shells a client may be given (prevents arbitrary command execution)
const ALLOWED_SHELLS_UNIX: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/bin/ksh",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
    "/opt/homebrew/bin/fish",
];

const ALLOWED_SHELLS_WINDOWS: &[&str] = &[
    "cmd.exe",
    "powershell.exe",
    "pwsh.exe",
    "C:\\Windows\\System32\\cmd.exe",
    "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe",
];

/// Check that `shell` is an allowed shell that exists.
///
/// Accepts the built-in list plus, on Unix, anything listed in `/etc/shells`.
pub fn validate_shell_path(shell: &str) -> Result<String> {
    let allowed = if cfg!(windows) {
        ALLOWED_SHELLS_WINDOWS
    } else {
        ALLOWED_SHELLS_UNIX
    };

    let listed = allowed.iter().any(|s| s.eq_ignore_ascii_case(shell));
    if !listed && !in_etc_shells(shell) {
        anyhow::bail!("Shell '{}' is not an allowed shell", shell);
    }

    if !cfg!(windows) && !Path::new(shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }

    Ok(shell.to_string())
}

#[cfg(unix)]
fn in_etc_shells(shell: &str) -> bool {
    std::fs::read_to_string("/etc/shells")
        .map(|shells| {
            shells
                .lines()
                .map(str::trim)
                .any(|line| !line.starts_with('#') && line == shell)
        })
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn in_etc_shells(_shell: &str) -> bool {
    false
}

/// Spawns the configured shell on a fresh PTY per session
pub struct PtyBackend {
    default_shell: Option<String>,
    default_env: Vec<(String, String)>,
}

impl PtyBackend {
    pub fn new(default_shell: Option<String>, default_env: Vec<(String, String)>) -> Self {
        Self {
            default_shell,
            default_env,
        }
    }

    fn shell(&self) -> String {
        self.default_shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| {
                if cfg!(windows) {
                    "cmd.exe".to_string()
                } else {
                    "/bin/sh".to_string()
                }
            })
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl TerminalBackend for PtyBackend {
    fn spawn(&self, size: TerminalSize) -> Result<Box<dyn TerminalProcess>> {
        let requested = self.shell();
        let shell = validate_shell_path(&requested)
            .with_context(|| format!("Invalid shell: {}", requested))?;

        tracing::info!("Spawning {} on a {}x{} PTY", shell, size.cols, size.rows);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(size))
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&shell);
        for (key, value) in &self.default_env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell: {}", shell))?;
        // Keep only the master side; the child holds its own slave handle.
        drop(pair.slave);

        let writer = pair.master.take_writer().context("Failed to take PTY writer")?;

        tracing::debug!("Shell started with PID {:?}", child.process_id());
        Ok(Box::new(PtyProcess {
            master: pair.master,
            child,
            writer,
            reader_taken: false,
        }))
    }
}

/// A shell running on a PTY
struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    reader_taken: bool,
}

impl TerminalProcess for PtyProcess {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>> {
        if self.reader_taken {
            anyhow::bail!("PTY reader already taken");
        }
        let reader = self
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        self.reader_taken = true;
        Ok(reader)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).context("Failed to write to PTY")?;
        self.writer.flush().context("Failed to flush PTY")?;
        Ok(())
    }

    fn resize(&mut self, size: TerminalSize) -> Result<()> {
        tracing::debug!("Resizing PTY to {}x{}", size.cols, size.rows);
        self.master
            .resize(pty_size(size))
            .context("Failed to resize PTY")
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.try_wait().context("Failed to poll shell")?;
        Ok(status.map(|status| status.exit_code() as i32))
    }

    fn kill(&mut self) -> Option<i32> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status.exit_code() as i32);
        }
        let _ = self.child.kill();
        self.child.wait().ok().map(|status| status.exit_code() as i32)
    }

    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlisted_shell_rejected() {
        let err = validate_shell_path("/tmp/not-a-shell").unwrap_err();
        assert!(err.to_string().contains("not an allowed shell"));
    }

    #[cfg(unix)]
    #[test]
    fn test_bin_sh_allowed() {
        assert_eq!(validate_shell_path("/bin/sh").unwrap(), "/bin/sh");
    }

    #[test]
    fn test_default_shell_preferred() {
        let backend = PtyBackend::new(Some("/bin/zsh".to_string()), Vec::new());
        assert_eq!(backend.shell(), "/bin/zsh");
    }
}
