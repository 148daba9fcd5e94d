//! Terminal processes served to clients
//!
//! A [`TerminalBackend`] spawns one [`TerminalProcess`] per opened session.
//! The PTY backend runs a validated shell; tests substitute their own.

mod manager;

use std::io::Read;

use anyhow::Result;

use pt_protocol::TerminalSize;

pub use manager::{validate_shell_path, PtyBackend};

/// Spawns terminal processes
pub trait TerminalBackend: Send + Sync {
    fn spawn(&self, size: TerminalSize) -> Result<Box<dyn TerminalProcess>>;
}

/// One running terminal process.
///
/// The reader is blocking and is driven from a blocking task; the other
/// methods are short and are called from the session loop.
pub trait TerminalProcess: Send {
    /// Take the output reader. Returns an error when called twice.
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>>;

    /// Write client input
    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn resize(&mut self, size: TerminalSize) -> Result<()>;

    /// Exit code if the process has exited
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Kill the process and reap it
    fn kill(&mut self) -> Option<i32>;

    /// OS process ID, when there is one
    fn pid(&self) -> Option<u32> {
        None
    }
}
