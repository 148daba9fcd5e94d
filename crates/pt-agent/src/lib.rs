//! pt-agent: The peer that serves terminals
//!
//! Registers with the rendezvous directory under a peer ID, follows claim
//! instructions to the relay, challenges clients for the configured
//! password and runs a PTY-backed shell for each session.

pub mod agent;
pub mod pty;
pub mod session;
pub mod tunnel;

pub use agent::Agent;
pub use pty::{PtyBackend, TerminalBackend, TerminalProcess};
pub use session::{SessionServer, TerminalSettings};
