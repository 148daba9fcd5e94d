//! pt-client: Terminal client for peerterm
//!
//! Reaches a peer through the rendezvous directory, picks a direct data
//! channel or the relay, logs in and streams a remote terminal. The
//! `peerterm` binary wraps this in an interactive CLI.

pub mod commands;
pub mod output;
pub mod rendezvous;
pub mod session;
pub mod terminal;
pub mod transport;

pub use rendezvous::RendezvousClient;
pub use session::{
    CloseReason, PasswordProvider, SessionHandler, SessionState, TerminalClient,
};
