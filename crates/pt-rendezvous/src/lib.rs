//! pt-rendezvous: Peer directory and relay bridge for peerterm
//!
//! The rendezvous server tracks which peers are online, answers punch-hole
//! requests by allocating relay tokens and instructing the target peer to
//! claim them, and bridges the two relay connections that claim each token.

pub mod conn;
pub mod directory;
pub mod relay;
pub mod server;
pub mod state;

pub use server::{router, RendezvousServer};
pub use state::RendezvousState;
