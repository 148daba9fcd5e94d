//! pt-core: Core abstractions and configuration for peerterm
//!
//! This crate provides shared types, traits, and configuration structures
//! used by the rendezvous server, the agent, and the terminal client.

pub mod auth;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{ConfigError, PtError, SessionError, TransportError};
pub use traits::{Transport, TransportKind};
pub use types::{PeerId, SessionNonce};
