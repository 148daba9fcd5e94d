//! Core trait definitions

mod transport;

pub use transport::{Transport, TransportKind};
