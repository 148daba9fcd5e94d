//! Rendezvous directory: peer registry, presence and punch-hole negotiation

mod actor;
mod registry;

pub use actor::{Directory, DirectoryCommand, DirectoryHandle, DirectorySettings};
pub use registry::{PeerRecord, Registry};
