//! Client session state machine
//!
//! [`TerminalClient`] takes a terminal tab from `Idle` through
//! `Negotiating` (punch hole and transport selection) and `Authenticating`
//! (challenge login) to `Open`, where a driver task owns the transport and
//! streams terminal bytes until either side closes.

mod client;
mod driver;
mod handler;
mod login;
mod output;

pub use client::{SessionState, TerminalClient};
pub use driver::{SessionCommand, SessionDriver};
pub use handler::{CloseReason, PasswordProvider, SessionHandler};
pub use login::{login, LoginParams};
pub use output::{inflate_into, OutputDecoder, MAX_INFLATED_SIZE};
