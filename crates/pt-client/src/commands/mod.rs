//! CLI command implementations

mod config;
mod connect;
mod online;

pub use config::{config_get, config_init, config_set, config_show, CLIENT_CONFIG_FILE};
pub use connect::connect_command;
pub use online::online_command;
