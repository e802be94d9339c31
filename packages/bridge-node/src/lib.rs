//! Yield bridge node
//!
//! Hosts the origin sender and the destination receiver in one process,
//! relays messages between them over in-process channels and serves the
//! query API.

pub mod api;
pub mod config;
pub mod metrics;
pub mod relay;

pub use api::{start_server, AppState};
pub use config::NodeConfig;
pub use relay::{bootstrap, Gateways, Relay};

/// Current unix time in seconds, the clock every ledger call is given
pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
