//! Outbound SSH connection pool: dial, keepalive, health-check, and
//! backoff-driven reconnection, keyed by instance name.

mod handler;
mod manager;
mod types;

pub use handler::FleetClientHandler;
pub use manager::{ClientHandle, ConnectionManager, ConnectionSource};
pub use types::ConnectionParams;
