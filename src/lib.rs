//! SSH connection and tunnel subsystem for a fleet-of-agents control plane.
//!
//! Owns the outbound SSH client pool to every running agent
//! ([`connection`]), the reverse-tunnel lifecycle built on top of it
//! ([`tunnel`]), and the reconciliation loop that keeps the two in sync
//! with the orchestrator's view of the fleet ([`maintenance`]). Everything
//! else (rate limiting, IP allow-lists, state tracking, event/metrics
//! read models, the shared keypair) is a supporting component consumed by
//! those three.

pub mod clock;
pub mod config;
pub mod connection;
mod core;
pub mod error;
pub mod event_log;
pub mod ip_allowlist;
pub mod key;
pub mod maintenance;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limiter;
pub mod ring_buffer;
mod serde_time;
pub mod state_tracker;
pub mod tunnel;

#[cfg(test)]
mod testutil;

pub use clock::{Clock, ConnectionIdGenerator, SystemClock, TestClock};
pub use config::Config;
pub use connection::{ClientHandle, ConnectionManager, ConnectionParams, ConnectionSource};
pub use core::SshCore;
pub use error::{ConfigError, KeyError, Result, SshCoreError};
pub use event_log::{ConnectionEvent, EventLog, EventType};
pub use ip_allowlist::IpAllowList;
pub use key::KeyProvider;
pub use maintenance::MaintenanceLoop;
pub use metrics::{ConnectionMetrics, Metrics};
pub use orchestrator::{InstanceStatus, Orchestrator};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimitStatus};
pub use ring_buffer::RingBuffer;
pub use state_tracker::{ConnectionState, StateTracker, StateTransition};
pub use tunnel::{Direction, Service, Tunnel, TunnelManager, TunnelSpec};
