//! Top-level subsystem constructor and lifecycle.
//!
//! Owns the three components the rest of this crate splits into
//! ([`ConnectionManager`], [`TunnelManager`], [`MaintenanceLoop`]) and wires
//! them from a single [`Config`] the way the teacher's `main.rs` wired its
//! `AppState` from one parsed config — the only substantial difference
//! being that this crate is a library, so construction happens through
//! `SshCore::new` rather than at a binary's `main`.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::KeyError;
use crate::event_log::EventLog;
use crate::key::KeyProvider;
use crate::maintenance::MaintenanceLoop;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::state_tracker::StateTracker;
use crate::tunnel::TunnelManager;

/// Owns the connection pool, tunnel layer, and maintenance loop for the
/// whole fleet, constructed from one [`Config`] and a caller-supplied
/// [`Orchestrator`].
pub struct SshCore {
    pub connections: Arc<ConnectionManager>,
    pub tunnels: Arc<TunnelManager>,
    pub maintenance: Arc<MaintenanceLoop>,
}

impl SshCore {
    /// Loads or generates the fleet's shared keypair from `config.key_dir`,
    /// builds every supporting component (rate limiter, state tracker,
    /// event log, metrics) from `config`'s knobs, and starts the
    /// connection pool's keepalive loop, the tunnel layer's health loops,
    /// and the maintenance reconciliation loop.
    pub fn new(config: Config, orchestrator: Arc<dyn Orchestrator>) -> Result<Self, KeyError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let key_provider = KeyProvider::new(config.key_dir.clone());
        let (_signer, public_key_text) = key_provider.ensure_key_pair()?;
        let key_path = key_provider.private_key_path().to_string_lossy().to_string();

        let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig::from(&config), clock.clone()));
        let state_tracker = Arc::new(StateTracker::new(clock.clone(), config.transition_buffer_size));
        let event_log = Arc::new(EventLog::new(clock.clone(), config.event_buffer_size));
        let metrics = Arc::new(Metrics::new(clock.clone()));

        let connections = ConnectionManager::new(
            config.clone(),
            clock.clone(),
            key_path,
            public_key_text,
            rate_limiter,
            state_tracker,
            event_log,
            metrics,
        );

        let tunnels = TunnelManager::new(config, clock, connections.clone());
        let maintenance = MaintenanceLoop::new(connections.clone(), tunnels.clone(), orchestrator);

        Ok(Self {
            connections,
            tunnels,
            maintenance,
        })
    }

    /// Stops the maintenance loop, tears down every tunnel, and closes
    /// every SSH client, in that order so nothing races a tunnel rebuild
    /// against a connection that is mid-close.
    pub async fn close_all(&self) {
        self.maintenance.stop();
        self.tunnels.close_all().await;
        self.connections.close_all().await;
    }
}
