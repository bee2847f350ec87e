//! Data carried per forwarded port by [`super::manager::TunnelManager`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Service {
    Gateway,
    Vnc,
    Terminal,
    Files,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Gateway => "gateway",
            Service::Vnc => "vnc",
            Service::Terminal => "terminal",
            Service::Files => "files",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Direction {
    /// Control plane listens locally and forwards into the agent.
    LocalToRemote,
    /// Agent listens and forwards back to the control plane.
    RemoteToLocal,
}

/// The declarative description of one tunnel an instance wants running.
/// `local_port = 0` means "pick an ephemeral port".
#[derive(Debug, Clone, Copy)]
pub struct TunnelSpec {
    pub service: Service,
    pub direction: Direction,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Live state of one running tunnel, returned to callers as a snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Tunnel {
    pub instance_name: String,
    pub service: Service,
    pub direction: Direction,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(serialize_with = "crate::serde_time::as_secs_ago")]
    pub created_at: Instant,
    #[serde(serialize_with = "crate::serde_time::as_secs_ago_opt")]
    pub last_check: Option<Instant>,
    #[serde(serialize_with = "crate::serde_time::as_secs_ago_opt")]
    pub last_successful_check: Option<Instant>,
    pub last_error: Option<String>,
    pub bytes_transferred: u64,
    pub healthy: bool,
}

/// Internal bookkeeping for a running tunnel: the snapshot fields plus the
/// handles needed to tear it down.
pub(crate) struct RunningTunnel {
    pub spec: TunnelSpec,
    pub created_at: Instant,
    pub last_check: Option<Instant>,
    pub last_successful_check: Option<Instant>,
    pub last_error: Option<String>,
    pub bytes_transferred: Arc<AtomicU64>,
    pub healthy: bool,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl RunningTunnel {
    pub fn snapshot(&self, instance: &str) -> Tunnel {
        Tunnel {
            instance_name: instance.to_string(),
            service: self.spec.service,
            direction: self.spec.direction,
            local_port: self.spec.local_port,
            remote_port: self.spec.remote_port,
            created_at: self.created_at,
            last_check: self.last_check,
            last_successful_check: self.last_successful_check,
            last_error: self.last_error.clone(),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            healthy: self.healthy,
        }
    }
}
