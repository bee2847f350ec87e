//! Reconciles the orchestrator's view of which instances are running
//! against which instances currently have tunnels up.
//!
//! Grounded on the periodic diff-and-converge shape of
//! `other_examples/7064a8b7_althea-mesh-althea_rs__rita-src-rita_common-tunnel_manager-mod.rs.rs`
//! and the teacher's own ticking cleanup tasks
//! (`state.rs::cleanup_expired_tunnels`/`cleanup_expired_keys`).

use std::collections::HashSet;
use std::sync::Arc;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionManager;
use crate::orchestrator::{InstanceStatus, Orchestrator};
use crate::tunnel::{Direction, Service, TunnelManager, TunnelSpec};

const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// The tunnel set every running instance gets, covering the agent's
/// standard services. Port 0 means "pick an ephemeral local port".
pub fn default_tunnel_specs() -> Vec<TunnelSpec> {
    vec![
        TunnelSpec {
            service: Service::Gateway,
            direction: Direction::LocalToRemote,
            local_port: 0,
            remote_port: 8080,
        },
        TunnelSpec {
            service: Service::Vnc,
            direction: Direction::LocalToRemote,
            local_port: 0,
            remote_port: 5900,
        },
        TunnelSpec {
            service: Service::Terminal,
            direction: Direction::LocalToRemote,
            local_port: 0,
            remote_port: 7681,
        },
        TunnelSpec {
            service: Service::Files,
            direction: Direction::LocalToRemote,
            local_port: 0,
            remote_port: 8021,
        },
    ]
}

pub struct MaintenanceLoop {
    connections: Arc<ConnectionManager>,
    tunnels: Arc<TunnelManager>,
    orchestrator: Arc<dyn Orchestrator>,
    cancel: CancellationToken,
}

impl MaintenanceLoop {
    pub fn new(
        connections: Arc<ConnectionManager>,
        tunnels: Arc<TunnelManager>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Arc<Self> {
        let maintenance = Arc::new(Self {
            connections,
            tunnels,
            orchestrator,
            cancel: CancellationToken::new(),
        });
        maintenance.clone().spawn();
        maintenance
    }

    fn spawn(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(TICK_INTERVAL) => self.run_tick().await,
                }
            }
        });
    }

    async fn run_tick(&self) {
        let instances = match self.orchestrator.list_instances().await {
            Ok(list) => list,
            Err(e) => {
                warn!("maintenance tick: failed to list instances: {e}");
                return;
            }
        };

        let mut running: HashSet<String> = HashSet::new();
        let mut active_tunnel_count = 0usize;

        for instance in &instances {
            let status = match self.orchestrator.get_instance_status(instance).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("maintenance tick: status lookup failed for {instance}: {e}");
                    continue;
                }
            };

            if status == InstanceStatus::Running {
                running.insert(instance.clone());
                let has_client = self.connections.get_client(instance).await.is_some();
                let has_tunnels = !self.tunnels.get_tunnels(instance).await.is_empty();
                if has_client && !has_tunnels {
                    info!("starting tunnels for newly running instance {instance}");
                    self.tunnels
                        .start_tunnels_for_instance(instance, default_tunnel_specs())
                        .await;
                }
                active_tunnel_count += self.tunnels.get_tunnels(instance).await.len();
            }
        }

        let all_with_tunnels: Vec<String> = self
            .tunnels
            .get_all_tunnels()
            .await
            .iter()
            .map(|t| t.instance_name.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for instance in all_with_tunnels {
            if !running.contains(&instance) {
                info!("stopping tunnels for instance no longer running: {instance}");
                self.tunnels.stop_tunnels_for_instance(&instance).await;
            }
        }

        if active_tunnel_count > 0 {
            info!("maintenance tick: {active_tunnel_count} tunnels active across {} running instances", running.len());
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
