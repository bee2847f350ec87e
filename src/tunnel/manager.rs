//! Reverse-tunnel lifecycle: opens forwarded channels over a borrowed SSH
//! client and streams bytes between a local TCP endpoint and the agent's
//! service port.
//!
//! Grounded on the teacher's `ssh/tunnel.rs` (`create_tunnel`, bookkeeping
//! under a mutex) and `proxy.rs` (opening a forwarded channel and copying
//! bytes both ways, counting them), flipped from the server's
//! `channel_open_forwarded_tcpip` to the client's `channel_open_direct_tcpip`
//! for the common local→remote case, and from one always-on tunnel per
//! session to a declarative per-instance tunnel set with independent
//! health checks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::Config;
use crate::connection::ConnectionSource;
use crate::error::{Result, SshCoreError};
use crate::tunnel::types::{Direction, RunningTunnel, Tunnel, TunnelSpec};

pub struct TunnelManager {
    config: Config,
    clock: Arc<dyn Clock>,
    connections: Arc<dyn ConnectionSource>,
    tunnels: RwLock<HashMap<String, Vec<RunningTunnel>>>,
    desired_specs: RwLock<HashMap<String, Vec<TunnelSpec>>>,
    root_cancel: CancellationToken,
}

impl TunnelManager {
    pub fn new(config: Config, clock: Arc<dyn Clock>, connections: Arc<dyn ConnectionSource>) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            clock,
            connections,
            tunnels: RwLock::new(HashMap::new()),
            desired_specs: RwLock::new(HashMap::new()),
            root_cancel: CancellationToken::new(),
        });
        manager.clone().spawn_global_health_loop();
        manager.clone().spawn_per_instance_monitor();
        manager
    }

    fn spawn_global_health_loop(self: Arc<Self>) {
        let cancel = self.root_cancel.clone();
        let interval = self.config.tunnel_health_interval_global;
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => manager.run_global_health_tick().await,
                }
            }
        });
    }

    fn spawn_per_instance_monitor(self: Arc<Self>) {
        let cancel = self.root_cancel.clone();
        let interval = self.config.tunnel_health_interval_per_instance;
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => manager.run_per_instance_monitor_tick().await,
                }
            }
        });
    }

    async fn run_global_health_tick(self: &Arc<Self>) {
        let instances: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        for instance in instances {
            let count = self
                .tunnels
                .read()
                .await
                .get(&instance)
                .map(|v| v.len())
                .unwrap_or(0);
            for index in 0..count {
                self.probe_tunnel(&instance, index).await;
            }
        }
    }

    async fn probe_tunnel(self: &Arc<Self>, instance: &str, index: usize) {
        let (direction, local_port) = {
            let tunnels = self.tunnels.read().await;
            match tunnels.get(instance).and_then(|v| v.get(index)) {
                Some(t) => (t.spec.direction, t.spec.local_port),
                None => return,
            }
        };

        let now = self.clock.now();
        let healthy = match direction {
            Direction::LocalToRemote => {
                tokio::time::timeout(
                    self.config.tunnel_probe_timeout,
                    tokio::net::TcpStream::connect(("127.0.0.1", local_port)),
                )
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
            }
            Direction::RemoteToLocal => self.connections.borrow_client(instance).await.is_some(),
        };

        let mut tunnels = self.tunnels.write().await;
        if let Some(tunnel) = tunnels.get_mut(instance).and_then(|v| v.get_mut(index)) {
            tunnel.last_check = Some(now);
            if healthy {
                tunnel.last_successful_check = Some(now);
                tunnel.healthy = true;
                return;
            }
            tunnel.healthy = false;
            tunnel.last_error = Some("probe failed".to_string());
            tunnel.cancel.cancel();
        }
        drop(tunnels);

        warn!("tunnel {index} for {instance} unhealthy, rebuilding");
        self.rebuild_tunnel(instance, index).await;
    }

    async fn rebuild_tunnel(self: &Arc<Self>, instance: &str, index: usize) {
        if self.connections.borrow_client(instance).await.is_none() {
            info!("not rebuilding tunnel for {instance}: no live SSH client");
            return;
        }

        let spec = {
            let tunnels = self.tunnels.read().await;
            match tunnels.get(instance).and_then(|v| v.get(index)) {
                Some(t) => t.spec,
                None => return,
            }
        };

        let mut delay = self.config.reconnect_base_delay;
        let max_delay = self.config.tunnel_reconnect_max_delay;
        loop {
            if self.root_cancel.is_cancelled() {
                return;
            }
            match self.build_one(instance, spec).await {
                Ok(running) => {
                    let mut tunnels = self.tunnels.write().await;
                    if let Some(slot) = tunnels.get_mut(instance).and_then(|v| v.get_mut(index)) {
                        *slot = running;
                    }
                    return;
                }
                Err(e) => {
                    warn!("rebuild of tunnel {index} for {instance} failed: {e}");
                    tokio::select! {
                        _ = self.root_cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = std::cmp::min(delay * 2, max_delay);
                }
            }
        }
    }

    async fn run_per_instance_monitor_tick(self: &Arc<Self>) {
        let instances: Vec<String> = self.desired_specs.read().await.keys().cloned().collect();
        for instance in instances {
            let desired = self
                .desired_specs
                .read()
                .await
                .get(&instance)
                .cloned()
                .unwrap_or_default();
            let present: Vec<_> = {
                let tunnels = self.tunnels.read().await;
                tunnels
                    .get(&instance)
                    .map(|v| v.iter().map(|t| t.spec.service).collect::<Vec<_>>())
                    .unwrap_or_default()
            };
            for spec in desired {
                if !present.contains(&spec.service) {
                    info!("recreating missing tunnel {:?} for {instance}", spec.service);
                    self.start_one(&instance, spec).await;
                }
            }
        }
    }

    /// Reads the declarative tunnel spec set for an instance, obtains the
    /// live SSH client (skips silently if none), and brings up every
    /// tunnel in the set.
    pub async fn start_tunnels_for_instance(self: &Arc<Self>, instance: &str, specs: Vec<TunnelSpec>) {
        if self.connections.borrow_client(instance).await.is_none() {
            info!("skipping tunnel start for {instance}: no live SSH client");
            return;
        }
        self.desired_specs
            .write()
            .await
            .insert(instance.to_string(), specs.clone());
        for spec in specs {
            self.start_one(instance, spec).await;
        }
    }

    async fn start_one(self: &Arc<Self>, instance: &str, spec: TunnelSpec) {
        match self.build_one(instance, spec).await {
            Ok(running) => {
                self.tunnels
                    .write()
                    .await
                    .entry(instance.to_string())
                    .or_default()
                    .push(running);
            }
            Err(e) => warn!("failed to start tunnel {:?} for {instance}: {e}", spec.service),
        }
    }

    async fn build_one(self: &Arc<Self>, instance: &str, spec: TunnelSpec) -> Result<RunningTunnel> {
        let cancel = CancellationToken::new();
        let bytes = Arc::new(AtomicU64::new(0));
        let local_port = match spec.direction {
            Direction::LocalToRemote => {
                self.spawn_local_to_remote(instance.to_string(), spec, cancel.clone(), bytes.clone())
                    .await?
            }
            Direction::RemoteToLocal => {
                self.start_remote_to_local(instance, spec, bytes.clone()).await?;
                spec.local_port
            }
        };

        Ok(RunningTunnel {
            spec: TunnelSpec {
                local_port,
                ..spec
            },
            created_at: self.clock.now(),
            last_check: None,
            last_successful_check: None,
            last_error: None,
            bytes_transferred: bytes,
            healthy: true,
            cancel,
        })
    }

    async fn spawn_local_to_remote(
        self: &Arc<Self>,
        instance: String,
        spec: TunnelSpec,
        cancel: CancellationToken,
        bytes: Arc<AtomicU64>,
    ) -> Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", spec.local_port))
            .await
            .map_err(SshCoreError::Io)?;
        let local_port = listener.local_addr().map_err(SshCoreError::Io)?.port();
        let connections = self.connections.clone();
        let remote_port = spec.remote_port;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((tcp, _peer)) = accepted else { continue };
                        let connections = connections.clone();
                        let instance = instance.clone();
                        let bytes = bytes.clone();
                        tokio::spawn(async move {
                            bridge_one_connection(connections, instance, remote_port, tcp, bytes).await;
                        });
                    }
                }
            }
        });

        Ok(local_port)
    }

    /// Requests the agent listen on `spec.remote_port` and forward
    /// inbound connections back to us, where we relay to
    /// `127.0.0.1:spec.local_port`. `bytes` is the same counter this
    /// tunnel's snapshot reads from, so the connection handler's bridge
    /// task tallies this direction into the same place local→remote does.
    async fn start_remote_to_local(
        self: &Arc<Self>,
        instance: &str,
        spec: TunnelSpec,
        bytes: Arc<AtomicU64>,
    ) -> Result<()> {
        let client = self
            .connections
            .borrow_client(instance)
            .await
            .ok_or_else(|| SshCoreError::NotFound(instance.to_string()))?;

        client
            .tcpip_forward("0.0.0.0", spec.remote_port as u32)
            .await
            .map_err(|e| SshCoreError::Tunnel(e.to_string()))?;

        let target = SocketAddr::from(([127, 0, 0, 1], spec.local_port));
        self.connections
            .register_forward_target(instance, spec.remote_port, target, bytes)
            .await;
        Ok(())
    }

    /// Closes every listener and forwarding registration for an instance
    /// and drops its tunnel list.
    pub async fn stop_tunnels_for_instance(&self, instance: &str) {
        self.desired_specs.write().await.remove(instance);
        if let Some(tunnels) = self.tunnels.write().await.remove(instance) {
            for tunnel in &tunnels {
                tunnel.cancel.cancel();
                if tunnel.spec.direction == Direction::RemoteToLocal {
                    self.connections
                        .clear_forward_target(instance, tunnel.spec.remote_port)
                        .await;
                }
            }
        }
    }

    pub async fn get_tunnels(&self, instance: &str) -> Vec<Tunnel> {
        self.tunnels
            .read()
            .await
            .get(instance)
            .map(|v| v.iter().map(|t| t.snapshot(instance)).collect())
            .unwrap_or_default()
    }

    pub async fn get_all_tunnels(&self) -> Vec<Tunnel> {
        self.tunnels
            .read()
            .await
            .iter()
            .flat_map(|(instance, running)| running.iter().map(move |t| t.snapshot(instance)))
            .collect()
    }

    pub async fn get_status(&self, instance: &str) -> Vec<Tunnel> {
        self.get_tunnels(instance).await
    }

    pub async fn close_all(&self) {
        self.root_cancel.cancel();
        let instances: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        for instance in instances {
            self.stop_tunnels_for_instance(&instance).await;
        }
    }
}

async fn bridge_one_connection(
    connections: Arc<dyn ConnectionSource>,
    instance: String,
    remote_port: u16,
    mut tcp: tokio::net::TcpStream,
    bytes: Arc<AtomicU64>,
) {
    let Some(client) = connections.borrow_client(&instance).await else {
        return;
    };

    let channel = client
        .channel_open_direct_tcpip("127.0.0.1", remote_port as u32, "127.0.0.1", 0)
        .await;

    let channel = match channel {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to open direct-tcpip channel to {instance}: {e}");
            return;
        }
    };

    let mut stream = channel.into_stream();
    if let Ok((from_local, from_remote)) = tokio::io::copy_bidirectional(&mut stream, &mut tcp).await {
        bytes.fetch_add(from_local + from_remote, Ordering::Relaxed);
    }
}
