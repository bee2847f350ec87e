//! The connection pool: dial, keepalive, health-check, and
//! backoff-driven reconnection for every instance's SSH session.
//!
//! Grounded on the dial/session/global-request plumbing visible in the
//! teacher's `ssh::handler` (the server-side equivalents of `Handle`,
//! `Session`, and channel operations used here from the client side via
//! `russh::client`), and on the backoff shape (doubling delay, capped,
//! cancel-aware sleep) from `other_examples`' `ReconnectConfig`
//! (`02cb159c_easternanemone-rust-daq__crates-client-src-reconnect.rs.rs`).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use russh_keys::{HashAlg, PrivateKeyWithHashAlg};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::Config;
use crate::connection::handler::{FleetClientHandler, ForwardTarget, ForwardTargets};
use crate::connection::types::ConnectionParams;
use crate::error::{Result, SshCoreError};
use crate::event_log::{EventLog, EventType};
use crate::ip_allowlist::IpAllowList;
use crate::key::KeyProvider;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::rate_limiter::RateLimiter;
use crate::state_tracker::{ConnectionState, StateTracker};

pub type ClientHandle = russh::client::Handle<FleetClientHandler>;

const HEALTH_CHECK_COMMAND: &str = "echo ping";
const HEALTH_CHECK_EXPECTED: &str = "ping\n";
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

type ExhaustedCallback = Arc<dyn Fn(&str, u32) + Send + Sync>;

pub struct ConnectionManager {
    config: Config,
    clock: Arc<dyn Clock>,
    key_path: String,
    public_key_text: String,
    ip_allowlist: IpAllowList,
    rate_limiter: Arc<RateLimiter>,
    state_tracker: Arc<StateTracker>,
    event_log: Arc<EventLog>,
    metrics: Arc<Metrics>,
    seen_host_keys: Arc<Mutex<HashMap<String, String>>>,
    forward_targets: RwLock<HashMap<String, ForwardTargets>>,
    clients: RwLock<HashMap<String, ClientHandle>>,
    params: RwLock<HashMap<String, ConnectionParams>>,
    reconnecting: Mutex<HashSet<String>>,
    exhausted_callbacks: RwLock<Vec<ExhaustedCallback>>,
    root_cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl ConnectionManager {
    /// `key_path` is the default private-key path used by [`Self::ensure_connected`]
    /// when no connection has been cached yet for an instance; `connect`
    /// itself always loads whatever path it is given, once per call.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        key_path: String,
        public_key_text: String,
        rate_limiter: Arc<RateLimiter>,
        state_tracker: Arc<StateTracker>,
        event_log: Arc<EventLog>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let ip_allowlist = IpAllowList::parse(&config.allowed_source_ips).unwrap_or_else(|e| {
            warn!("invalid allowed_source_ips {:?}: {e}; allowing all", config.allowed_source_ips);
            IpAllowList::default()
        });
        let manager = Arc::new(Self {
            config,
            clock,
            key_path,
            public_key_text,
            ip_allowlist,
            rate_limiter,
            state_tracker,
            event_log,
            metrics,
            seen_host_keys: Arc::new(Mutex::new(HashMap::new())),
            forward_targets: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            params: RwLock::new(HashMap::new()),
            reconnecting: Mutex::new(HashSet::new()),
            exhausted_callbacks: RwLock::new(Vec::new()),
            root_cancel: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        });
        manager.clone().spawn_keepalive_loop();
        manager
    }

    /// Registers a callback run whenever `reconnect_with_backoff` exhausts
    /// its retries for an instance, outside any internal lock (mirrors
    /// `StateTracker::on_change`).
    pub async fn on_reconnect_exhausted<F>(&self, callback: F)
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        self.exhausted_callbacks.write().await.push(Arc::new(callback));
    }

    fn spawn_keepalive_loop(self: Arc<Self>) {
        let cancel = self.root_cancel.clone();
        let interval = self.config.keepalive_interval;
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        manager.run_keepalive_tick().await;
                    }
                }
            }
        });
        tokio::spawn(async move {
            let _ = handle.await;
        });
    }

    async fn run_keepalive_tick(self: &Arc<Self>) {
        let instances: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for instance in instances {
            self.probe_one(&instance).await;
        }
    }

    async fn probe_one(self: &Arc<Self>, instance: &str) {
        let client = match self.clients.read().await.get(instance).cloned() {
            Some(c) => c,
            None => return,
        };

        if let Err(e) = client.send_keepalive(true).await {
            warn!("keepalive failed for {instance}: {e}");
            self.evict_and_reconnect(instance, "keepalive failure").await;
            return;
        }

        if let Err(e) = self.health_check(instance).await {
            warn!("health check failed for {instance}: {e}");
            self.evict_and_reconnect(instance, "health check failure").await;
        }
    }

    async fn evict_and_reconnect(self: &Arc<Self>, instance: &str, reason: &'static str) {
        self.metrics.record_health_check(instance, false).await;
        self.event_log
            .log(instance, EventType::Disconnected, reason)
            .await;
        self.state_tracker
            .set(instance, ConnectionState::Disconnected)
            .await;
        self.clients.write().await.remove(instance);
        self.trigger_reconnect(instance, reason).await;
    }

    /// Validates inputs, enforces rate limiting and the connection cap,
    /// dials, and on success records state/metrics/events.
    pub async fn connect(
        self: &Arc<Self>,
        instance: &str,
        host: &str,
        port: u16,
        private_key_path: &str,
    ) -> Result<ClientHandle> {
        if instance.is_empty() || host.is_empty() || port == 0 {
            return Err(SshCoreError::Validation(
                "instance and host must be non-empty and port must be in 1..65535".to_string(),
            ));
        }

        if let Ok(addr) = host.parse::<std::net::IpAddr>() {
            if !self.ip_allowlist.check(addr) {
                self.event_log
                    .log(instance, EventType::IpRestricted, host.to_string())
                    .await;
                return Err(SshCoreError::IpBlocked);
            }
        }

        if let Err(e) = self.rate_limiter.allow(instance).await {
            self.event_log
                .log(instance, EventType::RateLimited, e.to_string())
                .await;
            return Err(e);
        }

        if self.config.max_connections > 0 {
            let already_present = self.clients.read().await.contains_key(instance);
            if !already_present && self.clients.read().await.len() >= self.config.max_connections {
                return Err(SshCoreError::Validation(
                    "connection limit reached".to_string(),
                ));
            }
        }

        self.state_tracker
            .set(instance, ConnectionState::Connecting)
            .await;

        match self.dial(instance, host, port, private_key_path).await {
            Ok(client) => {
                self.params.write().await.insert(
                    instance.to_string(),
                    ConnectionParams {
                        host: host.to_string(),
                        port,
                        private_key_path: private_key_path.to_string(),
                    },
                );
                if let Some(old) = self.clients.write().await.insert(instance.to_string(), client.clone()) {
                    let _ = old.disconnect(russh::Disconnect::ByApplication, "replaced", "en").await;
                }
                self.metrics.record_connected(instance).await;
                self.rate_limiter.record_success(instance).await;
                self.state_tracker
                    .set(instance, ConnectionState::Connected)
                    .await;
                self.event_log
                    .log(instance, EventType::Connected, format!("{host}:{port}"))
                    .await;
                info!("connected to {instance} at {host}:{port}");
                Ok(client)
            }
            Err(e) => {
                self.state_tracker
                    .set(instance, ConnectionState::Disconnected)
                    .await;
                self.rate_limiter.record_failure(instance).await;
                Err(e)
            }
        }
    }

    /// Loads+parses the private key at `private_key_path` once for this
    /// call, then dials and authenticates with it.
    async fn dial(&self, instance: &str, host: &str, port: u16, private_key_path: &str) -> Result<ClientHandle> {
        let key = KeyProvider::load_private_key(Path::new(private_key_path))
            .map_err(|e| SshCoreError::Auth(format!("loading private key {private_key_path}: {e}")))?;

        let config = Arc::new(russh::client::Config::default());
        let forward_targets = self.forward_targets_for(instance).await;
        let handler =
            FleetClientHandler::new(instance.to_string(), self.seen_host_keys.clone(), forward_targets);

        let mut handle = tokio::time::timeout(
            DIAL_TIMEOUT,
            russh::client::connect(config, (host, port), handler),
        )
        .await
        .map_err(|_| SshCoreError::Dial("dial timed out".to_string()))?
        .map_err(|e| SshCoreError::Dial(e.to_string()))?;

        let authenticated = handle
            .authenticate_publickey("root", PrivateKeyWithHashAlg::new(Arc::new(key), Some(HashAlg::Sha256)))
            .await
            .map_err(|e| SshCoreError::Auth(e.to_string()))?;

        if !authenticated {
            return Err(SshCoreError::Auth("server rejected public key".to_string()));
        }

        Ok(handle)
    }

    /// Returns the cached client if present; otherwise resolves the
    /// address and installs the key via `orchestrator` exactly once, then
    /// connects. If connection params are already cached from a previous
    /// connection, reuses them instead of re-resolving.
    pub async fn ensure_connected(
        self: &Arc<Self>,
        instance: &str,
        orchestrator: &dyn Orchestrator,
    ) -> Result<ClientHandle> {
        if let Some(client) = self.clients.read().await.get(instance).cloned() {
            return Ok(client);
        }

        if let Some(params) = self.params.read().await.get(instance).cloned() {
            return self
                .connect(instance, &params.host, params.port, &params.private_key_path)
                .await;
        }

        let (host, port) = orchestrator.get_ssh_address(instance).await?;
        orchestrator
            .configure_ssh_access(instance, &self.public_key_text)
            .await?;
        self.connect(instance, &host, port, &self.key_path).await
    }

    /// Opens a session, runs `echo ping` with a 5s deadline, and verifies
    /// the exact expected output.
    pub async fn health_check(self: &Arc<Self>, instance: &str) -> Result<()> {
        let client = self
            .clients
            .read()
            .await
            .get(instance)
            .cloned()
            .ok_or_else(|| SshCoreError::NotFound(instance.to_string()))?;

        let result = tokio::time::timeout(
            self.config.health_check_timeout,
            run_health_check_command(&client),
        )
        .await;

        match result {
            Ok(Ok(output)) if output == HEALTH_CHECK_EXPECTED => {
                self.metrics.record_health_check(instance, true).await;
                Ok(())
            }
            Ok(Ok(output)) => {
                self.metrics.record_health_check(instance, false).await;
                self.event_log
                    .log(instance, EventType::HealthCheckFailed, format!("unexpected output: {output:?}"))
                    .await;
                Err(SshCoreError::Health("unexpected output".to_string()))
            }
            Ok(Err(e)) => {
                self.metrics.record_health_check(instance, false).await;
                self.event_log
                    .log(instance, EventType::HealthCheckFailed, e.to_string())
                    .await;
                Err(SshCoreError::Health(e.to_string()))
            }
            Err(_) => {
                self.metrics.record_health_check(instance, false).await;
                self.event_log
                    .log(instance, EventType::HealthCheckFailed, "timed out")
                    .await;
                Err(SshCoreError::Health("timed out".to_string()))
            }
        }
    }

    /// Starts (if not already running) the single reconnection sequence
    /// for `instance`. A no-op if one is already in flight.
    pub async fn trigger_reconnect(self: &Arc<Self>, instance: &str, reason: &'static str) {
        let mut reconnecting = self.reconnecting.lock().await;
        if !reconnecting.insert(instance.to_string()) {
            return;
        }
        drop(reconnecting);

        let params = match self.params.read().await.get(instance).cloned() {
            Some(p) => p,
            None => {
                info!("no cached params for {instance}, not reconnecting ({reason})");
                self.reconnecting.lock().await.remove(instance);
                return;
            }
        };

        self.state_tracker
            .set(instance, ConnectionState::Reconnecting)
            .await;
        self.event_log
            .log(instance, EventType::Reconnecting, reason)
            .await;

        let manager = self.clone();
        let instance = instance.to_string();
        let max_retries = self.config.max_reconnect_retries;
        self.tasks.lock().await.spawn(async move {
            manager.reconnect_with_backoff(&instance, params, max_retries).await;
            manager.reconnecting.lock().await.remove(&instance);
        });
    }

    async fn reconnect_with_backoff(self: &Arc<Self>, instance: &str, params: ConnectionParams, max_retries: u32) {
        let mut delay = self.config.reconnect_base_delay;
        for attempt in 1..=max_retries {
            if self.root_cancel.is_cancelled() {
                return;
            }

            self.clients.write().await.remove(instance);

            match self
                .connect(instance, &params.host, params.port, &params.private_key_path)
                .await
            {
                Ok(_) => {
                    self.event_log
                        .log(instance, EventType::ReconnectSuccess, format!("attempt {attempt}"))
                        .await;
                    return;
                }
                Err(e) => {
                    warn!("reconnect attempt {attempt} for {instance} failed: {e}");
                    tokio::select! {
                        _ = self.root_cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = std::cmp::min(
                        Duration::from_secs_f64(delay.as_secs_f64() * self.config.reconnect_factor),
                        self.config.reconnect_max_delay,
                    );
                }
            }
        }

        self.state_tracker.set(instance, ConnectionState::Failed).await;
        self.event_log
            .log(instance, EventType::ReconnectFailed, format!("exhausted after {max_retries} attempts"))
            .await;
        self.params.write().await.remove(instance);
        self.metrics.remove(instance).await;

        let callbacks = self.exhausted_callbacks.read().await.clone();
        for callback in callbacks.iter() {
            callback(instance, max_retries);
        }
    }

    /// Explicitly closes and forgets one instance, including its cached
    /// reconnection parameters.
    pub async fn close(&self, instance: &str) {
        if let Some(client) = self.clients.write().await.remove(instance) {
            let _ = client
                .disconnect(russh::Disconnect::ByApplication, "closed", "en")
                .await;
        }
        self.params.write().await.remove(instance);
        self.metrics.remove(instance).await;
        self.event_log
            .log(instance, EventType::Disconnected, "explicit close")
            .await;
        self.state_tracker.clear(instance).await;
    }

    /// Cancels every background task, waits for them to finish, closes
    /// every client, and clears all state.
    pub async fn close_all(&self) {
        self.root_cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        drop(tasks);

        let instances: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for instance in &instances {
            self.close(instance).await;
        }
        self.clients.write().await.clear();
        self.params.write().await.clear();
    }

    pub async fn get_client(&self, instance: &str) -> Option<ClientHandle> {
        self.clients.read().await.get(instance).cloned()
    }

    async fn forward_targets_for(&self, instance: &str) -> ForwardTargets {
        if let Some(existing) = self.forward_targets.read().await.get(instance) {
            return existing.clone();
        }
        self.forward_targets
            .write()
            .await
            .entry(instance.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
            .clone()
    }

    /// Registers where a `forwarded-tcpip` channel for `port` on
    /// `instance` should be bridged to, along with the byte counter its
    /// bridge task should tally into. Used for remote→local tunnels, after
    /// the caller has issued `tcpip_forward` on the client handle.
    pub async fn register_forward_target(
        &self,
        instance: &str,
        port: u16,
        target: std::net::SocketAddr,
        bytes: Arc<AtomicU64>,
    ) {
        let targets = self.forward_targets_for(instance).await;
        targets.write().await.insert(port, ForwardTarget { addr: target, bytes });
    }

    pub async fn clear_forward_target(&self, instance: &str, port: u16) {
        let targets = self.forward_targets_for(instance).await;
        targets.write().await.remove(&port);
    }

    pub async fn get_connection_params(&self, instance: &str) -> Option<ConnectionParams> {
        self.params.read().await.get(instance).cloned()
    }

    pub async fn connection_state(&self, instance: &str) -> ConnectionState {
        self.state_tracker.get(instance).await
    }

    pub async fn recent_transitions(&self, instance: &str, n: usize) -> Vec<crate::state_tracker::StateTransition> {
        self.state_tracker.get_recent(instance, n).await
    }

    pub async fn all_connection_states(&self) -> HashMap<String, ConnectionState> {
        self.state_tracker.all_states().await
    }

    pub async fn metrics(&self, instance: &str) -> Option<crate::metrics::ConnectionMetrics> {
        self.metrics.get(instance).await
    }

    pub async fn all_metrics(&self) -> HashMap<String, crate::metrics::ConnectionMetrics> {
        self.metrics.all().await
    }

    pub async fn recent_events(&self, instance: &str, n: usize) -> Vec<crate::event_log::ConnectionEvent> {
        self.event_log.recent(instance, n).await
    }

    pub async fn event_counts_by_type(&self, event_type: EventType) -> usize {
        self.event_log.count_by_type(event_type).await
    }

    pub async fn rate_limit_status(&self, instance: &str) -> crate::rate_limiter::RateLimitStatus {
        self.rate_limiter.status(instance).await
    }
}

/// What `TunnelManager` needs from `ConnectionManager`, kept as a trait so
/// the two are split by construction rather than one monolithic manager
/// (SPEC_FULL.md design note (c)).
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn borrow_client(&self, instance: &str) -> Option<ClientHandle>;
    async fn register_forward_target(&self, instance: &str, port: u16, target: SocketAddr, bytes: Arc<AtomicU64>);
    async fn clear_forward_target(&self, instance: &str, port: u16);
}

#[async_trait]
impl ConnectionSource for ConnectionManager {
    async fn borrow_client(&self, instance: &str) -> Option<ClientHandle> {
        self.get_client(instance).await
    }

    async fn register_forward_target(&self, instance: &str, port: u16, target: SocketAddr, bytes: Arc<AtomicU64>) {
        ConnectionManager::register_forward_target(self, instance, port, target, bytes).await
    }

    async fn clear_forward_target(&self, instance: &str, port: u16) {
        ConnectionManager::clear_forward_target(self, instance, port).await
    }
}

async fn run_health_check_command(client: &ClientHandle) -> std::result::Result<String, russh::Error> {
    let mut channel = client.channel_open_session().await?;
    channel.exec(true, HEALTH_CHECK_COMMAND).await?;

    let mut output = Vec::new();
    loop {
        match channel.wait().await {
            Some(russh::ChannelMsg::Data { data }) => output.extend_from_slice(&data),
            Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    Ok(String::from_utf8_lossy(&output).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::Config;
    use crate::rate_limiter::RateLimiterConfig;
    use crate::testutil::TestSshServer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct FixedOrchestrator {
        host: String,
        port: u16,
    }

    #[async_trait]
    impl Orchestrator for FixedOrchestrator {
        async fn get_ssh_address(&self, _instance: &str) -> Result<(String, u16)> {
            Ok((self.host.clone(), self.port))
        }

        async fn configure_ssh_access(&self, _instance: &str, _public_key_text: &str) -> Result<()> {
            Ok(())
        }

        async fn get_instance_status(&self, _instance: &str) -> Result<crate::orchestrator::InstanceStatus> {
            Ok(crate::orchestrator::InstanceStatus::Running)
        }

        async fn list_instances(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    /// Builds a manager backed by a real, freshly generated private key on
    /// disk. The returned `TempDir` must stay alive for as long as the
    /// manager may still dial using its default `key_path`.
    fn test_manager(config: Config) -> (Arc<ConnectionManager>, tempfile::TempDir, String) {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let rate_limiter_config = RateLimiterConfig::from(&config);
        let event_buffer_size = config.event_buffer_size;
        let transition_buffer_size = config.transition_buffer_size;

        let key_dir = tempfile::tempdir().unwrap();
        let provider = KeyProvider::new(key_dir.path());
        let (_signer, public_key_text) = provider.ensure_key_pair().unwrap();
        let key_path = provider.private_key_path().to_string_lossy().to_string();

        let manager = ConnectionManager::new(
            config,
            clock.clone(),
            key_path.clone(),
            public_key_text,
            Arc::new(RateLimiter::new(rate_limiter_config, clock.clone())),
            Arc::new(StateTracker::new(clock.clone(), transition_buffer_size)),
            Arc::new(EventLog::new(clock.clone(), event_buffer_size)),
            Arc::new(Metrics::new(clock)),
        );
        (manager, key_dir, key_path)
    }

    #[tokio::test]
    async fn connect_then_health_check_succeeds_against_live_server() {
        let server = TestSshServer::start().await;
        let (manager, _key_dir, key_path) = test_manager(Config::default());

        manager
            .connect("bot-a", "127.0.0.1", server.port(), &key_path)
            .await
            .expect("connect should succeed");

        assert_eq!(
            manager.connection_state("bot-a").await,
            ConnectionState::Connected
        );
        manager.health_check("bot-a").await.expect("health check should pass");

        server.stop().await;
    }

    #[tokio::test]
    async fn ensure_connected_resolves_address_only_once() {
        let server = TestSshServer::start().await;
        let (manager, _key_dir, _key_path) = test_manager(Config::default());
        let orchestrator = FixedOrchestrator {
            host: "127.0.0.1".to_string(),
            port: server.port(),
        };

        manager
            .ensure_connected("bot-a", &orchestrator)
            .await
            .expect("first ensure_connected should dial");
        manager
            .ensure_connected("bot-a", &orchestrator)
            .await
            .expect("second ensure_connected should reuse cached client");

        assert!(manager.get_connection_params("bot-a").await.is_some());
        server.stop().await;
    }

    #[tokio::test]
    async fn connect_with_nonexistent_key_fails_with_auth_error() {
        let (manager, _key_dir, _key_path) = test_manager(Config::default());
        let err = manager
            .connect("bot-a", "127.0.0.1", 1, "/nonexistent/id_ed25519")
            .await
            .unwrap_err();
        assert!(matches!(err, SshCoreError::Auth(_)));
    }

    #[tokio::test]
    async fn rate_limit_trip_emits_event_and_denies_second_attempt() {
        let config = Config {
            rate_limit_max_per_minute: 1,
            ..Config::default()
        };
        let (manager, _key_dir, _key_path) = test_manager(config);

        let first = manager
            .connect("bot-a", "127.0.0.1", 1, "/nonexistent/id_ed25519")
            .await
            .unwrap_err();
        assert!(matches!(first, SshCoreError::Auth(_)));

        let second = manager
            .connect("bot-a", "127.0.0.1", 1, "/nonexistent/id_ed25519")
            .await
            .unwrap_err();
        assert!(matches!(second, SshCoreError::RateLimited));
        assert_eq!(manager.event_counts_by_type(EventType::RateLimited).await, 1);
    }

    #[tokio::test]
    async fn connect_rejects_host_outside_allow_list() {
        let config = Config {
            allowed_source_ips: "10.0.0.0/24".to_string(),
            ..Config::default()
        };
        let (manager, _key_dir, _key_path) = test_manager(config);

        let err = manager
            .connect("bot-a", "127.0.0.1", 22, "/nonexistent/id_ed25519")
            .await
            .unwrap_err();
        assert!(matches!(err, SshCoreError::IpBlocked));
        assert_eq!(manager.event_counts_by_type(EventType::IpRestricted).await, 1);
    }

    #[tokio::test]
    async fn connect_allows_host_inside_allow_list() {
        let server = TestSshServer::start().await;
        let config = Config {
            allowed_source_ips: "127.0.0.1/32".to_string(),
            ..Config::default()
        };
        let (manager, _key_dir, key_path) = test_manager(config);

        manager
            .connect("bot-a", "127.0.0.1", server.port(), &key_path)
            .await
            .expect("host inside the allow-list should be admitted");

        server.stop().await;
    }

    #[tokio::test]
    async fn close_all_clears_every_map() {
        let server = TestSshServer::start().await;
        let (manager, _key_dir, key_path) = test_manager(Config::default());
        manager
            .connect("bot-a", "127.0.0.1", server.port(), &key_path)
            .await
            .unwrap();

        manager.close_all().await;

        assert!(manager.get_client("bot-a").await.is_none());
        assert!(manager.get_connection_params("bot-a").await.is_none());
        server.stop().await;
    }

    /// Spec scenario: permanent reconnect failure exhausts retries against
    /// a port nothing listens on. Final state is `Failed`, cached params
    /// and metrics are dropped, and the exhaustion is observable through
    /// `on_reconnect_exhausted` rather than only through state/events.
    #[tokio::test]
    async fn reconnect_exhaustion_sets_failed_state_and_fires_exhausted_callback() {
        let config = Config {
            reconnect_base_delay: Duration::from_millis(1),
            reconnect_max_delay: Duration::from_millis(2),
            ..Config::default()
        };
        let (manager, _key_dir, key_path) = test_manager(config);

        manager.metrics.record_connected("bot-a").await;
        manager.params.write().await.insert(
            "bot-a".to_string(),
            ConnectionParams {
                host: "127.0.0.1".to_string(),
                port: 1,
                private_key_path: key_path,
            },
        );

        let exhausted_count = Arc::new(AtomicUsize::new(0));
        let exhausted_clone = exhausted_count.clone();
        manager
            .on_reconnect_exhausted(move |_instance, _attempts| {
                exhausted_clone.fetch_add(1, AtomicOrdering::SeqCst);
            })
            .await;

        let params = manager.params.read().await.get("bot-a").cloned().unwrap();
        manager.reconnect_with_backoff("bot-a", params, 2).await;

        assert_eq!(manager.connection_state("bot-a").await, ConnectionState::Failed);
        assert_eq!(manager.event_counts_by_type(EventType::ReconnectFailed).await, 1);
        assert!(manager.get_connection_params("bot-a").await.is_none());
        assert!(manager.metrics("bot-a").await.is_none());
        assert_eq!(exhausted_count.load(AtomicOrdering::SeqCst), 1);
    }

    /// Spec scenario: firing `trigger_reconnect` from many tasks
    /// concurrently while the client is missing starts exactly one
    /// reconnection sequence.
    #[tokio::test]
    async fn concurrent_trigger_reconnect_starts_only_one_sequence() {
        let config = Config {
            reconnect_base_delay: Duration::from_millis(1),
            reconnect_max_delay: Duration::from_millis(2),
            max_reconnect_retries: 2,
            ..Config::default()
        };
        let (manager, _key_dir, key_path) = test_manager(config);
        manager.params.write().await.insert(
            "bot-a".to_string(),
            ConnectionParams {
                host: "127.0.0.1".to_string(),
                port: 1,
                private_key_path: key_path,
            },
        );

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.trigger_reconnect("bot-a", "concurrent trigger").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(manager.event_counts_by_type(EventType::Reconnecting).await, 1);
        manager.close_all().await;
    }
}
