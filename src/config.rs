//! Tunable knobs for the connection and tunnel subsystem.
//!
//! Grounded on the teacher's `OnceLock`-backed global `Config`
//! (env-var driven), generalized from "panic if missing" (appropriate for
//! the teacher's three *required* secrets) to "parse if present, default
//! otherwise", since every knob enumerated here has a sane default.

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::ConfigError;

static CONFIG: OnceLock<Config> = OnceLock::new();

mod env_var {
    pub const KEEPALIVE_INTERVAL_SECS: &str = "SSH_KEEPALIVE_INTERVAL_SECS";
    pub const HEALTH_CHECK_TIMEOUT_SECS: &str = "SSH_HEALTH_CHECK_TIMEOUT_SECS";
    pub const MAX_RECONNECT_RETRIES: &str = "SSH_MAX_RECONNECT_RETRIES";
    pub const RECONNECT_BASE_DELAY_SECS: &str = "SSH_RECONNECT_BASE_DELAY_SECS";
    pub const RECONNECT_MAX_DELAY_SECS: &str = "SSH_RECONNECT_MAX_DELAY_SECS";
    pub const RECONNECT_FACTOR: &str = "SSH_RECONNECT_FACTOR";
    pub const TUNNEL_HEALTH_INTERVAL_GLOBAL_SECS: &str = "SSH_TUNNEL_HEALTH_INTERVAL_GLOBAL_SECS";
    pub const TUNNEL_HEALTH_INTERVAL_PER_INSTANCE_SECS: &str =
        "SSH_TUNNEL_HEALTH_INTERVAL_PER_INSTANCE_SECS";
    pub const TUNNEL_PROBE_TIMEOUT_SECS: &str = "SSH_TUNNEL_PROBE_TIMEOUT_SECS";
    pub const TUNNEL_RECONNECT_MAX_DELAY_SECS: &str = "SSH_TUNNEL_RECONNECT_MAX_DELAY_SECS";
    pub const RATE_LIMIT_MAX_PER_MINUTE: &str = "SSH_RATE_LIMIT_MAX_PER_MINUTE";
    pub const RATE_LIMIT_MAX_CONSEC_FAILURES: &str = "SSH_RATE_LIMIT_MAX_CONSEC_FAILURES";
    pub const RATE_LIMIT_BLOCK_DURATION_SECS: &str = "SSH_RATE_LIMIT_BLOCK_DURATION_SECS";
    pub const EVENT_BUFFER_SIZE: &str = "SSH_EVENT_BUFFER_SIZE";
    pub const TRANSITION_BUFFER_SIZE: &str = "SSH_TRANSITION_BUFFER_SIZE";
    pub const MAX_CONNECTIONS: &str = "SSH_MAX_CONNECTIONS";
    pub const ALLOWED_SOURCE_IPS: &str = "SSH_ALLOWED_SOURCE_IPS";
    pub const KEY_DIR: &str = "SSH_KEY_DIR";
}

#[derive(Debug, Clone)]
pub struct Config {
    pub keepalive_interval: Duration,
    pub health_check_timeout: Duration,
    pub max_reconnect_retries: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_factor: f64,
    pub tunnel_health_interval_global: Duration,
    pub tunnel_health_interval_per_instance: Duration,
    pub tunnel_probe_timeout: Duration,
    pub tunnel_reconnect_max_delay: Duration,
    pub rate_limit_max_per_minute: u32,
    pub rate_limit_max_consec_failures: u32,
    pub rate_limit_block_duration: Duration,
    pub event_buffer_size: usize,
    pub transition_buffer_size: usize,
    /// 0 means unlimited.
    pub max_connections: usize,
    /// Comma-separated CIDR/IP allow-list; empty string allows all.
    pub allowed_source_ips: String,
    /// Directory the shared fleet keypair is loaded from / generated into.
    pub key_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            max_reconnect_retries: 10,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(16),
            reconnect_factor: 2.0,
            tunnel_health_interval_global: Duration::from_secs(60),
            tunnel_health_interval_per_instance: Duration::from_secs(10),
            tunnel_probe_timeout: Duration::from_secs(5),
            tunnel_reconnect_max_delay: Duration::from_secs(60),
            rate_limit_max_per_minute: 10,
            rate_limit_max_consec_failures: 5,
            rate_limit_block_duration: Duration::from_secs(5 * 60),
            event_buffer_size: 100,
            transition_buffer_size: 256,
            max_connections: 0,
            allowed_source_ips: String::new(),
            key_dir: "ssh_keys".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from the environment, falling back to
    /// [`Config::default`] for every variable that is unset. Returns
    /// `ConfigError` only when a *present* variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            keepalive_interval: parse_secs(env_var::KEEPALIVE_INTERVAL_SECS, defaults.keepalive_interval)?,
            health_check_timeout: parse_secs(
                env_var::HEALTH_CHECK_TIMEOUT_SECS,
                defaults.health_check_timeout,
            )?,
            max_reconnect_retries: parse_var(
                env_var::MAX_RECONNECT_RETRIES,
                defaults.max_reconnect_retries,
            )?,
            reconnect_base_delay: parse_secs(
                env_var::RECONNECT_BASE_DELAY_SECS,
                defaults.reconnect_base_delay,
            )?,
            reconnect_max_delay: parse_secs(
                env_var::RECONNECT_MAX_DELAY_SECS,
                defaults.reconnect_max_delay,
            )?,
            reconnect_factor: parse_var(env_var::RECONNECT_FACTOR, defaults.reconnect_factor)?,
            tunnel_health_interval_global: parse_secs(
                env_var::TUNNEL_HEALTH_INTERVAL_GLOBAL_SECS,
                defaults.tunnel_health_interval_global,
            )?,
            tunnel_health_interval_per_instance: parse_secs(
                env_var::TUNNEL_HEALTH_INTERVAL_PER_INSTANCE_SECS,
                defaults.tunnel_health_interval_per_instance,
            )?,
            tunnel_probe_timeout: parse_secs(
                env_var::TUNNEL_PROBE_TIMEOUT_SECS,
                defaults.tunnel_probe_timeout,
            )?,
            tunnel_reconnect_max_delay: parse_secs(
                env_var::TUNNEL_RECONNECT_MAX_DELAY_SECS,
                defaults.tunnel_reconnect_max_delay,
            )?,
            rate_limit_max_per_minute: parse_var(
                env_var::RATE_LIMIT_MAX_PER_MINUTE,
                defaults.rate_limit_max_per_minute,
            )?,
            rate_limit_max_consec_failures: parse_var(
                env_var::RATE_LIMIT_MAX_CONSEC_FAILURES,
                defaults.rate_limit_max_consec_failures,
            )?,
            rate_limit_block_duration: parse_secs(
                env_var::RATE_LIMIT_BLOCK_DURATION_SECS,
                defaults.rate_limit_block_duration,
            )?,
            event_buffer_size: parse_var(env_var::EVENT_BUFFER_SIZE, defaults.event_buffer_size)?,
            transition_buffer_size: parse_var(
                env_var::TRANSITION_BUFFER_SIZE,
                defaults.transition_buffer_size,
            )?,
            max_connections: parse_var(env_var::MAX_CONNECTIONS, defaults.max_connections)?,
            allowed_source_ips: env::var(env_var::ALLOWED_SOURCE_IPS)
                .unwrap_or(defaults.allowed_source_ips),
            key_dir: env::var(env_var::KEY_DIR).unwrap_or(defaults.key_dir),
        })
    }
}

/// Initializes the global config snapshot from the environment. Must be
/// called once at startup by the embedding binary; subsequent calls are
/// no-ops.
pub fn init() -> Result<(), ConfigError> {
    let config = Config::from_env()?;
    let _ = CONFIG.get_or_init(|| config);
    Ok(())
}

/// Returns the global configuration. Panics if [`init`] has not run.
pub fn get() -> &'static Config {
    CONFIG.get().expect("config::init() has not been called")
}

fn parse_secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_knob_values() {
        let config = Config::default();
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.max_reconnect_retries, 10);
        assert_eq!(config.rate_limit_max_per_minute, 10);
        assert_eq!(config.max_connections, 0);
    }

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        // SAFETY: test is single-threaded w.r.t. this variable and cleans up after itself.
        env::remove_var(env_var::MAX_RECONNECT_RETRIES);
        let config = Config::from_env().unwrap();
        assert_eq!(config.max_reconnect_retries, 10);
    }

    #[test]
    fn from_env_rejects_malformed_present_value() {
        env::set_var(env_var::MAX_RECONNECT_RETRIES, "not-a-number");
        let result = Config::from_env();
        env::remove_var(env_var::MAX_RECONNECT_RETRIES);
        assert!(result.is_err());
    }
}
