//! Error types for the SSH connection and tunnel subsystem.

use std::time::Instant;

/// Top-level error type returned by the connection manager, tunnel manager,
/// and maintenance loop.
#[derive(Debug, thiserror::Error)]
pub enum SshCoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("rate limit exceeded for instance")]
    RateLimited,

    #[error("source IP is not in the allow-list")]
    IpBlocked,

    #[error("instance is temporarily blocked after repeated failures")]
    TemporarilyBlocked { until: Instant },

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("health check failed: {0}")]
    Health(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("reconnection exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SshCoreError>;

/// Errors from [`crate::key::KeyProvider`].
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key material: {0}")]
    Format(#[source] anyhow::Error),
}

/// Errors from [`crate::config::Config`] loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}
