//! Per-instance sliding-window rate limiting with a consecutive-failure
//! block, mirroring the teacher's `RateLimitEntry` / atomic
//! check-and-record idiom (`state.rs::check_and_record_device_flow`),
//! generalized from a single IP-keyed global window to a per-instance
//! window with an independent consecutive-failure/block axis.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::SshCoreError;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub max_attempts_per_minute: u32,
    pub max_consecutive_failures: u32,
    pub block_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_minute: 10,
            max_consecutive_failures: 5,
            block_duration: Duration::from_secs(5 * 60),
        }
    }
}

impl From<&Config> for RateLimiterConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts_per_minute: config.rate_limit_max_per_minute,
            max_consecutive_failures: config.rate_limit_max_consec_failures,
            block_duration: config.rate_limit_block_duration,
        }
    }
}

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone)]
struct Entry {
    attempts: Vec<Instant>,
    consecutive_failures: u32,
    blocked_until: Option<Instant>,
}

/// Current state of one instance's rate limiter, for status endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateLimitStatus {
    pub recent_attempts: usize,
    pub max_per_minute: u32,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub blocked: bool,
    #[serde(serialize_with = "crate::serde_time::as_secs_remaining_opt")]
    pub blocked_until: Option<Instant>,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Prunes attempts older than 60s, records `now`, and denies if the
    /// window count exceeds the limit or a block is still in effect.
    pub async fn allow(&self, instance: &str) -> Result<(), SshCoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(instance.to_string()).or_default();

        if let Some(until) = entry.blocked_until {
            if now < until {
                return Err(SshCoreError::TemporarilyBlocked { until });
            }
        }

        entry.attempts.retain(|t| now.duration_since(*t) < WINDOW);
        if entry.attempts.len() as u32 >= self.config.max_attempts_per_minute {
            warn!("rate limit exceeded for instance {instance}");
            return Err(SshCoreError::RateLimited);
        }
        entry.attempts.push(now);
        Ok(())
    }

    /// Zeros the consecutive-failure counter and clears any active block.
    pub async fn record_success(&self, instance: &str) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(instance.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.blocked_until = None;
    }

    /// Increments the consecutive-failure counter; at exactly the
    /// threshold, sets `blocked_until = now + block_duration`.
    pub async fn record_failure(&self, instance: &str) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(instance.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures == self.config.max_consecutive_failures {
            entry.blocked_until = Some(now + self.config.block_duration);
        }
    }

    pub async fn reset(&self, instance: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(instance);
    }

    pub async fn status(&self, instance: &str) -> RateLimitStatus {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        match entries.get(instance) {
            Some(entry) => {
                let recent = entry
                    .attempts
                    .iter()
                    .filter(|t| now.duration_since(**t) < WINDOW)
                    .count();
                RateLimitStatus {
                    recent_attempts: recent,
                    max_per_minute: self.config.max_attempts_per_minute,
                    consecutive_failures: entry.consecutive_failures,
                    max_consecutive_failures: self.config.max_consecutive_failures,
                    blocked: entry.blocked_until.map(|u| now < u).unwrap_or(false),
                    blocked_until: entry.blocked_until,
                }
            }
            None => RateLimitStatus {
                recent_attempts: 0,
                max_per_minute: self.config.max_attempts_per_minute,
                consecutive_failures: 0,
                max_consecutive_failures: self.config.max_consecutive_failures,
                blocked: false,
                blocked_until: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn limiter(cfg: RateLimiterConfig) -> (RateLimiter, TestClock) {
        let clock = TestClock::new();
        let limiter = RateLimiter::new(cfg, Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[tokio::test]
    async fn denies_after_window_exceeds_limit() {
        let (limiter, _clock) = limiter(RateLimiterConfig {
            max_attempts_per_minute: 2,
            ..Default::default()
        });
        limiter.allow("bot-a").await.unwrap();
        limiter.allow("bot-a").await.unwrap();
        let err = limiter.allow("bot-a").await.unwrap_err();
        assert!(matches!(err, SshCoreError::RateLimited));
    }

    #[tokio::test]
    async fn window_prunes_old_attempts() {
        let (limiter, clock) = limiter(RateLimiterConfig {
            max_attempts_per_minute: 1,
            ..Default::default()
        });
        limiter.allow("bot-a").await.unwrap();
        assert!(limiter.allow("bot-a").await.is_err());
        clock.advance(Duration::from_secs(61));
        assert!(limiter.allow("bot-a").await.is_ok());
    }

    #[tokio::test]
    async fn blocks_after_consecutive_failures_and_clears_on_success() {
        let (limiter, clock) = limiter(RateLimiterConfig {
            max_consecutive_failures: 2,
            block_duration: Duration::from_secs(300),
            ..Default::default()
        });
        limiter.record_failure("bot-a").await;
        limiter.record_failure("bot-a").await;
        let err = limiter.allow("bot-a").await.unwrap_err();
        match err {
            SshCoreError::TemporarilyBlocked { until } => {
                assert_eq!(until, clock.now() + Duration::from_secs(300));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        limiter.record_success("bot-a").await;
        assert!(limiter.allow("bot-a").await.is_ok());
    }

    #[tokio::test]
    async fn instances_are_independent() {
        let (limiter, _clock) = limiter(RateLimiterConfig {
            max_attempts_per_minute: 1,
            ..Default::default()
        });
        limiter.allow("bot-a").await.unwrap();
        assert!(limiter.allow("bot-a").await.is_err());
        assert!(limiter.allow("bot-b").await.is_ok());
    }
}
