//! Per-instance health counters and derived uptime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::clock::Clock;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionMetrics {
    #[serde(serialize_with = "crate::serde_time::as_secs_ago")]
    pub connected_at: Instant,
    #[serde(serialize_with = "crate::serde_time::as_secs_ago_opt")]
    pub last_health_check: Option<Instant>,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub healthy: bool,
}

impl ConnectionMetrics {
    fn new(now: Instant) -> Self {
        Self {
            connected_at: now,
            last_health_check: None,
            successful_checks: 0,
            failed_checks: 0,
            healthy: true,
        }
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.connected_at)
    }
}

pub struct Metrics {
    clock: Arc<dyn Clock>,
    by_instance: RwLock<HashMap<String, ConnectionMetrics>>,
}

impl Metrics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            by_instance: RwLock::new(HashMap::new()),
        }
    }

    /// Resets/creates the metrics record for a newly connected instance.
    pub async fn record_connected(&self, instance: &str) {
        let now = self.clock.now();
        self.by_instance
            .write()
            .await
            .insert(instance.to_string(), ConnectionMetrics::new(now));
    }

    pub async fn record_health_check(&self, instance: &str, success: bool) {
        let now = self.clock.now();
        let mut by_instance = self.by_instance.write().await;
        if let Some(metrics) = by_instance.get_mut(instance) {
            metrics.last_health_check = Some(now);
            metrics.healthy = success;
            if success {
                metrics.successful_checks += 1;
            } else {
                metrics.failed_checks += 1;
            }
        }
    }

    pub async fn remove(&self, instance: &str) {
        self.by_instance.write().await.remove(instance);
    }

    pub async fn get(&self, instance: &str) -> Option<ConnectionMetrics> {
        self.by_instance.read().await.get(instance).cloned()
    }

    pub async fn all(&self) -> HashMap<String, ConnectionMetrics> {
        self.by_instance.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    #[tokio::test]
    async fn record_connected_then_health_checks_update_counters() {
        let clock = TestClock::new();
        let metrics = Metrics::new(Arc::new(clock.clone()));

        metrics.record_connected("bot-a").await;
        metrics.record_health_check("bot-a", true).await;
        metrics.record_health_check("bot-a", false).await;

        let m = metrics.get("bot-a").await.unwrap();
        assert_eq!(m.successful_checks, 1);
        assert_eq!(m.failed_checks, 1);
        assert!(!m.healthy);
    }

    #[tokio::test]
    async fn uptime_tracks_clock() {
        let clock = TestClock::new();
        let metrics = Metrics::new(Arc::new(clock.clone()));
        metrics.record_connected("bot-a").await;
        clock.advance(std::time::Duration::from_secs(30));
        let m = metrics.get("bot-a").await.unwrap();
        assert_eq!(m.uptime(clock.now()), std::time::Duration::from_secs(30));
    }

    #[tokio::test]
    async fn remove_drops_the_record() {
        let metrics = Metrics::new(Arc::new(TestClock::new()));
        metrics.record_connected("bot-a").await;
        metrics.remove("bot-a").await;
        assert!(metrics.get("bot-a").await.is_none());
    }
}
