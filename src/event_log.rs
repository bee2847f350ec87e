//! Per-instance event history, capacity 100.
//!
//! Grounded on the teacher's logging-at-the-call-site convention (every
//! `state.rs` / `ssh/tunnel.rs` mutation logs via the `log` crate at the
//! point of the state change) plus a dedicated ring buffer for queryable
//! history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::info;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::ring_buffer::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EventType {
    Connected,
    Disconnected,
    HealthCheckFailed,
    Reconnecting,
    ReconnectSuccess,
    ReconnectFailed,
    RateLimited,
    IpRestricted,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::Disconnected => "disconnected",
            EventType::HealthCheckFailed => "health_check_failed",
            EventType::Reconnecting => "reconnecting",
            EventType::ReconnectSuccess => "reconnect_success",
            EventType::ReconnectFailed => "reconnect_failed",
            EventType::RateLimited => "rate_limited",
            EventType::IpRestricted => "ip_restricted",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionEvent {
    pub instance_name: String,
    pub event_type: EventType,
    pub details: String,
    #[serde(serialize_with = "crate::serde_time::as_secs_ago")]
    pub timestamp: Instant,
}

pub struct EventLog {
    clock: Arc<dyn Clock>,
    capacity: usize,
    events: RwLock<HashMap<String, RingBuffer<ConnectionEvent>>>,
}

impl EventLog {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            clock,
            capacity,
            events: RwLock::new(HashMap::new()),
        }
    }

    pub async fn log(&self, instance: &str, event_type: EventType, details: impl Into<String>) {
        let details = details.into();
        info!("[{instance}] {}: {details}", event_type.as_str());

        let event = ConnectionEvent {
            instance_name: instance.to_string(),
            event_type,
            details,
            timestamp: self.clock.now(),
        };

        let capacity = self.capacity;
        let mut events = self.events.write().await;
        events
            .entry(instance.to_string())
            .or_insert_with(|| RingBuffer::new(capacity))
            .push(event);
    }

    pub async fn get(&self, instance: &str) -> Vec<ConnectionEvent> {
        let events = self.events.read().await;
        events.get(instance).map(|b| b.all()).unwrap_or_default()
    }

    pub async fn recent(&self, instance: &str, n: usize) -> Vec<ConnectionEvent> {
        let events = self.events.read().await;
        events
            .get(instance)
            .map(|b| b.recent(n))
            .unwrap_or_default()
    }

    /// Scans every instance, returning only event types with a non-zero
    /// count.
    pub async fn count_by_type(&self, event_type: EventType) -> usize {
        let events = self.events.read().await;
        events
            .values()
            .flat_map(|b| b.all())
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    const EVENT_BUFFER_SIZE: usize = 100;

    fn log() -> EventLog {
        EventLog::new(Arc::new(TestClock::new()), EVENT_BUFFER_SIZE)
    }

    #[tokio::test]
    async fn log_and_get_round_trip() {
        let log = log();
        log.log("bot-a", EventType::Connected, "dialed 127.0.0.1:22")
            .await;
        let events = log.get("bot-a").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Connected);
    }

    #[tokio::test]
    async fn ring_buffer_never_exceeds_capacity() {
        let log = log();
        for i in 0..250 {
            log.log("bot-a", EventType::Reconnecting, format!("attempt {i}"))
                .await;
        }
        assert_eq!(log.get("bot-a").await.len(), EVENT_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn count_by_type_spans_all_instances() {
        let log = log();
        log.log("bot-a", EventType::RateLimited, "").await;
        log.log("bot-b", EventType::RateLimited, "").await;
        log.log("bot-b", EventType::Connected, "").await;
        assert_eq!(log.count_by_type(EventType::RateLimited).await, 2);
        assert_eq!(log.count_by_type(EventType::IpRestricted).await, 0);
    }

    #[tokio::test]
    async fn unknown_instance_returns_empty() {
        let log = log();
        assert!(log.get("nope").await.is_empty());
        assert!(log.recent("nope", 10).await.is_empty());
    }
}
