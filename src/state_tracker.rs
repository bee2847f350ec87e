//! Per-instance connection state plus a bounded history of transitions,
//! with change callbacks fired outside the lock.
//!
//! Grounded on the teacher's `RwLock<HashMap<..>>` map idiom
//! (`state.rs::AppState`) and the state-machine shape from the
//! `other_examples` `ConnectionState` enum
//! (`Disconnected/Connecting/Connected/Reconnecting/Error`), adapted to
//! this subsystem's five-state machine with an explicit transition ring
//! buffer instead of a single current value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::ring_buffer::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    #[serde(serialize_with = "crate::serde_time::as_secs_ago")]
    pub timestamp: Instant,
}

type ChangeCallback = Arc<dyn Fn(&str, ConnectionState, ConnectionState) + Send + Sync>;

struct InstanceRecord {
    state: ConnectionState,
    transitions: RingBuffer<StateTransition>,
}

impl InstanceRecord {
    fn new(capacity: usize) -> Self {
        Self {
            state: ConnectionState::default(),
            transitions: RingBuffer::new(capacity),
        }
    }
}

pub struct StateTracker {
    clock: Arc<dyn Clock>,
    capacity: usize,
    records: RwLock<HashMap<String, InstanceRecord>>,
    callbacks: RwLock<Vec<ChangeCallback>>,
}

impl StateTracker {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            clock,
            capacity,
            records: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub async fn on_change<F>(&self, callback: F)
    where
        F: Fn(&str, ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.callbacks.write().await.push(Arc::new(callback));
    }

    pub async fn get(&self, instance: &str) -> ConnectionState {
        let records = self.records.read().await;
        records
            .get(instance)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    /// Sets the new state, returning the old one. A no-op (no transition
    /// recorded, no callbacks fired) if `new_state == old_state`.
    pub async fn set(&self, instance: &str, new_state: ConnectionState) -> ConnectionState {
        let old_state = {
            let mut records = self.records.write().await;
            let capacity = self.capacity;
            let record = records
                .entry(instance.to_string())
                .or_insert_with(|| InstanceRecord::new(capacity));
            let old_state = record.state;
            if old_state == new_state {
                return old_state;
            }
            record.transitions.push(StateTransition {
                from: old_state,
                to: new_state,
                timestamp: self.clock.now(),
            });
            record.state = new_state;
            old_state
        };

        let callbacks = self.callbacks.read().await.clone();
        for callback in callbacks.iter() {
            callback(instance, old_state, new_state);
        }
        old_state
    }

    /// Resets the live state to `Disconnected` but preserves transition
    /// history for post-mortem inspection.
    pub async fn remove(&self, instance: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(instance) {
            record.state = ConnectionState::default();
        }
    }

    /// Drops the instance entirely, including its transition history.
    pub async fn clear(&self, instance: &str) {
        self.records.write().await.remove(instance);
    }

    pub async fn get_transitions(&self, instance: &str) -> Vec<StateTransition> {
        let records = self.records.read().await;
        records
            .get(instance)
            .map(|r| r.transitions.all())
            .unwrap_or_default()
    }

    pub async fn get_recent(&self, instance: &str, n: usize) -> Vec<StateTransition> {
        let records = self.records.read().await;
        records
            .get(instance)
            .map(|r| r.transitions.recent(n))
            .unwrap_or_default()
    }

    pub async fn all_states(&self) -> HashMap<String, ConnectionState> {
        let records = self.records.read().await;
        records.iter().map(|(k, v)| (k.clone(), v.state)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker() -> StateTracker {
        StateTracker::new(Arc::new(TestClock::new()), 256)
    }

    #[tokio::test]
    async fn unknown_instance_defaults_to_disconnected() {
        let tracker = tracker();
        assert_eq!(tracker.get("bot-a").await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn set_records_transition_and_returns_old_state() {
        let tracker = tracker();
        let old = tracker.set("bot-a", ConnectionState::Connecting).await;
        assert_eq!(old, ConnectionState::Disconnected);
        assert_eq!(tracker.get("bot-a").await, ConnectionState::Connecting);

        let transitions = tracker.get_transitions("bot-a").await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, ConnectionState::Disconnected);
        assert_eq!(transitions[0].to, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn same_state_set_is_a_no_op() {
        let tracker = tracker();
        tracker.set("bot-a", ConnectionState::Connecting).await;
        tracker.set("bot-a", ConnectionState::Connecting).await;
        assert_eq!(tracker.get_transitions("bot-a").await.len(), 1);
    }

    #[tokio::test]
    async fn remove_resets_state_but_keeps_transitions() {
        let tracker = tracker();
        tracker.set("bot-a", ConnectionState::Connecting).await;
        tracker.set("bot-a", ConnectionState::Connected).await;
        tracker.remove("bot-a").await;
        assert_eq!(tracker.get("bot-a").await, ConnectionState::Disconnected);
        assert_eq!(tracker.get_transitions("bot-a").await.len(), 2);
    }

    #[tokio::test]
    async fn clear_drops_transitions_too() {
        let tracker = tracker();
        tracker.set("bot-a", ConnectionState::Connecting).await;
        tracker.clear("bot-a").await;
        assert!(tracker.get_transitions("bot-a").await.is_empty());
    }

    #[tokio::test]
    async fn callbacks_fire_outside_the_lock() {
        let tracker = tracker();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        tracker
            .on_change(move |_instance, _old, _new| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tracker.set("bot-a", ConnectionState::Connecting).await;
        tracker.set("bot-a", ConnectionState::Connected).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
