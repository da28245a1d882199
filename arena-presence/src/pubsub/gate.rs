//! Per-channel subscription state, serialized per channel
//!
//! Every subscribe/unsubscribe on a channel holds that channel's gate for the
//! whole transition, broker round trip included. Two first-subscribes for the
//! same new channel therefore issue one broker `SUBSCRIBE`, and an unsubscribe
//! racing a subscribe never leaves an open subscription with no listeners.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Broker subscription state of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopicState {
    #[default]
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// Exclusive hold on a channel's state
pub type TopicGuard = OwnedMutexGuard<TopicState>;

/// Gates for channels that are subscribed or have a transition in flight
#[derive(Default)]
pub struct TopicGates {
    gates: DashMap<String, Arc<Mutex<TopicState>>>,
}

impl TopicGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a channel, creating its gate if needed
    pub async fn lock(&self, channel: &str) -> TopicGuard {
        let gate = self
            .gates
            .entry(channel.to_string())
            .or_default()
            .clone();
        gate.lock_owned().await
    }

    /// Wait for exclusive access to a channel that already has a gate
    pub async fn lock_existing(&self, channel: &str) -> Option<TopicGuard> {
        let gate = self.gates.get(channel).map(|gate| gate.clone())?;
        Some(gate.lock_owned().await)
    }

    /// Give a channel back, dropping its gate once it is idle
    ///
    /// The gate is only removed while nobody else holds or waits on it, so a
    /// waiter never ends up on a gate that a newcomer can no longer see.
    pub fn release(&self, channel: &str, guard: TopicGuard) {
        drop(guard);
        self.gates.remove_if(channel, |_, gate| {
            Arc::strong_count(gate) == 1
                && gate
                    .try_lock()
                    .map(|state| *state == TopicState::Unsubscribed)
                    .unwrap_or(false)
        });
    }

    /// Current state without waiting. `None` if the channel has no gate or is
    /// held by a transition right now.
    pub fn state(&self, channel: &str) -> Option<TopicState> {
        let gate = self.gates.get(channel)?;
        gate.try_lock().ok().map(|state| *state)
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    pub fn clear(&self) {
        self.gates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_new_gate_starts_unsubscribed() {
        let gates = TopicGates::new();
        let guard = gates.lock("t").await;
        assert_eq!(*guard, TopicState::Unsubscribed);
        gates.release("t", guard);
        assert!(gates.is_empty());
    }

    #[tokio::test]
    async fn test_subscribed_gate_is_kept() {
        let gates = TopicGates::new();
        let mut guard = gates.lock("t").await;
        *guard = TopicState::Subscribed;
        gates.release("t", guard);

        assert_eq!(gates.len(), 1);
        assert_eq!(gates.state("t"), Some(TopicState::Subscribed));
    }

    #[tokio::test]
    async fn test_lock_existing_on_unknown_channel() {
        let gates = TopicGates::new();
        assert!(gates.lock_existing("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_waiter_keeps_gate_alive() {
        let gates = Arc::new(TopicGates::new());
        let mut guard = gates.lock("t").await;
        *guard = TopicState::Subscribing;

        let waiter_gates = gates.clone();
        let waiter = tokio::spawn(async move {
            let guard = waiter_gates.lock("t").await;
            let seen = *guard;
            waiter_gates.release("t", guard);
            seen
        });

        // Let the waiter clone the gate and park on it.
        tokio::time::sleep(Duration::from_millis(20)).await;

        *guard = TopicState::Subscribed;
        gates.release("t", guard);

        assert_eq!(waiter.await.unwrap(), TopicState::Subscribed);
        assert_eq!(gates.state("t"), Some(TopicState::Subscribed));
    }
}
