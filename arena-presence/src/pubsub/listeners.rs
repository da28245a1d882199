use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::presence::{Listener, ListenerId};

/// Listener registered on a channel
#[derive(Clone)]
struct Registered {
    id: ListenerId,
    listener: Listener,
}

/// In-memory table routing messages to the listeners of each channel
///
/// Owned by one presence instance. Channels are already namespaced; listeners
/// of a channel are kept in registration order and invoked in that order.
#[derive(Clone, Default)]
pub struct ListenerTable {
    /// Map of channel -> listeners in insertion order
    channels: Arc<DashMap<String, Vec<Registered>>>,

    next_id: Arc<AtomicU64>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener to a channel and return its identity
    pub fn insert(&self, channel: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(Registered { id, listener });

        debug!(channel = %channel, listener_id = %id, "Listener registered");
        id
    }

    /// Remove one listener, or all of them when `id` is `None`
    ///
    /// Returns how many listeners remain on the channel. The channel entry is
    /// dropped once it is empty.
    pub fn remove(&self, channel: &str, id: Option<ListenerId>) -> usize {
        let remaining = match self.channels.get_mut(channel) {
            Some(mut listeners) => {
                match id {
                    Some(id) => listeners.retain(|registered| registered.id != id),
                    None => listeners.clear(),
                }
                listeners.len()
            }
            None => return 0,
        };

        if remaining == 0 {
            self.channels.remove_if(channel, |_, listeners| listeners.is_empty());
            debug!(channel = %channel, "Channel has no more listeners, removed");
        }

        remaining
    }

    /// Invoke every listener of the channel with the payload, in registration order
    ///
    /// Listeners are snapshotted first, so a listener may subscribe or
    /// unsubscribe while being called.
    pub fn dispatch(&self, channel: &str, payload: &Value) -> usize {
        let listeners: Vec<Listener> = match self.channels.get(channel) {
            Some(registered) => registered.iter().map(|r| r.listener.clone()).collect(),
            None => return 0,
        };

        for listener in &listeners {
            listener(payload.clone());
        }

        listeners.len()
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    pub fn has_listeners(&self, channel: &str) -> bool {
        self.listener_count(channel) > 0
    }

    /// Number of channels with at least one listener
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn clear(&self) {
        self.channels.clear();
    }
}
