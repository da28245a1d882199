//! Many logical listeners multiplexed onto one broker subscription per channel
//!
//! The [`Multiplexer`] owns the listener table and the per-channel gates. A
//! backend plugs in its transport through [`ChannelBroker`] and feeds inbound
//! messages to [`Multiplexer::deliver`].

pub mod gate;
pub mod listeners;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::presence::{Listener, ListenerId, ABSENT_PAYLOAD};

pub use gate::{TopicGates, TopicState};
pub use listeners::ListenerTable;

/// Transport side of a subscription: open or close one broker channel
#[async_trait]
pub trait ChannelBroker: Send + Sync {
    async fn open(&self, channel: &str) -> Result<()>;

    async fn close(&self, channel: &str) -> Result<()>;

    /// False once the broker can no longer deliver messages
    fn is_connected(&self) -> bool {
        true
    }
}

/// Encode a payload for the wire
pub fn encode_payload(payload: Option<Value>) -> Result<String> {
    let payload = payload.unwrap_or(ABSENT_PAYLOAD);
    Ok(serde_json::to_string(&payload)?)
}

/// Decode a payload received from the wire
pub fn decode_payload(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

/// Reference-counted channel subscriptions over a [`ChannelBroker`]
pub struct Multiplexer<B> {
    broker: B,
    listeners: ListenerTable,
    gates: TopicGates,
}

impl<B: ChannelBroker> Multiplexer<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            listeners: ListenerTable::new(),
            gates: TopicGates::new(),
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Register a listener, opening the broker channel for the first one
    ///
    /// The listener is only registered once the broker has confirmed, so a
    /// refused open or a caller that gives up mid-open leaves nothing behind.
    pub async fn subscribe(&self, channel: &str, listener: Listener) -> Result<ListenerId> {
        let mut state = self.gates.lock(channel).await;

        if !self.broker.is_connected() {
            self.gates.release(channel, state);
            return Err(Error::Connection(format!(
                "broker connection lost, cannot subscribe to '{channel}'"
            )));
        }

        // Anything but Subscribed here is either a fresh channel or a transition
        // that was dropped mid-flight; SUBSCRIBE is idempotent so reissue it.
        if *state != TopicState::Subscribed {
            *state = TopicState::Subscribing;
            if let Err(e) = self.broker.open(channel).await {
                if e.is_timeout() {
                    // The broker may still complete the open after we gave up.
                    if let Err(close_err) = self.broker.close(channel).await {
                        warn!(channel = %channel, error = %close_err, "Failed to undo timed out subscription");
                    }
                }
                *state = TopicState::Unsubscribed;
                self.gates.release(channel, state);
                return Err(e);
            }
            *state = TopicState::Subscribed;
            debug!(channel = %channel, "Broker subscription opened");
        }

        let id = self.listeners.insert(channel, listener);
        self.gates.release(channel, state);
        Ok(id)
    }

    /// Remove one or all listeners, closing the broker channel after the last
    pub async fn unsubscribe(&self, channel: &str, id: Option<ListenerId>) -> Result<()> {
        let Some(mut state) = self.gates.lock_existing(channel).await else {
            return Ok(());
        };

        let remaining = self.listeners.remove(channel, id);
        let result = if remaining == 0 && *state != TopicState::Unsubscribed {
            *state = TopicState::Unsubscribing;
            let closed = self.broker.close(channel).await;
            // Listeners are gone either way; a failed close leaves nothing to deliver to.
            *state = TopicState::Unsubscribed;
            match &closed {
                Ok(()) => debug!(channel = %channel, "Broker subscription closed"),
                Err(e) => warn!(channel = %channel, error = %e, "Failed to close broker subscription"),
            }
            closed
        } else {
            Ok(())
        };

        self.gates.release(channel, state);
        result
    }

    /// Deliver a raw wire message to the channel's listeners
    ///
    /// A payload that does not decode is logged and dropped; it never affects
    /// other messages.
    pub fn deliver(&self, channel: &str, raw: &str) -> usize {
        match decode_payload(raw) {
            Ok(payload) => self.listeners.dispatch(channel, &payload),
            Err(e) => {
                warn!(
                    channel = %channel,
                    error = %e,
                    payload = %raw,
                    "Failed to decode message payload"
                );
                0
            }
        }
    }

    /// Deliver an already decoded payload to the channel's listeners
    pub fn deliver_value(&self, channel: &str, payload: &Value) -> usize {
        self.listeners.dispatch(channel, payload)
    }

    pub fn has_listeners(&self, channel: &str) -> bool {
        self.listeners.has_listeners(channel)
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.listeners.listener_count(channel)
    }

    pub fn state(&self, channel: &str) -> TopicState {
        self.gates.state(channel).unwrap_or_default()
    }

    /// Forget every listener and channel state
    pub fn clear(&self) {
        self.listeners.clear();
        self.gates.clear();
    }
}
