//! The presence contract shared by every backend
//!
//! Room and matchmaking code talks only to [`Presence`]. Whether the state
//! lives in this process ([`LocalPresence`](crate::LocalPresence)) or in a
//! Redis shared by the whole cluster ([`RedisPresence`](crate::RedisPresence))
//! is decided once at startup.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::namespace::Namespace;

/// Callback invoked with the decoded payload of every message on a topic
pub type Listener = Arc<dyn Fn(Value) + Send + Sync>;

/// Identity of one registered listener, unique within a presence instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Handle returned by [`Presence::subscribe`]
///
/// Pass `Some(handle.id())` to [`Presence::unsubscribe`] to remove exactly this
/// listener and leave the others on the topic in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic: String,
    id: ListenerId,
}

impl Subscription {
    pub(crate) fn new(topic: impl Into<String>, id: ListenerId) -> Self {
        Self {
            topic: topic.into(),
            id,
        }
    }

    /// Unscoped topic, as the caller passed it to `subscribe`
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }
}

/// Distributed presence: pub/sub plus shared key/value, counter, set and hash
/// registries.
///
/// Every key and topic is scoped by the instance's [`Namespace`] before it
/// reaches the backend. Keys of different kinds (value, set, hash) live in one
/// key space on Redis, so callers keep their names disjoint.
#[async_trait]
pub trait Presence: Send + Sync {
    /// Namespace applied to every key and topic
    fn namespace(&self) -> &Namespace;

    // ==================== Pub/Sub ====================

    /// Register a listener on a topic
    ///
    /// The first listener on a topic opens the broker subscription and waits for
    /// the broker to acknowledge it. Later listeners share that subscription.
    async fn subscribe(&self, topic: &str, listener: Listener) -> Result<Subscription>;

    /// Remove one listener, or every listener when `listener` is `None`
    ///
    /// Removing the last listener closes the broker subscription. Unknown
    /// topics and unknown listeners are a no-op.
    async fn unsubscribe(&self, topic: &str, listener: Option<ListenerId>) -> Result<()>;

    /// Broadcast a payload to every process subscribed to the topic,
    /// this one included
    ///
    /// `None` is sent as [`ABSENT_PAYLOAD`]. Completion means the broker
    /// accepted the message, not that anyone received it.
    async fn publish(&self, topic: &str, payload: Option<Value>) -> Result<()>;

    /// Whether any subscriber anywhere currently holds this exact topic
    async fn exists(&self, topic: &str) -> Result<bool>;

    // ==================== Key/Value ====================

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Store a value that expires after `ttl_seconds`; zero expires it at once
    async fn setex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    // ==================== Counters ====================

    /// Atomically increment, starting from zero when the key is absent
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Atomically decrement, starting from zero when the key is absent
    async fn decr(&self, key: &str) -> Result<i64>;

    // ==================== Sets ====================

    /// Returns `true` if the member was not already present
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns `true` if the member was present
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<HashSet<String>>;

    async fn scard(&self, key: &str) -> Result<usize>;

    /// Members present in every listed set; no keys yields an empty set
    async fn sinter(&self, keys: &[&str]) -> Result<HashSet<String>>;

    // ==================== Hashes ====================

    /// Returns `true` if the field is new
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Returns `true` if the field existed
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn hlen(&self, key: &str) -> Result<usize>;

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    // ==================== Lifecycle ====================

    /// Release backend connections. Call once, at teardown.
    async fn shutdown(&self) -> Result<()>;
}

/// Payload delivered when a message is published without one
pub const ABSENT_PAYLOAD: Value = Value::Bool(false);

/// Typed helpers layered over [`Presence`]
#[async_trait]
pub trait PresenceExt: Presence {
    /// Encode any serializable value and publish it
    async fn publish_json<T>(&self, topic: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_value(value)?;
        self.publish(topic, Some(payload)).await
    }

    /// Subscribe with a plain closure
    async fn subscribe_fn<F>(&self, topic: &str, listener: F) -> Result<Subscription>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(listener)).await
    }

    /// Subscribe with a closure taking a typed message
    ///
    /// Payloads that do not decode into `T` are logged and skipped.
    async fn subscribe_json<T, F>(&self, topic: &str, listener: F) -> Result<Subscription>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let topic_name = topic.to_string();
        let typed: Listener = Arc::new(move |payload: Value| {
            match serde_json::from_value::<T>(payload) {
                Ok(message) => listener(message),
                Err(e) => {
                    warn!(topic = %topic_name, error = %e, "Dropping message that does not match listener type");
                }
            }
        });
        self.subscribe(topic, typed).await
    }

    /// Remove the listener behind a handle
    async fn cancel(&self, subscription: &Subscription) -> Result<()> {
        self.unsubscribe(subscription.topic(), Some(subscription.id()))
            .await
    }
}

impl<P: Presence + ?Sized> PresenceExt for P {}
