//! In-process presence for single-node deployments
//!
//! Same contract as the Redis backend, held in memory. Messages never leave
//! the process, which is exactly right when there is only one process.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::presence::{Listener, ListenerId, Presence, Subscription, ABSENT_PAYLOAD};
use crate::pubsub::{ChannelBroker, Multiplexer};

/// Broker for a single process: there is nothing to open or close
struct InProcessBroker;

#[async_trait]
impl ChannelBroker for InProcessBroker {
    async fn open(&self, _channel: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _channel: &str) -> Result<()> {
        Ok(())
    }
}

/// Scalar value with optional expiry
#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory presence backend
pub struct LocalPresence {
    namespace: Namespace,
    pubsub: Multiplexer<InProcessBroker>,
    values: DashMap<String, StoredValue>,
    sets: DashMap<String, HashSet<String>>,
    hashes: DashMap<String, HashMap<String, String>>,
}

impl LocalPresence {
    /// Create a local presence with no prefix
    #[must_use]
    pub fn new() -> Self {
        Self::with_namespace(Namespace::default())
    }

    #[must_use]
    pub fn with_namespace(namespace: Namespace) -> Self {
        Self {
            namespace,
            pubsub: Multiplexer::new(InProcessBroker),
            values: DashMap::new(),
            sets: DashMap::new(),
            hashes: DashMap::new(),
        }
    }

    /// Value at a scoped key, dropping it if it has expired
    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.values.get(key) {
            Some(stored) if !stored.is_expired(now) => return Some(stored.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove_if(key, |_, stored| stored.is_expired(now));
        }
        None
    }

    fn add_to_counter(&self, key: &str, delta: i64) -> Result<i64> {
        let now = Instant::now();
        let mut stored = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new("0"));
        if stored.is_expired(now) {
            *stored = StoredValue::new("0");
        }

        let current = parse_integer(&stored.value, key)?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::Serialization(format!("increment at '{key}' would overflow")))?;
        stored.value = next.to_string();
        Ok(next)
    }
}

impl Default for LocalPresence {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_integer(raw: &str, key: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| Error::Serialization(format!("value at '{key}' is not an integer")))
}

#[async_trait]
impl Presence for LocalPresence {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn subscribe(&self, topic: &str, listener: Listener) -> Result<Subscription> {
        let channel = self.namespace.scope(topic);
        let id = self.pubsub.subscribe(&channel, listener).await?;
        Ok(Subscription::new(topic, id))
    }

    async fn unsubscribe(&self, topic: &str, listener: Option<ListenerId>) -> Result<()> {
        let channel = self.namespace.scope(topic);
        self.pubsub.unsubscribe(&channel, listener).await
    }

    async fn publish(&self, topic: &str, payload: Option<Value>) -> Result<()> {
        let channel = self.namespace.scope(topic);
        let payload = payload.unwrap_or(ABSENT_PAYLOAD);
        let delivered = self.pubsub.deliver_value(&channel, &payload);
        debug!(channel = %channel, listeners = delivered, "Published locally");
        Ok(())
    }

    async fn exists(&self, topic: &str) -> Result<bool> {
        Ok(self.pubsub.has_listeners(&self.namespace.scope(topic)))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .insert(self.namespace.scope(key), StoredValue::new(value));
        Ok(())
    }

    async fn setex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let key = self.namespace.scope(key);
        if ttl_seconds == 0 {
            self.values.remove(&key);
            return Ok(());
        }
        let stored = StoredValue {
            value: value.to_string(),
            expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
        };
        self.values.insert(key, stored);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_value(&self.namespace.scope(key)))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let key = self.namespace.scope(key);
        self.values.remove(&key);
        self.sets.remove(&key);
        self.hashes.remove(&key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.add_to_counter(&self.namespace.scope(key), 1)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.add_to_counter(&self.namespace.scope(key), -1)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .entry(self.namespace.scope(key))
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let key = self.namespace.scope(key);
        let removed = match self.sets.get_mut(&key) {
            Some(mut members) => members.remove(member),
            None => return Ok(false),
        };
        self.sets.remove_if(&key, |_, members| members.is_empty());
        Ok(removed)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .get(&self.namespace.scope(key))
            .is_some_and(|members| members.contains(member)))
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        Ok(self
            .sets
            .get(&self.namespace.scope(key))
            .map(|members| members.clone())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        Ok(self
            .sets
            .get(&self.namespace.scope(key))
            .map(|members| members.len())
            .unwrap_or(0))
    }

    async fn sinter(&self, keys: &[&str]) -> Result<HashSet<String>> {
        let scoped = self.namespace.scope_all(keys);
        let Some((first, rest)) = scoped.split_first() else {
            return Ok(HashSet::new());
        };

        let mut result = match self.sets.get(first) {
            Some(members) => members.clone(),
            None => return Ok(HashSet::new()),
        };
        for key in rest {
            // One map guard at a time.
            match self.sets.get(key) {
                Some(members) => result.retain(|member| members.contains(member)),
                None => return Ok(HashSet::new()),
            }
            if result.is_empty() {
                break;
            }
        }
        Ok(result)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        Ok(self
            .hashes
            .entry(self.namespace.scope(key))
            .or_default()
            .insert(field.to_string(), value.to_string())
            .is_none())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .hashes
            .get(&self.namespace.scope(key))
            .and_then(|fields| fields.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .hashes
            .get(&self.namespace.scope(key))
            .map(|fields| fields.clone())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let key = self.namespace.scope(key);
        let removed = match self.hashes.get_mut(&key) {
            Some(mut fields) => fields.remove(field).is_some(),
            None => return Ok(false),
        };
        self.hashes.remove_if(&key, |_, fields| fields.is_empty());
        Ok(removed)
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        Ok(self
            .hashes
            .get(&self.namespace.scope(key))
            .map(|fields| fields.len())
            .unwrap_or(0))
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let key = self.namespace.scope(key);
        let mut fields = self.hashes.entry(key.clone()).or_default();
        let current = match fields.get(field) {
            Some(raw) => parse_integer(raw, &key)?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::Serialization(format!("increment at '{key}' would overflow")))?;
        fields.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn shutdown(&self) -> Result<()> {
        info!(prefix = %self.namespace.prefix(), "Shutting down local presence");
        self.pubsub.clear();
        self.values.clear();
        self.sets.clear();
        self.hashes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceExt;
    use std::sync::{Arc, Mutex};

    fn collector() -> (Arc<Mutex<Vec<Value>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Arc::new(move |v: Value| sink.lock().unwrap().push(v)))
    }

    #[tokio::test]
    async fn test_publish_reaches_local_listener() {
        let presence = LocalPresence::with_namespace(Namespace::new("room_"));
        let (seen, listener) = collector();

        presence.subscribe("lobby", listener).await.unwrap();
        presence
            .publish_json("lobby", &serde_json::json!({"type": "join", "id": "r1"}))
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![serde_json::json!({"type": "join", "id": "r1"})]
        );
    }

    #[tokio::test]
    async fn test_publish_without_payload_delivers_sentinel() {
        let presence = LocalPresence::new();
        let (seen, listener) = collector();

        presence.subscribe("t", listener).await.unwrap();
        presence.publish("t", None).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Value::Bool(false)]);
    }

    #[tokio::test]
    async fn test_exists_follows_listeners() {
        let presence = LocalPresence::new();
        assert!(!presence.exists("room1").await.unwrap());

        let sub = presence.subscribe_fn("room1", |_| {}).await.unwrap();
        assert!(presence.exists("room1").await.unwrap());

        presence.cancel(&sub).await.unwrap();
        assert!(!presence.exists("room1").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let presence = LocalPresence::new();
        presence.set("k", "v").await.unwrap();
        assert_eq!(presence.get("k").await.unwrap().as_deref(), Some("v"));

        presence.del("k").await.unwrap();
        assert_eq!(presence.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setex_expires() {
        let presence = LocalPresence::new();
        presence.setex("lock", "owner", 2).await.unwrap();
        assert_eq!(presence.get("lock").await.unwrap().as_deref(), Some("owner"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(presence.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_setex_zero_ttl_removes() {
        let presence = LocalPresence::new();
        presence.set("k", "v").await.unwrap();
        presence.setex("k", "v2", 0).await.unwrap();
        assert_eq!(presence.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_on_expired_key_restarts() {
        let presence = LocalPresence::new();
        presence.setex("n", "10", 1).await.unwrap();
        assert_eq!(presence.incr("n").await.unwrap(), 11);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(presence.incr("n").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_counters() {
        let presence = LocalPresence::new();
        assert_eq!(presence.incr("c").await.unwrap(), 1);
        assert_eq!(presence.incr("c").await.unwrap(), 2);
        assert_eq!(presence.decr("c").await.unwrap(), 1);
        assert_eq!(presence.decr("fresh").await.unwrap(), -1);
        assert_eq!(presence.get("c").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_incr_non_integer_fails() {
        let presence = LocalPresence::new();
        presence.set("c", "abc").await.unwrap();
        let err = presence.incr("c").await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(presence.get("c").await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_set_registry() {
        let presence = LocalPresence::new();
        assert!(presence.sadd("s", "a").await.unwrap());
        assert!(!presence.sadd("s", "a").await.unwrap());
        assert_eq!(presence.scard("s").await.unwrap(), 1);
        assert!(presence.sismember("s", "a").await.unwrap());
        assert!(!presence.sismember("s", "b").await.unwrap());

        assert!(presence.srem("s", "a").await.unwrap());
        assert!(!presence.srem("s", "a").await.unwrap());
        assert_eq!(presence.scard("s").await.unwrap(), 0);
        assert!(presence.smembers("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sinter() {
        let presence = LocalPresence::new();
        presence.sadd("x", "A").await.unwrap();
        presence.sadd("x", "B").await.unwrap();
        presence.sadd("y", "B").await.unwrap();
        presence.sadd("y", "C").await.unwrap();

        let both = presence.sinter(&["x", "y"]).await.unwrap();
        assert_eq!(both, HashSet::from(["B".to_string()]));

        assert!(presence.sinter(&["x", "missing"]).await.unwrap().is_empty());
        assert!(presence.sinter(&[]).await.unwrap().is_empty());
        assert_eq!(presence.sinter(&["x"]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_hash_registry() {
        let presence = LocalPresence::new();
        assert!(presence.hset("room:r1", "clients", "3").await.unwrap());
        assert!(!presence.hset("room:r1", "clients", "4").await.unwrap());
        presence.hset("room:r1", "locked", "false").await.unwrap();

        assert_eq!(
            presence.hget("room:r1", "clients").await.unwrap().as_deref(),
            Some("4")
        );
        assert_eq!(presence.hlen("room:r1").await.unwrap(), 2);
        assert_eq!(presence.hincrby("room:r1", "clients", -2).await.unwrap(), 2);
        assert_eq!(presence.hincrby("room:r1", "spectators", 5).await.unwrap(), 5);

        let all = presence.hgetall("room:r1").await.unwrap();
        assert_eq!(all.get("clients").map(String::as_str), Some("2"));
        assert_eq!(all.len(), 3);

        assert!(presence.hdel("room:r1", "locked").await.unwrap());
        assert!(!presence.hdel("room:r1", "locked").await.unwrap());
        assert_eq!(presence.hget("room:r1", "locked").await.unwrap(), None);
        assert_eq!(presence.hlen("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drops_state() {
        let presence = LocalPresence::new();
        presence.subscribe_fn("t", |_| {}).await.unwrap();
        presence.set("k", "v").await.unwrap();

        presence.shutdown().await.unwrap();
        assert!(!presence.exists("t").await.unwrap());
        assert_eq!(presence.get("k").await.unwrap(), None);
    }
}
