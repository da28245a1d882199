//! Redis-backed presence for multi-process clusters
//!
//! Each instance owns two connections:
//! 1. A `ConnectionManager` for commands and `PUBLISH`
//! 2. One pub/sub connection, split into a sink for `SUBSCRIBE`/`UNSUBSCRIBE`
//!    and a stream drained by a single dispatcher task
//!
//! The dispatcher demultiplexes every inbound message by its exact channel
//! name and hands it to the listeners registered for that channel.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{Client as RedisClient, FromRedisValue};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RedisConfig;
use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::presence::{Listener, ListenerId, Presence, Subscription};
use crate::pubsub::{encode_payload, ChannelBroker, Multiplexer};

/// Bound a Redis round trip by the configured timeout
async fn bounded<T, F>(limit: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(format!("Redis {op} timed out")))?
        .map_err(Error::from)
}

/// Subscription side of the pub/sub connection
struct RedisChannelBroker {
    sink: Mutex<Option<PubSubSink>>,
    command_timeout: Duration,
    /// Cancelled by the dispatcher when the pub/sub stream ends
    lost: CancellationToken,
}

impl RedisChannelBroker {
    async fn sink(&self) -> Result<PubSubSink> {
        self.sink
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Connection("presence has been shut down".to_string()))
    }

    async fn close_sink(&self) {
        self.sink.lock().await.take();
    }
}

#[async_trait]
impl ChannelBroker for RedisChannelBroker {
    async fn open(&self, channel: &str) -> Result<()> {
        let mut sink = self.sink().await?;
        bounded(self.command_timeout, "SUBSCRIBE", sink.subscribe(channel)).await
    }

    async fn close(&self, channel: &str) -> Result<()> {
        let mut sink = self.sink().await?;
        bounded(self.command_timeout, "UNSUBSCRIBE", sink.unsubscribe(channel)).await
    }

    fn is_connected(&self) -> bool {
        !self.lost.is_cancelled()
    }
}

/// Redis presence backend
pub struct RedisPresence {
    namespace: Namespace,
    commands: RwLock<Option<ConnectionManager>>,
    pubsub: Arc<Multiplexer<RedisChannelBroker>>,
    command_timeout: Duration,
    cancel_token: CancellationToken,
}

impl RedisPresence {
    /// Connect both Redis connections and start the dispatcher
    pub async fn connect(config: &RedisConfig, namespace: Namespace) -> Result<Self> {
        let command_timeout = config.command_timeout();
        let client = RedisClient::open(config.url.as_str())
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let commands = bounded(
            command_timeout,
            "connect",
            ConnectionManager::new(client.clone()),
        )
        .await?;

        let (sink, stream) = bounded(command_timeout, "pub/sub connect", client.get_async_pubsub())
            .await?
            .split();

        let pubsub = Arc::new(Multiplexer::new(RedisChannelBroker {
            sink: Mutex::new(Some(sink)),
            command_timeout,
            lost: CancellationToken::new(),
        }));

        let cancel_token = CancellationToken::new();
        tokio::spawn(run_dispatcher(
            pubsub.clone(),
            stream,
            cancel_token.clone(),
        ));

        info!(
            prefix = %namespace.prefix(),
            "Redis presence connected"
        );

        Ok(Self {
            namespace,
            commands: RwLock::new(Some(commands)),
            pubsub,
            command_timeout,
            cancel_token,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.commands
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Connection("presence has been shut down".to_string()))
    }

    /// Run one command on the command connection
    async fn query<T>(&self, op: &str, cmd: &redis::Cmd) -> Result<T>
    where
        T: FromRedisValue + Send,
    {
        let mut conn = self.connection().await?;
        bounded(self.command_timeout, op, cmd.query_async::<T>(&mut conn)).await
    }
}

/// Drain the pub/sub stream until shutdown or connection loss
///
/// Reconnecting is left to the caller: after a loss, every subscribe fails
/// with a connection error instead of silently never delivering.
async fn run_dispatcher(
    pubsub: Arc<Multiplexer<RedisChannelBroker>>,
    mut stream: PubSubStream,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Redis presence dispatcher cancelled");
                return;
            }
            msg = stream.next() => msg,
        };

        let Some(msg) = msg else {
            error!("Redis pub/sub stream ended (connection lost), dispatcher stopping");
            pubsub.broker().lost.cancel();
            return;
        };

        let channel = msg.get_channel_name();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Invalid payload");
                continue;
            }
        };

        let delivered = pubsub.deliver(channel, &payload);
        debug!(
            channel = %channel,
            listeners = delivered,
            "Dispatched message from Redis"
        );
    }
}

#[async_trait]
impl Presence for RedisPresence {
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
        let payload = encode_payload(payload)?;

        let receivers: usize = self
            .query(
                "PUBLISH",
                redis::cmd("PUBLISH").arg(&channel).arg(&payload),
            )
            .await?;

        debug!(channel = %channel, receivers = receivers, "Message published to Redis");
        Ok(())
    }

    async fn exists(&self, topic: &str) -> Result<bool> {
        // NUMSUB takes channel names, not glob patterns like CHANNELS does.
        let channel = self.namespace.scope(topic);
        let counts: Vec<(String, usize)> = self
            .query(
                "PUBSUB NUMSUB",
                redis::cmd("PUBSUB").arg("NUMSUB").arg(&channel),
            )
            .await?;
        Ok(counts.iter().any(|(_, subscribers)| *subscribers > 0))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.query(
            "SET",
            redis::cmd("SET").arg(self.namespace.scope(key)).arg(value),
        )
        .await
    }

    async fn setex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        // SETEX rejects a zero TTL; an already-expired value is just a deleted one.
        if ttl_seconds == 0 {
            return self.del(key).await;
        }
        self.query(
            "SETEX",
            redis::cmd("SETEX")
                .arg(self.namespace.scope(key))
                .arg(ttl_seconds)
                .arg(value),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query("GET", redis::cmd("GET").arg(self.namespace.scope(key)))
            .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.query("DEL", redis::cmd("DEL").arg(self.namespace.scope(key)))
            .await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.query("INCR", redis::cmd("INCR").arg(self.namespace.scope(key)))
            .await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.query("DECR", redis::cmd("DECR").arg(self.namespace.scope(key)))
            .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let added: usize = self
            .query(
                "SADD",
                redis::cmd("SADD").arg(self.namespace.scope(key)).arg(member),
            )
            .await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: usize = self
            .query(
                "SREM",
                redis::cmd("SREM").arg(self.namespace.scope(key)).arg(member),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.query(
            "SISMEMBER",
            redis::cmd("SISMEMBER")
                .arg(self.namespace.scope(key))
                .arg(member),
        )
        .await
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        self.query(
            "SMEMBERS",
            redis::cmd("SMEMBERS").arg(self.namespace.scope(key)),
        )
        .await
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        self.query("SCARD", redis::cmd("SCARD").arg(self.namespace.scope(key)))
            .await
    }

    async fn sinter(&self, keys: &[&str]) -> Result<HashSet<String>> {
        // SINTER with no keys is a protocol error; the answer is known anyway.
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        self.query(
            "SINTER",
            redis::cmd("SINTER").arg(self.namespace.scope_all(keys)),
        )
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let added: usize = self
            .query(
                "HSET",
                redis::cmd("HSET")
                    .arg(self.namespace.scope(key))
                    .arg(field)
                    .arg(value),
            )
            .await?;
        Ok(added > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(
            "HGET",
            redis::cmd("HGET").arg(self.namespace.scope(key)).arg(field),
        )
        .await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.query(
            "HGETALL",
            redis::cmd("HGETALL").arg(self.namespace.scope(key)),
        )
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: usize = self
            .query(
                "HDEL",
                redis::cmd("HDEL").arg(self.namespace.scope(key)).arg(field),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        self.query("HLEN", redis::cmd("HLEN").arg(self.namespace.scope(key)))
            .await
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.query(
            "HINCRBY",
            redis::cmd("HINCRBY")
                .arg(self.namespace.scope(key))
                .arg(field)
                .arg(delta),
        )
        .await
    }

    async fn shutdown(&self) -> Result<()> {
        info!(prefix = %self.namespace.prefix(), "Shutting down Redis presence");
        self.cancel_token.cancel();
        self.pubsub.broker().close_sink().await;
        self.pubsub.clear();
        self.commands.write().await.take();
        Ok(())
    }
}
