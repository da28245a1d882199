//! Presence backends and backend selection

pub mod local;
pub mod redis;

pub use self::local::LocalPresence;
pub use self::redis::RedisPresence;

use std::sync::Arc;

use tracing::info;

use crate::config::PresenceConfig;
use crate::error::Result;
use crate::presence::Presence;

/// Build the presence backend a configuration asks for
///
/// Redis when `redis` is configured, in-memory otherwise.
pub async fn connect(config: &PresenceConfig) -> Result<Arc<dyn Presence>> {
    let namespace = config.namespace();
    match &config.redis {
        Some(redis) => {
            let presence = RedisPresence::connect(redis, namespace).await?;
            Ok(Arc::new(presence))
        }
        None => {
            info!(
                prefix = %namespace.prefix(),
                "Redis not configured, presence is local-only"
            );
            Ok(Arc::new(LocalPresence::with_namespace(namespace)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_redis_is_local() {
        let config = PresenceConfig {
            prefix: "room_".to_string(),
            ..PresenceConfig::default()
        };
        let presence = connect(&config).await.unwrap();
        assert_eq!(presence.namespace().prefix(), "room_");

        presence.sadd("active", "r1").await.unwrap();
        assert!(presence.sismember("active", "r1").await.unwrap());
    }
}
