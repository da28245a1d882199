use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::namespace::Namespace;

/// Presence configuration
///
/// With `redis` unset the process runs the in-memory backend, which is only
/// correct for single-process deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub redis: Option<RedisConfig>,
    /// Prepended to every key and topic
    pub prefix: String,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub command_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            command_timeout_seconds: 5,
        }
    }
}

impl RedisConfig {
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl PresenceConfig {
    /// Load configuration with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // PRESENCE_PREFIX, PRESENCE_REDIS__URL, PRESENCE_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("PRESENCE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Configuration for one tenant of a shared Redis
    #[must_use]
    pub fn for_tenant(api_key: &str, redis: Option<RedisConfig>) -> Self {
        Self {
            redis,
            prefix: Namespace::for_tenant(api_key).prefix().to_string(),
            logging: LoggingConfig::default(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.prefix.clone())
    }

    /// Whether this configuration selects the Redis backend
    #[must_use]
    pub const fn is_networked(&self) -> bool {
        self.redis.is_some()
    }
}
