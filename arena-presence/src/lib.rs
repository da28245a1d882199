pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod namespace;
pub mod presence;
pub mod pubsub;

pub use crate::backend::{connect, LocalPresence, RedisPresence};
pub use crate::config::{LoggingConfig, PresenceConfig, RedisConfig};
pub use crate::error::{Error, Result};
pub use crate::logging::init_logging;
pub use crate::namespace::Namespace;
pub use crate::presence::{Listener, ListenerId, Presence, PresenceExt, Subscription, ABSENT_PAYLOAD};
