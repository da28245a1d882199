//! Error types for the presence layer

use thiserror::Error;

/// Presence error types
///
/// Nothing here is retried internally; the caller decides whether a failure
/// is fatal or worth retrying.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend unreachable, refused, or dropped mid-operation
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected backend response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A value could not be encoded, or a stored value could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether the failure came from the transport rather than the data
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Whether the backend never answered, so the outcome is unknown
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::Connection(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type for presence operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!err.is_connection());
    }

    #[test]
    fn test_redis_io_error_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: Error = redis::RedisError::from(io).into();
        assert!(matches!(err, Error::Connection(_)));
        assert!(err.is_connection());
    }

    #[test]
    fn test_timeout_counts_as_connection_failure() {
        assert!(Error::Timeout("PUBLISH".to_string()).is_connection());
        assert!(!Error::Protocol("WRONGTYPE".to_string()).is_connection());
    }
}
