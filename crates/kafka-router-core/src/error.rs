//! Domain error types for the routing and messaging layer.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//! Callback errors and recovered callback panics never become a
//! [`ClientError`]; the consumer engine reports them through logs and metrics.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A producer or consumer group has no broker addresses.
    #[error("'{name}' has no bootstrap brokers")]
    NoBrokers { name: String },

    /// A required string field is empty.
    #[error("'{name}': {field} must not be empty")]
    EmptyField { name: String, field: &'static str },

    /// A consumer group subscribes to no topics.
    #[error("consumer group '{name}' must subscribe to at least one topic")]
    NoTopics { name: String },

    /// Slow-operation threshold of zero would flag every message.
    #[error("consumer group '{name}': slow_threshold_ms must be greater than zero")]
    ZeroSlowThreshold { name: String },

    /// Acknowledgement settings that a conforming Kafka client rejects.
    #[error("producer '{name}': {reason}")]
    InvalidAcks { name: String, reason: String },

    /// The same name is configured twice.
    #[error("duplicate name '{0}' in configuration")]
    DuplicateName(String),
}

/// Errors reported by the underlying broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker could not be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Broker refused the request (e.g. a produce was not acknowledged).
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// No answer within the configured timeout.
    #[error("broker request timed out")]
    Timeout,

    /// The session or producer was closed.
    #[error("session closed")]
    Closed,

    /// Any other client library failure.
    #[error("client error: {0}")]
    Client(String),
}

/// Errors surfaced to callers of producers, consumer groups and backend sets.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Configuration failed validation before any connection was attempted.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A client could not be constructed; no instance exists.
    #[error("failed to construct {component} '{name}': {source}")]
    Construction {
        component: &'static str,
        name: String,
        #[source]
        source: BrokerError,
    },

    /// The broker did not accept a produced message.
    #[error("producer '{producer}' failed to send to '{topic}' (key: {key:?}): {source}")]
    Send {
        producer: String,
        topic: String,
        key: Option<String>,
        #[source]
        source: BrokerError,
    },

    /// Joining or consuming from a group failed.
    #[error("consumer group '{group}' failed to join: {source}")]
    Join {
        group: String,
        #[source]
        source: BrokerError,
    },

    /// Closing a backend failed.
    #[error("failed to close backend '{backend}': {source}")]
    Cleanup {
        backend: String,
        #[source]
        source: BrokerError,
    },

    /// The client has already been shut down.
    #[error("'{name}' is closed")]
    Closed { name: String },
}

/// Result type alias for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Result type alias for broker client operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Error type returned by message callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::EmptyField {
            name: "orders".to_string(),
            field: "group_id",
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("group_id"));
    }

    #[test]
    fn test_send_error_carries_key() {
        let err = ClientError::Send {
            producer: "events".to_string(),
            topic: "order-events".to_string(),
            key: Some("customer-7".to_string()),
            source: BrokerError::Rejected("NOT_ENOUGH_REPLICAS".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("order-events"));
        assert!(msg.contains("customer-7"));
        assert!(msg.contains("NOT_ENOUGH_REPLICAS"));
    }

    #[test]
    fn test_join_error_names_group() {
        use std::error::Error as _;

        let err = ClientError::Join {
            group: "projection".to_string(),
            source: BrokerError::Unavailable("coordinator not available".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("projection"));
        assert!(msg.contains("coordinator not available"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_client_error_from_config() {
        let cfg_err = ConfigError::NoTopics {
            name: "g".to_string(),
        };
        let err: ClientError = cfg_err.into();
        assert!(matches!(err, ClientError::Config(ConfigError::NoTopics { .. })));
    }

    #[test]
    fn test_construction_error_source() {
        use std::error::Error as _;

        let err = ClientError::Construction {
            component: "producer",
            name: "events".to_string(),
            source: BrokerError::Unavailable("127.0.0.1:9092".to_string()),
        };
        let source = err.source().expect("construction error has a source");
        assert!(source.to_string().contains("127.0.0.1:9092"));
    }
}
