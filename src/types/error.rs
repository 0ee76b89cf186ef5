//! Error types for broker operations.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by the connection manager and its transports.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The initial dial of the broker failed.
    #[error("failed to connect to broker: {0}")]
    Dial(String),

    /// No connection is available and none could be established.
    #[error("connection is not open")]
    NotConnected,

    /// The connection was lost and is being re-established.
    #[error("connection lost, reconnect in progress")]
    Reconnecting,

    /// The manager was shut down.
    #[error("connection manager is shut down")]
    Closed,

    #[error("failed to open channel: {0}")]
    ChannelOpen(String),

    #[error("failed to declare {kind} `{name}`: {reason}")]
    Declare {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("failed to bind queue `{queue}` with key `{routing_key}`: {reason}")]
    Bind {
        queue: String,
        routing_key: String,
        reason: String,
    },

    #[error("failed to put channel in confirmation mode: {0}")]
    ConfirmMode(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    /// The broker returned a mandatory message because no queue was bound.
    #[error("failed to deliver message to exchange/queue: unroutable key `{routing_key}`")]
    Unroutable { routing_key: String },

    /// The broker negatively confirmed a published message.
    #[error("failed to deliver message to exchange/queue: broker nacked `{routing_key}`")]
    Nacked { routing_key: String },

    #[error("message delivery confirmation timed out after {0:?}")]
    ConfirmTimeout(Duration),

    #[error("failed to register consumer on `{queue}`: {reason}")]
    Consume { queue: String, reason: String },

    /// No tracked channel exists for the topic.
    #[error("no channel tracked for topic `{0}`")]
    UnknownTopic(String),

    #[error("failed to cancel consumer `{consumer}`: {reason}")]
    Cancel { consumer: String, reason: String },

    #[error("failed to acknowledge delivery: {0}")]
    Acknowledge(String),

    #[error("invalid worker count: {0}")]
    InvalidWorkers(usize),

    /// Generic transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to serialize message body: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

impl BrokerError {
    /// Whether the error came from the broker refusing to route or accept a message.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, Self::Unroutable { .. } | Self::Nacked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_failure_classification() {
        let unroutable = BrokerError::Unroutable {
            routing_key: "missing".to_string(),
        };
        assert!(unroutable.is_delivery_failure());
        assert!(!BrokerError::ConfirmTimeout(Duration::from_secs(1)).is_delivery_failure());
    }

    #[test]
    fn test_messages_name_the_resource() {
        let err = BrokerError::UnknownTopic("orders".to_string());
        assert_eq!(err.to_string(), "no channel tracked for topic `orders`");
    }
}
