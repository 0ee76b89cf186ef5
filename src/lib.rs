//! Broker Kit Library
//!
//! An auto-reconnecting AMQP client: one managed connection, name-tracked
//! channels, confirmed publishing and consumers with explicit acknowledgment
//! policies.

pub mod api;
pub mod messaging;
pub mod telemetry;
pub mod types;

pub use messaging::{AmqpManager, BrokerConnectionManager, ConnectionState, Nack};
pub use types::{AckMode, BrokerConfig, BrokerError, ConfirmTimeoutPolicy, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::messaging::*;
    pub use crate::types::*;
}

/// Default publisher confirmation timeout (5 seconds)
pub const DEFAULT_NOTIFY_TIMEOUT_MS: u64 = 5_000;

/// Default seed of the reconnect backoff sequence
pub const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 1_000;

/// Default ceiling for a single reconnect delay (1 minute)
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 60_000;
