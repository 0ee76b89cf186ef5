//! Core types for the broker kit.

mod config;
mod error;

pub use self::config::{
    AckMode, AckPolicy, AmqpEndpoint, BrokerConfig, ConfirmTimeoutPolicy, ReconnectConfig,
};
pub use self::error::{BrokerError, Result};
