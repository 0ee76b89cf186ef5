//! # Broker Messaging Module
//!
//! Auto-reconnecting AMQP connection management.
//!
//! ## Features
//! - Connection manager with Fibonacci reconnect backoff
//! - Name-tracked channels cleared on every connection swap
//! - Publisher confirms with mandatory routing
//! - Single-worker and parallel consumers with ack/nack discipline
//! - `lapin` transport plus an in-process transport for tests

pub mod amqp;
pub mod backoff;
pub mod consumer;
pub mod manager;
pub mod memory;
pub mod publisher;
pub mod registry;
pub mod transport;

pub use amqp::AmqpTransport;
pub use backoff::RetryState;
pub use consumer::{handle_messages, Nack};
pub use manager::{AmqpManager, BrokerConnectionManager, ChannelOf, ConnectionState, DeliveryOf};
pub use memory::MemoryTransport;
pub use registry::ChannelRegistry;
pub use transport::{
    BrokerChannel, BrokerConnection, Confirmation, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, OutboundMessage, QueueDescriptor, QueueOptions, Transport,
};
