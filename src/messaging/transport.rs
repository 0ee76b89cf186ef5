//! Broker transport abstraction.
//!
//! The connection manager only talks to the broker through these traits.
//! [`amqp`](super::amqp) implements them on top of `lapin`;
//! [`memory`](super::memory) implements them in-process for tests.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::types::{BrokerError, Result};

/// Exchange types understood by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// Options for declaring a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    /// Declare with `x-queue-mode = lazy`
    pub lazy: bool,
}

/// A declared queue as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    pub exchange: String,
    pub durable: bool,
    pub messages: u32,
    pub consumers: u32,
}

/// Consumer registration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// A mandatory, non-immediate `text/plain` message.
    pub fn mandatory(exchange: &str, routing_key: &str, body: &[u8]) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: true,
            immediate: false,
            content_type: "text/plain".to_string(),
            body: body.to_vec(),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }
}

/// Outcome of a publisher confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker accepted the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// The broker could not route a mandatory message.
    Returned,
}

/// A publisher confirmation that has not resolved yet.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation>>;

/// Stream of inbound deliveries for one consumer.
pub type DeliveryStream<D> = BoxStream<'static, D>;

/// Dials broker connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn dial(&self, uri: &str) -> Result<Self::Connection>;
}

/// A live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel>;

    /// Resolves once the connection closes: `Some` carries the cause of an
    /// unexpected loss, `None` means the connection was closed gracefully.
    async fn closed(&self) -> Option<BrokerError>;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// A multiplexed session over one connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    type Delivery: Delivery;

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<QueueDescriptor>;

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    async fn qos(&self, prefetch: u16) -> Result<()>;

    /// Put the channel into publisher-confirmation mode.
    async fn confirm_select(&self) -> Result<()>;

    /// Send a message. The returned future resolves with the broker's
    /// confirmation once the channel is in confirmation mode.
    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        lazy: bool,
    ) -> Result<DeliveryStream<Self::Delivery>>;

    async fn cancel(&self, consumer_tag: &str, no_wait: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One inbound message and its acknowledgment capability.
#[async_trait]
pub trait Delivery: Debug + Send + Sync + 'static {
    fn body(&self) -> &[u8];

    async fn ack(&self, multiple: bool) -> Result<()>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}
