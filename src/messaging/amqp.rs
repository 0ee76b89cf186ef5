//! AMQP 0-9-1 transport backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::*,
    publisher_confirm,
    types::{AMQPValue, FieldTable},
    BasicProperties, Connection, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{error, warn};

use super::transport::{
    BrokerChannel, BrokerConnection, Confirmation, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, OutboundMessage, PendingConfirm, QueueDescriptor, QueueOptions, Transport,
};
use crate::types::{BrokerError, Result};

/// Dials real brokers with `lapin`.
#[derive(Clone, Default)]
pub struct AmqpTransport {
    properties: ConnectionProperties,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom connection properties (client name, executor, reactor).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Open,
    Lost(String),
    Closed,
}

/// A `lapin` connection plus its close signal.
pub struct AmqpConnection {
    inner: Connection,
    link: Arc<watch::Sender<LinkState>>,
}

#[async_trait]
impl Transport for AmqpTransport {
    type Connection = AmqpConnection;

    async fn dial(&self, uri: &str) -> Result<Self::Connection> {
        let inner = Connection::connect(uri, self.properties.clone())
            .await
            .map_err(|e| BrokerError::Dial(e.to_string()))?;

        let (link, _) = watch::channel(LinkState::Open);
        let link = Arc::new(link);

        let on_error = Arc::clone(&link);
        inner.on_error(move |err| {
            error!(error = %err, "AMQP connection error");
            on_error.send_replace(LinkState::Lost(err.to_string()));
        });

        Ok(AmqpConnection { inner, link })
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<Self::Channel> {
        let inner = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelOpen(e.to_string()))?;
        Ok(AmqpChannel { inner })
    }

    async fn closed(&self) -> Option<BrokerError> {
        let mut rx = self.link.subscribe();
        let state = match rx.wait_for(|state| *state != LinkState::Open).await {
            Ok(state) => state.clone(),
            Err(_) => LinkState::Closed,
        };
        match state {
            LinkState::Lost(reason) => Some(BrokerError::Transport(reason)),
            _ => None,
        }
    }

    async fn close(&self) -> Result<()> {
        // Mark first so the error callback fired by closing is not read as a loss.
        self.link.send_replace(LinkState::Closed);
        if self.inner.status().connected() {
            self.inner.close(200, "OK").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        *self.link.borrow() == LinkState::Open && self.inner.status().connected()
    }
}

/// A `lapin` channel.
#[derive(Clone)]
pub struct AmqpChannel {
    inner: lapin::Channel,
}

impl AmqpChannel {
    /// The underlying `lapin` channel.
    pub fn raw(&self) -> &lapin::Channel {
        &self.inner
    }
}

fn lazy_args(lazy: bool) -> FieldTable {
    let mut args = FieldTable::default();
    if lazy {
        args.insert("x-queue-mode".into(), AMQPValue::LongString("lazy".into()));
    }
    args
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    type Delivery = AmqpDelivery;

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        self.inner
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                kind: "exchange",
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<QueueDescriptor> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: options.no_wait,
                },
                lazy_args(options.lazy),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                kind: "queue",
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(QueueDescriptor {
            name: queue.name().as_str().to_string(),
            exchange: String::new(),
            durable: options.durable,
            messages: queue.message_count(),
            consumers: queue.consumer_count(),
        })
    }

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Bind {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn qos(&self, prefetch: u16) -> Result<()> {
        self.inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ConfirmMode(e.to_string()))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm> {
        let properties = BasicProperties::default().with_content_type(message.content_type.into());

        let confirm = self
            .inner
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    immediate: message.immediate,
                },
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        Ok(async move {
            match confirm.await? {
                publisher_confirm::Confirmation::Ack(Some(_)) => Ok(Confirmation::Returned),
                publisher_confirm::Confirmation::Ack(None) => Ok(Confirmation::Ack),
                publisher_confirm::Confirmation::Nack(_) => Ok(Confirmation::Nack),
                publisher_confirm::Confirmation::NotRequested => Ok(Confirmation::Ack),
            }
        }
        .boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        lazy: bool,
    ) -> Result<DeliveryStream<Self::Delivery>> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                lazy_args(lazy),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let queue = queue.to_string();
        let deliveries = consumer.filter_map(move |delivery| {
            let queue = queue.clone();
            async move {
                match delivery {
                    Ok(inner) => Some(AmqpDelivery { inner }),
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Consumer error");
                        None
                    }
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str, no_wait: bool) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: no_wait })
            .await
            .map_err(|e| BrokerError::Cancel {
                consumer: consumer_tag.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<()> {
        if self.inner.status().connected() {
            self.inner.close(200, "OK").await?;
        }
        Ok(())
    }
}

/// A `lapin` delivery.
#[derive(Debug)]
pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    async fn ack(&self, multiple: bool) -> Result<()> {
        self.inner
            .acker
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<()> {
        self.inner
            .acker
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.inner
            .acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}
