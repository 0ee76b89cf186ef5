//! Confirmed publishing.
//!
//! Each publish opens a fresh channel, switches it to confirmation mode,
//! sends one mandatory message and waits for the first of: a broker ack, a
//! return or nack, or the notify timeout. The channel is closed on every path.

use serde::Serialize;
use tracing::{debug, error, info, instrument};

use super::manager::{close_quietly, BrokerConnectionManager};
use super::transport::{BrokerChannel, Confirmation, OutboundMessage, QueueDescriptor, Transport};
use crate::types::{BrokerError, ConfirmTimeoutPolicy, Result};

impl<T: Transport> BrokerConnectionManager<T> {
    /// Publish `body` to a declared queue through the default exchange.
    #[instrument(skip(self, queue, body), fields(queue = %queue.name, bytes = body.len()))]
    pub async fn publish(&self, queue: &QueueDescriptor, body: &[u8]) -> Result<()> {
        self.publish_confirmed(OutboundMessage::mandatory("", &queue.name, body))
            .await
    }

    /// Publish `body` to the queue named `queue_name` through the default exchange.
    #[instrument(skip(self, body), fields(bytes = body.len()))]
    pub async fn publish_context(&self, queue_name: &str, body: &[u8]) -> Result<()> {
        self.publish_confirmed(OutboundMessage::mandatory("", queue_name, body))
            .await
    }

    /// Serialize `payload` as JSON and publish it to `exchange` with routing
    /// key `"{exchange}.{queue}"`.
    #[instrument(skip(self, payload))]
    pub async fn publish_json<P: Serialize + ?Sized>(
        &self,
        exchange: &str,
        queue: &str,
        payload: &P,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let routing_key = format!("{}.{}", exchange, queue);
        let message = OutboundMessage::mandatory(exchange, &routing_key, &body)
            .with_content_type("application/json");

        let result = self.publish_confirmed(message).await;
        match &result {
            Ok(()) => info!(key = %routing_key, "Publish succeeded"),
            Err(e) => error!(key = %routing_key, error = %e, "Publish failed"),
        }
        result
    }

    async fn publish_confirmed(&self, message: OutboundMessage) -> Result<()> {
        let channel = self.channel().await?;
        let result = self.confirm_on(&channel, message).await;
        close_quietly(&channel).await;
        result
    }

    async fn confirm_on<C: BrokerChannel>(&self, channel: &C, message: OutboundMessage) -> Result<()> {
        channel.confirm_select().await?;

        let routing_key = message.routing_key.clone();
        let pending = channel.publish(message).await?;
        let timeout = self.inner.config.notify_timeout();

        tokio::select! {
            confirmation = pending => match confirmation? {
                Confirmation::Ack => {
                    debug!(key = %routing_key, "Message confirmed");
                    Ok(())
                }
                Confirmation::Nack => Err(BrokerError::Nacked { routing_key }),
                Confirmation::Returned => Err(BrokerError::Unroutable { routing_key }),
            },
            _ = tokio::time::sleep(timeout) => match self.inner.config.confirm_timeout {
                ConfirmTimeoutPolicy::Log => {
                    error!(
                        key = %routing_key,
                        timeout_ms = timeout.as_millis() as u64,
                        "Message delivery confirmation to exchange/queue timed out"
                    );
                    Ok(())
                }
                ConfirmTimeoutPolicy::Fail => Err(BrokerError::ConfirmTimeout(timeout)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde::Serialize;

    use crate::messaging::memory::{ConfirmBehavior, MemoryTransport};
    use crate::messaging::{BrokerConnectionManager, ExchangeKind};
    use crate::types::{BrokerConfig, BrokerError, ConfirmTimeoutPolicy};

    fn manager(
        transport: &MemoryTransport,
        policy: ConfirmTimeoutPolicy,
    ) -> BrokerConnectionManager<MemoryTransport> {
        let config = BrokerConfig::with_uri("memory://")
            .with_notify_timeout(Duration::from_secs(5))
            .with_confirm_timeout(policy);
        BrokerConnectionManager::new(config, transport.clone())
    }

    #[tokio::test]
    async fn test_publish_to_routable_queue_is_confirmed() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, ConfirmTimeoutPolicy::Fail);
        let queue = manager.setup("jobs", "", true).await.unwrap();

        manager.publish(&queue, b"hello").await.unwrap();

        assert_eq!(transport.backlog("jobs"), vec![b"hello".to_vec()]);
        let sent = transport.published();
        assert!(sent[0].mandatory);
        assert!(!sent[0].immediate);
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_distinct_from_timeout() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, ConfirmTimeoutPolicy::Fail);
        manager.connect().await.unwrap();

        let err = manager.publish_context("nowhere", b"lost").await.unwrap_err();

        assert!(matches!(&err, BrokerError::Unroutable { routing_key } if routing_key == "nowhere"));
        assert!(err.is_delivery_failure());
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_broker_nack_is_an_error() {
        let transport = MemoryTransport::new();
        transport.set_confirm(ConfirmBehavior::Nack);
        let manager = manager(&transport, ConfirmTimeoutPolicy::Log);
        manager.setup("jobs", "", false).await.unwrap();

        let err = manager.publish_context("jobs", b"refused").await.unwrap_err();
        assert!(matches!(err, BrokerError::Nacked { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_timeout_logged_by_default() {
        let transport = MemoryTransport::new();
        transport.set_confirm(ConfirmBehavior::Withhold);
        let manager = manager(&transport, ConfirmTimeoutPolicy::Log);
        manager.setup("jobs", "", false).await.unwrap();

        let started = tokio::time::Instant::now();
        manager.publish_context("jobs", b"slow").await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_timeout_can_fail() {
        let transport = MemoryTransport::new();
        transport.set_confirm(ConfirmBehavior::Withhold);
        let manager = manager(&transport, ConfirmTimeoutPolicy::Fail);
        manager.setup("jobs", "", false).await.unwrap();

        let err = manager.publish_context("jobs", b"slow").await.unwrap_err();

        assert!(matches!(err, BrokerError::ConfirmTimeout(t) if t == Duration::from_secs(5)));
        assert!(!err.is_delivery_failure());
    }

    #[derive(Serialize)]
    struct OrderPlaced {
        id: u64,
        total: u32,
    }

    #[tokio::test]
    async fn test_publish_json_uses_exchange_routing_key() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, ConfirmTimeoutPolicy::Fail);
        manager.declare_topic_queue("shop", "orders").await.unwrap();

        manager
            .publish_json("shop", "orders", &OrderPlaced { id: 7, total: 1200 })
            .await
            .unwrap();

        let sent = transport.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].exchange, "shop");
        assert_eq!(sent[0].routing_key, "shop.orders");
        assert_eq!(sent[0].content_type, "application/json");
        assert_eq!(transport.backlog("orders"), vec![br#"{"id":7,"total":1200}"#.to_vec()]);
        assert_eq!(transport.exchange_kind("shop"), Some(ExchangeKind::Topic));
    }
}
