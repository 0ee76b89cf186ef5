//! Auto-reconnecting broker connection manager.
//!
//! Owns one broker connection, hands out fresh or name-tracked channels, and
//! runs a watcher task that redials with Fibonacci backoff when the
//! connection drops. Tracked channels never outlive the connection they were
//! opened on: the registry is cleared under the same lock that replaces the
//! connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::amqp::AmqpTransport;
use super::backoff::RetryState;
use super::registry::ChannelRegistry;
use super::transport::{
    BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryStream, ExchangeKind,
    QueueDescriptor, QueueOptions, Transport,
};
use crate::types::{BrokerConfig, BrokerError, Result};

/// Channel type produced by a transport's connections.
pub type ChannelOf<T> = <<T as Transport>::Connection as BrokerConnection>::Channel;

/// Delivery type produced by a transport's channels.
pub type DeliveryOf<T> = <ChannelOf<T> as BrokerChannel>::Delivery;

/// Manager over the `lapin` transport.
pub type AmqpManager = BrokerConnectionManager<AmqpTransport>;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected, or closed gracefully by the broker
    Disconnected,
    /// Connection lost; the watcher is redialing
    Connecting,
    Connected,
    /// Shutdown in progress
    Closing,
    /// Shut down; terminal
    Closed,
}

pub(super) struct Link<T: Transport> {
    pub(super) state: ConnectionState,
    pub(super) connection: Option<Arc<T::Connection>>,
    pub(super) channels: ChannelRegistry<ChannelOf<T>>,
    connected_at: Option<DateTime<Utc>>,
}

impl<T: Transport> Link<T> {
    fn install(&mut self, connection: Arc<T::Connection>) {
        self.channels.clear();
        self.connection = Some(connection);
        self.state = ConnectionState::Connected;
        self.connected_at = Some(Utc::now());
    }

    fn owns(&self, connection: &Arc<T::Connection>) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, connection))
    }
}

pub(super) struct Inner<T: Transport> {
    pub(super) config: BrokerConfig,
    transport: T,
    pub(super) link: RwLock<Link<T>>,
    retry: Mutex<RetryState>,
    reconnects: AtomicU64,
}

impl<T: Transport> Inner<T> {
    fn retry(&self) -> MutexGuard<'_, RetryState> {
        self.retry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Auto-reconnecting connection manager. Clones share the same connection.
pub struct BrokerConnectionManager<T: Transport> {
    pub(super) inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for BrokerConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl AmqpManager {
    /// Create a manager that dials real brokers.
    pub fn amqp(config: BrokerConfig) -> Self {
        Self::new(config, AmqpTransport::new())
    }
}

impl<T: Transport> BrokerConnectionManager<T> {
    /// Create a disconnected manager. Call [`connect`](Self::connect) once at startup.
    pub fn new(config: BrokerConfig, transport: T) -> Self {
        let retry = RetryState::from_config(&config.reconnect);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                link: RwLock::new(Link {
                    state: ConnectionState::Disconnected,
                    connection: None,
                    channels: ChannelRegistry::new(),
                    connected_at: None,
                }),
                retry: Mutex::new(retry),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Dial the broker and start the connection watcher.
    ///
    /// A failed dial is returned as is and not retried. Calling this while
    /// already connected is a no-op. The manager reports `Connecting` while
    /// the dial is in flight; the lock is not held across it.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut link = self.inner.link.write().await;
            match link.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => return Err(BrokerError::Reconnecting),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(BrokerError::Closed)
                }
                ConnectionState::Disconnected => link.state = ConnectionState::Connecting,
            }
        }

        let dialed = self.inner.transport.dial(&self.inner.config.uri).await;

        let mut link = self.inner.link.write().await;
        let connection = match dialed {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                if link.state == ConnectionState::Connecting {
                    link.state = ConnectionState::Disconnected;
                }
                error!(error = %e, "Failed to connect to broker");
                return Err(e);
            }
        };
        if link.state != ConnectionState::Connecting {
            // Shut down while dialing.
            drop(link);
            let _ = connection.close().await;
            return Err(BrokerError::Closed);
        }
        link.install(Arc::clone(&connection));
        drop(link);

        info!("Connection to broker established");
        tokio::spawn(watch_connection(Arc::clone(&self.inner), connection));
        Ok(())
    }

    /// Close the connection and forget every tracked channel. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let connection = {
            let mut link = self.inner.link.write().await;
            if matches!(link.state, ConnectionState::Closing | ConnectionState::Closed) {
                return Ok(());
            }
            link.state = ConnectionState::Closing;
            link.channels.clear();
            link.connected_at = None;
            link.connection.take()
        };

        let result = match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };

        self.inner.link.write().await.state = ConnectionState::Closed;
        info!("Broker connection shut down");
        result
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.link.read().await.state
    }

    pub async fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.inner.link.read().await.connected_at
    }

    /// Number of channels currently tracked by name.
    pub async fn tracked_channels(&self) -> usize {
        self.inner.link.read().await.channels.len()
    }

    /// Successful automatic reconnects since construction.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    async fn live_connection(&self) -> Result<Arc<T::Connection>> {
        {
            let link = self.inner.link.read().await;
            match link.state {
                ConnectionState::Connected => {
                    if let Some(connection) = &link.connection {
                        return Ok(Arc::clone(connection));
                    }
                }
                ConnectionState::Connecting => return Err(BrokerError::Reconnecting),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(BrokerError::Closed)
                }
                ConnectionState::Disconnected => {}
            }
        }

        if let Err(e) = self.connect().await {
            warn!(error = %e, "Implicit connect failed");
            return Err(BrokerError::NotConnected);
        }
        self.inner
            .link
            .read()
            .await
            .connection
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    /// Open a fresh, untracked channel. The caller owns it and must close it.
    pub async fn channel(&self) -> Result<ChannelOf<T>> {
        self.live_connection().await?.open_channel().await
    }

    /// Return the channel tracked under `name`, opening and tracking one if needed.
    pub async fn channel_by_name(&self, name: &str) -> Result<Arc<ChannelOf<T>>> {
        let connection = self.live_connection().await?;
        if let Some(channel) = self.inner.link.read().await.channels.get(name) {
            return Ok(channel);
        }

        let opened = Arc::new(connection.open_channel().await?);

        let mut link = self.inner.link.write().await;
        if !link.owns(&connection) {
            drop(link);
            let _ = opened.close().await;
            return Err(BrokerError::Reconnecting);
        }
        let tracked = link.channels.get_or_insert(name, Arc::clone(&opened));
        drop(link);

        if !Arc::ptr_eq(&tracked, &opened) {
            let _ = opened.close().await;
        } else {
            debug!(name = %name, "Tracking new channel");
        }
        Ok(tracked)
    }

    /// Open and immediately close a channel to prove the connection works.
    pub async fn ping(&self) -> Result<()> {
        let channel = self.channel().await?;
        channel.close().await
    }

    /// Declare an exchange on a fresh channel.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let channel = self.channel().await?;
        let result = channel.exchange_declare(name, kind, durable).await;
        close_quietly(&channel).await;
        result
    }

    /// Declare `name` and bind it to `exchange` with routing key `"{exchange}.{name}"`.
    /// An empty exchange means the default exchange and skips the bind.
    pub async fn declare_queue(
        &self,
        channel: &ChannelOf<T>,
        name: &str,
        exchange: &str,
        durable: bool,
    ) -> Result<QueueDescriptor> {
        let mut queue = channel
            .queue_declare(
                name,
                QueueOptions {
                    durable,
                    ..Default::default()
                },
            )
            .await
            .inspect_err(|e| error!(name = %name, error = %e, "Failed to declare queue"))?;

        if !exchange.is_empty() {
            let routing_key = format!("{}.{}", exchange, queue.name);
            channel
                .queue_bind(&queue.name, &routing_key, exchange)
                .await
                .inspect_err(|e| error!(name = %name, error = %e, "Failed to bind queue"))?;
        }

        queue.exchange = exchange.to_string();
        info!(name = %name, exchange = %exchange, "Declared queue");
        Ok(queue)
    }

    /// Declare a queue on a fresh channel that is closed afterwards.
    pub async fn setup(&self, name: &str, exchange: &str, durable: bool) -> Result<QueueDescriptor> {
        let channel = self.channel().await?;
        let result = self.declare_queue(&channel, name, exchange, durable).await;
        close_quietly(&channel).await;
        result
    }

    /// Declare a durable topic exchange and a durable queue bound to it.
    pub async fn declare_topic_queue(&self, exchange: &str, queue: &str) -> Result<QueueDescriptor> {
        let channel = self.channel().await?;
        let result = async {
            channel.exchange_declare(exchange, ExchangeKind::Topic, true).await?;
            self.declare_queue(&channel, queue, exchange, true).await
        }
        .await;
        close_quietly(&channel).await;
        result
    }

    /// Declare the lazy queue backing `caller_id` on its tracked channel.
    pub async fn create_topic_queue(
        &self,
        caller_id: &str,
        durable: bool,
        auto_delete: bool,
        exclusive: bool,
        no_wait: bool,
    ) -> Result<QueueDescriptor> {
        let channel = self.channel_by_name(caller_id).await.inspect_err(
            |e| error!(caller = %caller_id, error = %e, "Failed to get channel to create queue"),
        )?;

        channel
            .queue_declare(
                &self.inner.config.topic_queue(caller_id),
                QueueOptions {
                    durable,
                    auto_delete,
                    exclusive,
                    no_wait,
                    lazy: true,
                },
            )
            .await
    }

    /// Start consuming the queue backing `topic` on the topic's tracked channel.
    #[instrument(skip(self, options))]
    pub async fn subscribe_topic(
        &self,
        topic: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream<DeliveryOf<T>>> {
        let channel = self.channel_by_name(topic).await.inspect_err(
            |e| error!(topic = %topic, error = %e, "Failed to get channel to subscribe topic"),
        )?;

        channel
            .consume(&self.inner.config.topic_queue(topic), consumer_tag, options, true)
            .await
    }

    /// Cancel the topic's consumer, close its channel and stop tracking it.
    #[instrument(skip(self))]
    pub async fn leave_topic(&self, topic: &str, consumer_tag: &str, no_wait: bool) -> Result<()> {
        let channel = self
            .inner
            .link
            .write()
            .await
            .channels
            .remove(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

        let result = channel.cancel(consumer_tag, no_wait).await;
        close_quietly(channel.as_ref()).await;
        if let Err(e) = &result {
            error!(topic = %topic, error = %e, "Failed to cancel topic consumer");
        }
        result
    }
}

pub(super) async fn close_quietly<C: BrokerChannel>(channel: &C) {
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Failed to close channel");
    }
}

/// Block on the connection's close signal and redial after unexpected loss.
async fn watch_connection<T: Transport>(inner: Arc<Inner<T>>, mut connection: Arc<T::Connection>) {
    loop {
        let cause = connection.closed().await;

        {
            let mut link = inner.link.write().await;
            if !link.owns(&connection) {
                // Shut down, or replaced by an explicit connect.
                return;
            }
            if !link.channels.is_empty() {
                debug!(channels = ?link.channels.names(), "Dropping channels of closed connection");
            }
            let dropped = link.channels.clear();
            link.connection = None;
            link.connected_at = None;

            match cause {
                None => {
                    link.state = ConnectionState::Disconnected;
                    info!(dropped_channels = dropped, "Broker connection closed");
                    return;
                }
                Some(e) => {
                    link.state = ConnectionState::Connecting;
                    error!(error = %e, dropped_channels = dropped, "Connection dropped, reconnecting");
                }
            }
        }

        match redial(&inner).await {
            Some(next) => connection = next,
            None => return,
        }
    }
}

async fn redial<T: Transport>(inner: &Inner<T>) -> Option<Arc<T::Connection>> {
    loop {
        if inner.link.read().await.state != ConnectionState::Connecting {
            return None;
        }

        match inner.transport.dial(&inner.config.uri).await {
            Ok(connection) => {
                let connection = Arc::new(connection);
                let mut link = inner.link.write().await;
                if link.state != ConnectionState::Connecting {
                    drop(link);
                    let _ = connection.close().await;
                    return None;
                }
                link.install(Arc::clone(&connection));
                drop(link);

                let failures = {
                    let mut retry = inner.retry();
                    let failures = retry.attempts();
                    retry.reset();
                    failures
                };
                inner.reconnects.fetch_add(1, Ordering::SeqCst);
                info!(failed_attempts = failures, "Reconnected to broker");
                return Some(connection);
            }
            Err(e) => {
                let (attempt, delay) = {
                    let mut retry = inner.retry();
                    let attempt = retry.attempts() + 1;
                    if inner
                        .config
                        .reconnect
                        .max_attempts
                        .is_some_and(|max| attempt >= max)
                    {
                        retry.reset();
                        (attempt, None)
                    } else {
                        (attempt, Some(retry.next_delay()))
                    }
                };

                let Some(delay) = delay else {
                    error!(error = %e, attempt, "Failed to reconnect, giving up");
                    let mut link = inner.link.write().await;
                    if link.state == ConnectionState::Connecting {
                        link.state = ConnectionState::Disconnected;
                    }
                    return None;
                };

                error!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Failed to reconnect"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::MemoryTransport;
    use crate::types::ReconnectConfig;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn manager(transport: &MemoryTransport) -> BrokerConnectionManager<MemoryTransport> {
        BrokerConnectionManager::new(BrokerConfig::with_uri("memory://"), transport.clone())
    }

    async fn wait_for_state<T: Transport>(manager: &BrokerConnectionManager<T>, state: ConnectionState) {
        while manager.state().await != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_reconnects<T: Transport>(manager: &BrokerConnectionManager<T>, count: u64) {
        while manager.reconnect_count() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_initial_dial_failure_is_returned() {
        let transport = MemoryTransport::new();
        transport.fail_next_dials(1);
        let manager = manager(&transport);

        let err = manager.connect().await.unwrap_err();

        assert!(matches!(err, BrokerError::Dial(_)));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(transport.dial_count(), 1);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_channel_connects_implicitly() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);

        let channel = manager.channel().await.unwrap();

        assert!(channel.is_open());
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_channel_reports_not_connected_when_dial_fails() {
        let transport = MemoryTransport::new();
        transport.fail_next_dials(1);
        let manager = manager(&transport);

        let err = manager.channel().await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
    }

    #[tokio::test]
    async fn test_channel_by_name_reuses_until_reconnect() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect().await.unwrap();

        let first = manager.channel_by_name("x").await.unwrap();
        let again = manager.channel_by_name("x").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(manager.tracked_channels().await, 1);

        transport.drop_connection("network reset");
        wait_for_reconnects(&manager, 1).await;

        let after = manager.channel_by_name("x").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &after));
        assert_ne!(first.id(), after.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redial_backoff_grows_and_registry_is_cleared() {
        let transport = MemoryTransport::new();
        let config = BrokerConfig::with_uri("memory://").with_reconnect(ReconnectConfig {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            max_attempts: None,
        });
        let manager = BrokerConnectionManager::new(config, transport.clone());
        manager.connect().await.unwrap();
        manager.channel_by_name("orders").await.unwrap();
        manager.channel_by_name("billing").await.unwrap();

        transport.fail_next_dials(3);
        transport.drop_connection("broker restarted");
        wait_for_state(&manager, ConnectionState::Connecting).await;
        assert_eq!(manager.tracked_channels().await, 0);
        wait_for_reconnects(&manager, 1).await;

        let times = transport.dial_times();
        assert_eq!(times.len(), 5);
        let gaps: Vec<_> = times[1..].windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(5)
            ]
        );
        assert_eq!(manager.tracked_channels().await, 0);
        assert_eq!(manager.reconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_closure_triggers_one_redial() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect().await.unwrap();

        for round in 1..=3u64 {
            manager.channel_by_name("topic").await.unwrap();
            transport.drop_connection("flap");
            wait_for_reconnects(&manager, round).await;

            assert_eq!(manager.reconnect_count(), round);
            assert_eq!(manager.tracked_channels().await, 0);
        }
        assert_eq!(transport.dial_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_stops_watcher() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect().await.unwrap();
        manager.channel_by_name("orders").await.unwrap();

        transport.close_connection();
        wait_for_state(&manager, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.dial_count(), 1);
        assert_eq!(manager.tracked_channels().await, 0);
        assert_eq!(manager.reconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_gives_up() {
        let transport = MemoryTransport::new();
        let config = BrokerConfig::with_uri("memory://").with_reconnect(ReconnectConfig {
            max_attempts: Some(3),
            ..Default::default()
        });
        let manager = BrokerConnectionManager::new(config, transport.clone());
        manager.connect().await.unwrap();

        transport.fail_next_dials(10);
        transport.drop_connection("gone");
        wait_for_state(&manager, ConnectionState::Disconnected).await;

        assert_eq!(transport.dial_count(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_terminal() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect().await.unwrap();
        manager.channel_by_name("orders").await.unwrap();

        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();

        assert_eq!(manager.state().await, ConnectionState::Closed);
        assert_eq!(manager.tracked_channels().await, 0);
        assert!(matches!(manager.channel().await, Err(BrokerError::Closed)));
        assert!(matches!(manager.connect().await, Err(BrokerError::Closed)));
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_dial_does_not_block_readers() {
        let transport = MemoryTransport::new();
        transport.set_dial_delay(Duration::from_secs(30));
        let manager = manager(&transport);

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = tokio::time::timeout(Duration::from_secs(1), manager.state())
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Connecting);
        assert_eq!(manager.tracked_channels().await, 0);
        assert!(matches!(manager.channel().await, Err(BrokerError::Reconnecting)));

        connecting.await.unwrap().unwrap();
        assert_eq!(manager.state().await, ConnectionState::Connected);
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_slow_dial_wins() {
        let transport = MemoryTransport::new();
        transport.set_dial_delay(Duration::from_secs(30));
        let manager = manager(&transport);

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.shutdown().await.unwrap();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert_eq!(manager.state().await, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_redialing() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect().await.unwrap();

        transport.fail_next_dials(10);
        transport.drop_connection("broker down");
        while transport.dial_count() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown().await.unwrap();
        let before = transport.dial_count();

        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(transport.dial_count(), before);
        assert_eq!(manager.state().await, ConnectionState::Closed);
        assert_eq!(manager.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_setup_declares_and_binds() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager
            .declare_exchange("events", ExchangeKind::Topic, true)
            .await
            .unwrap();

        let queue = manager.setup("orders", "events", true).await.unwrap();

        assert_eq!(queue.name, "orders");
        assert_eq!(queue.exchange, "events");
        assert!(transport.is_durable("orders"));
        assert_eq!(transport.exchange_kind("events"), Some(ExchangeKind::Topic));
    }

    #[tokio::test]
    async fn test_setup_surfaces_bind_failure() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);

        let err = manager.setup("orders", "missing", false).await.unwrap_err();
        assert!(matches!(err, BrokerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_declare_topic_queue() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);

        let queue = manager.declare_topic_queue("12345", "125").await.unwrap();

        assert!(queue.durable);
        assert_eq!(transport.exchange_kind("12345"), Some(ExchangeKind::Topic));
        assert!(transport.has_queue("125"));
    }

    #[tokio::test]
    async fn test_create_topic_queue_uses_prefix_and_tracked_channel() {
        let transport = MemoryTransport::new();
        let config = BrokerConfig::with_uri("memory://").with_queue_prefix("chat.");
        let manager = BrokerConnectionManager::new(config, transport.clone());

        let queue = manager
            .create_topic_queue("room-1", false, true, false, false)
            .await
            .unwrap();

        assert_eq!(queue.name, "chat.room-1");
        assert_eq!(manager.tracked_channels().await, 1);
    }

    #[tokio::test]
    async fn test_leave_unknown_topic_fails() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect().await.unwrap();

        let err = manager.leave_topic("nope", "tag", false).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic(topic) if topic == "nope"));
    }

    #[tokio::test]
    async fn test_leave_topic_cancels_and_untracks() {
        let transport = MemoryTransport::new();
        let config = BrokerConfig::with_uri("memory://").with_queue_prefix("q.");
        let manager = BrokerConnectionManager::new(config, transport.clone());
        manager
            .create_topic_queue("news", false, false, false, false)
            .await
            .unwrap();

        let _deliveries = manager
            .subscribe_topic("news", "reader", ConsumeOptions::default())
            .await
            .unwrap();
        let subscribed = manager.channel_by_name("news").await.unwrap();

        manager.leave_topic("news", "reader", false).await.unwrap();

        assert_eq!(transport.cancelled(), vec!["reader".to_string()]);
        assert!(!subscribed.is_open());
        assert_eq!(manager.tracked_channels().await, 0);

        let fresh = manager.channel_by_name("news").await.unwrap();
        assert!(!Arc::ptr_eq(&subscribed, &fresh));
        assert!(fresh.is_open());
    }

    #[tokio::test]
    async fn test_ping() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        tokio_test::assert_ok!(manager.ping().await);
    }
}
