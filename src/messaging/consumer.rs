//! Delivery handling with acknowledgment discipline.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backoff::RetryState;
use super::manager::{close_quietly, BrokerConnectionManager, ChannelOf, DeliveryOf};
use super::transport::{BrokerChannel, ConsumeOptions, Delivery, DeliveryStream, Transport};
use crate::types::{AckPolicy, BrokerError, Result};

/// Rejection returned by a parallel handler.
#[derive(Debug)]
pub struct Nack {
    /// Put the message back on the queue
    pub requeue: bool,
    pub error: anyhow::Error,
}

impl Nack {
    /// Reject and ask the broker to redeliver.
    pub fn requeue(error: impl Into<anyhow::Error>) -> Self {
        Self {
            requeue: true,
            error: error.into(),
        }
    }

    /// Reject and drop the message.
    pub fn discard(error: impl Into<anyhow::Error>) -> Self {
        Self {
            requeue: false,
            error: error.into(),
        }
    }
}

impl fmt::Display for Nack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (requeue: {})", self.error, self.requeue)
    }
}

/// Run `handler` over every delivery, one at a time in arrival order.
///
/// On success the delivery is acked when `policy` is explicit and left alone
/// otherwise. On failure it is rejected, requeued only when `policy` is
/// explicit. Acknowledgment failures are logged. Returns when the stream ends.
pub async fn handle_messages<S, F, Fut>(queue_name: String, policy: AckPolicy, mut deliveries: S, handler: F)
where
    S: Stream + Unpin,
    S::Item: Delivery,
    F: Fn(Vec<u8>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    info!(queue = %queue_name, ?policy, "Started handling messages");

    while let Some(delivery) = deliveries.next().await {
        debug!(queue = %queue_name, bytes = delivery.body().len(), "Received message");

        match handler(delivery.body().to_vec()).await {
            Ok(()) => {
                if policy.acks_on_success() {
                    if let Err(e) = delivery.ack(false).await {
                        error!(queue = %queue_name, error = %e, "Failed to ack message");
                    }
                }
            }
            Err(err) => {
                error!(queue = %queue_name, error = %err, "Failed to handle message");
                if let Err(e) = delivery.reject(policy.requeue_on_failure()).await {
                    error!(queue = %queue_name, error = %e, "Failed to reject message");
                }
            }
        }
    }

    info!(queue = %queue_name, "Delivery stream closed");
}

impl<T: Transport> BrokerConnectionManager<T> {
    /// Consume `queue` on a fresh channel with the queue name as consumer tag.
    #[instrument(skip(self, options))]
    pub async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream<DeliveryOf<T>>> {
        let channel = self.channel().await?;
        channel
            .consume(queue, queue, options, false)
            .await
            .inspect_err(|e| error!(queue = %queue, error = %e, "Failed to register consumer"))
    }

    /// Spawn a single-worker handler over `deliveries` using the configured
    /// acknowledgment mode.
    pub fn handle_messages<S, F, Fut>(&self, queue_name: &str, deliveries: S, handler: F) -> JoinHandle<()>
    where
        S: Stream + Send + Unpin + 'static,
        S::Item: Delivery,
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        tokio::spawn(handle_messages(
            queue_name.to_string(),
            self.inner.config.ack_policy(),
            deliveries,
            handler,
        ))
    }

    /// Consume `queue` with `num_workers` concurrent handlers until `cancel`
    /// fires.
    ///
    /// Successes are acked; a [`Nack`] is negatively acknowledged with its
    /// requeue flag. When `exchange` is non-empty the queue is bound to it
    /// with routing key `"{exchange}.{queue}"` first. If the delivery stream
    /// ends without cancellation, the consumer resubscribes on a fresh
    /// channel with the reconnect backoff. A failure of the first
    /// subscription, a closed manager, or exhausting `max_attempts` is
    /// returned as an error.
    #[instrument(skip(self, cancel, handler))]
    pub async fn consumer_parallel<F, Fut>(
        &self,
        cancel: CancellationToken,
        exchange: &str,
        queue: &str,
        num_workers: usize,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Nack>> + Send + 'static,
    {
        if num_workers == 0 {
            return Err(BrokerError::InvalidWorkers(num_workers));
        }

        let handler = Arc::new(handler);
        let mut retry = RetryState::from_config(&self.inner.config.reconnect);
        let (mut channel, mut consumer_tag, mut deliveries) =
            self.subscribe_parallel(exchange, queue, num_workers).await?;
        info!(queue = %queue, workers = num_workers, "Parallel consumer started");

        loop {
            run_workers(&cancel, queue, deliveries, num_workers, &handler).await;

            if cancel.is_cancelled() {
                if let Err(e) = channel.cancel(&consumer_tag, false).await {
                    debug!(queue = %queue, error = %e, "Failed to cancel consumer");
                }
                close_quietly(&channel).await;
                info!(queue = %queue, "Parallel consumer stopped");
                return Ok(());
            }

            close_quietly(&channel).await;
            warn!(queue = %queue, "Delivery stream ended, resubscribing");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(queue = %queue, "Parallel consumer stopped while resubscribing");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(retry.next_delay()) => {}
                }

                match self.subscribe_parallel(exchange, queue, num_workers).await {
                    Ok(subscription) => {
                        (channel, consumer_tag, deliveries) = subscription;
                        info!(queue = %queue, attempts = retry.attempts(), "Resubscribed parallel consumer");
                        retry.reset();
                        break;
                    }
                    Err(BrokerError::Closed) => return Err(BrokerError::Closed),
                    Err(e) => {
                        let attempt = retry.attempts();
                        if self
                            .inner
                            .config
                            .reconnect
                            .max_attempts
                            .is_some_and(|max| attempt >= max)
                        {
                            error!(queue = %queue, error = %e, attempt, "Failed to resubscribe, giving up");
                            return Err(e);
                        }
                        warn!(
                            queue = %queue,
                            error = %e,
                            attempt,
                            retry_in_ms = retry.peek().as_millis() as u64,
                            "Failed to resubscribe"
                        );
                    }
                }
            }
        }
    }

    async fn subscribe_parallel(
        &self,
        exchange: &str,
        queue: &str,
        num_workers: usize,
    ) -> Result<(ChannelOf<T>, String, DeliveryStream<DeliveryOf<T>>)> {
        let channel = self.channel().await?;
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        match self
            .start_parallel(&channel, exchange, queue, &consumer_tag, num_workers)
            .await
        {
            Ok(deliveries) => Ok((channel, consumer_tag, deliveries)),
            Err(e) => {
                close_quietly(&channel).await;
                Err(e)
            }
        }
    }

    async fn start_parallel<C: BrokerChannel>(
        &self,
        channel: &C,
        exchange: &str,
        queue: &str,
        consumer_tag: &str,
        num_workers: usize,
    ) -> Result<DeliveryStream<C::Delivery>> {
        if !exchange.is_empty() {
            let routing_key = format!("{}.{}", exchange, queue);
            channel.queue_bind(queue, &routing_key, exchange).await?;
        }

        let prefetch = self
            .inner
            .config
            .prefetch
            .unwrap_or_else(|| num_workers.min(u16::MAX as usize) as u16);
        channel.qos(prefetch).await?;

        channel
            .consume(queue, consumer_tag, ConsumeOptions::default(), false)
            .await
    }
}

/// Drain `deliveries` with `num_workers` tasks until it ends or `cancel` fires.
async fn run_workers<D, F, Fut>(
    cancel: &CancellationToken,
    queue: &str,
    deliveries: DeliveryStream<D>,
    num_workers: usize,
    handler: &Arc<F>,
) where
    D: Delivery,
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), Nack>> + Send + 'static,
{
    let deliveries = Arc::new(Mutex::new(deliveries));
    let mut workers = JoinSet::new();

    for worker in 0..num_workers {
        let deliveries = Arc::clone(&deliveries);
        let handler = Arc::clone(handler);
        let cancel = cancel.clone();
        let queue = queue.to_string();

        workers.spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = async { deliveries.lock().await.next().await } => next,
                };
                let Some(delivery) = next else { break };

                match handler(delivery.body().to_vec()).await {
                    Ok(()) => {
                        if let Err(e) = delivery.ack(false).await {
                            error!(queue = %queue, worker, error = %e, "Failed to ack message");
                        }
                    }
                    Err(nack) => {
                        warn!(queue = %queue, worker, error = %nack, "Handler rejected message");
                        if let Err(e) = delivery.nack(false, nack.requeue).await {
                            error!(queue = %queue, worker, error = %e, "Failed to nack message");
                        }
                    }
                }
            }
            debug!(queue = %queue, worker, "Worker stopped");
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(queue = %queue, error = %e, "Worker task failed");
        }
    }
}
