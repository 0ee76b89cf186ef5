//! In-process broker transport.
//!
//! Routes messages between channels of the same [`MemoryTransport`] and lets
//! callers script failures: refused dials, dropped connections, unroutable
//! keys and withheld confirmations. Every ack, nack and reject is journaled.
//! Requeued messages are recorded but not redelivered.
//!
//! Closing a channel ends the delivery streams of its consumers once their
//! buffered messages are drained; losing or closing a connection closes every
//! channel opened on it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use super::transport::{
    BrokerChannel, BrokerConnection, Confirmation, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, OutboundMessage, PendingConfirm, QueueDescriptor, QueueOptions, Transport,
};
use crate::types::{BrokerError, Result};

/// How the broker answers publisher confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmBehavior {
    #[default]
    Ack,
    Nack,
    /// Never confirm; the publisher waits until its timeout.
    Withhold,
}

/// One acknowledgment call observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Ack { body: Vec<u8> },
    Nack { body: Vec<u8>, requeue: bool },
    Reject { body: Vec<u8>, requeue: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Open,
    Lost(String),
    Closed,
}

struct QueueConsumer {
    tag: String,
    channel: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    backlog: VecDeque<Vec<u8>>,
    consumers: Vec<QueueConsumer>,
    next_consumer: usize,
}

impl QueueState {
    fn push(&mut self, body: Vec<u8>) {
        self.consumers.retain(|c| !c.tx.is_closed());
        if self.consumers.is_empty() {
            self.backlog.push_back(body);
            return;
        }
        let idx = self.next_consumer % self.consumers.len();
        self.next_consumer = self.next_consumer.wrapping_add(1);
        if let Err(err) = self.consumers[idx].tx.unbounded_send(body) {
            self.backlog.push_back(err.into_inner());
        }
    }
}

struct Link {
    state: Arc<watch::Sender<LinkState>>,
    channels: Vec<(u64, Arc<AtomicBool>)>,
}

#[derive(Default)]
struct BrokerState {
    pending_dial_failures: usize,
    dial_delay: Option<Duration>,
    dial_times: Vec<Instant>,
    links: Vec<Link>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: HashMap<(String, String), String>,
    confirm: ConfirmBehavior,
    journal: Vec<AckEvent>,
    cancelled: Vec<String>,
    published: Vec<OutboundMessage>,
}

impl BrokerState {
    /// Drop the consumers registered on `channel`, ending their streams.
    fn detach_channel(&mut self, channel: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }
    }

    /// Move connection `index` to `next` and close every channel on it.
    fn sever(&mut self, index: usize, next: LinkState) {
        let Some(link) = self.links.get_mut(index) else {
            return;
        };
        link.state.send_replace(next);
        let channels = std::mem::take(&mut link.channels);
        for (id, open) in channels {
            open.store(false, Ordering::SeqCst);
            self.detach_channel(id);
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    changed: Notify,
    next_channel: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, event: AckEvent) {
        self.lock().journal.push(event);
        self.changed.notify_waiters();
    }
}

/// An in-process broker. Clones share the same broker state.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    /// Refuse the next `count` dials.
    pub fn fail_next_dials(&self, count: usize) {
        self.shared.lock().pending_dial_failures = count;
    }

    /// Make every dial take `delay` before it completes.
    pub fn set_dial_delay(&self, delay: Duration) {
        self.shared.lock().dial_delay = Some(delay);
    }

    /// Instants at which every dial attempt, failed or not, was made.
    pub fn dial_times(&self) -> Vec<Instant> {
        self.shared.lock().dial_times.clone()
    }

    pub fn dial_count(&self) -> usize {
        self.shared.lock().dial_times.len()
    }

    /// Drop the most recent connection as if the network failed.
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.shared.lock();
        if let Some(last) = state.links.len().checked_sub(1) {
            state.sever(last, LinkState::Lost(reason.to_string()));
        }
    }

    /// Close the most recent connection from the broker side without error.
    pub fn close_connection(&self) {
        let mut state = self.shared.lock();
        if let Some(last) = state.links.len().checked_sub(1) {
            state.sever(last, LinkState::Closed);
        }
    }

    pub fn set_confirm(&self, behavior: ConfirmBehavior) {
        self.shared.lock().confirm = behavior;
    }

    /// Enqueue a message directly onto a queue, declaring it if needed.
    pub fn inject(&self, queue: &str, body: &[u8]) {
        self.shared
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push(body.to_vec());
    }

    /// Messages accepted for routing, in publish order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.shared.lock().published.clone()
    }

    /// Messages waiting on a queue with no consumer attached.
    pub fn backlog(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    pub fn is_durable(&self, queue: &str) -> bool {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.durable)
            .unwrap_or(false)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.shared.lock().exchanges.get(exchange).copied()
    }

    /// Consumer tags cancelled so far.
    pub fn cancelled(&self) -> Vec<String> {
        self.shared.lock().cancelled.clone()
    }

    pub fn journal(&self) -> Vec<AckEvent> {
        self.shared.lock().journal.clone()
    }

    /// Wait until at least `count` acknowledgment calls were journaled.
    pub async fn wait_for_journal(&self, count: usize) -> Vec<AckEvent> {
        loop {
            let notified = self.shared.changed.notified();
            {
                let state = self.shared.lock();
                if state.journal.len() >= count {
                    return state.journal.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn dial(&self, uri: &str) -> Result<Self::Connection> {
        let delay = {
            let mut state = self.shared.lock();
            state.dial_times.push(Instant::now());
            state.dial_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.lock();
        if state.pending_dial_failures > 0 {
            state.pending_dial_failures -= 1;
            return Err(BrokerError::Dial(format!("connection refused: {uri}")));
        }

        let (link, _) = watch::channel(LinkState::Open);
        let link = Arc::new(link);
        let index = state.links.len();
        state.links.push(Link {
            state: Arc::clone(&link),
            channels: Vec::new(),
        });

        Ok(MemoryConnection {
            shared: Arc::clone(&self.shared),
            link,
            index,
        })
    }
}

/// A connection to a [`MemoryTransport`].
pub struct MemoryConnection {
    shared: Arc<Shared>,
    link: Arc<watch::Sender<LinkState>>,
    index: usize,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<Self::Channel> {
        if !self.is_open() {
            return Err(BrokerError::ChannelOpen("connection is closed".to_string()));
        }
        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        if let Some(link) = self.shared.lock().links.get_mut(self.index) {
            link.channels.push((id, Arc::clone(&open)));
        }
        Ok(MemoryChannel {
            id,
            shared: Arc::clone(&self.shared),
            open,
            confirming: AtomicBool::new(false),
        })
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
        self.shared.lock().sever(self.index, LinkState::Closed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        *self.link.borrow() == LinkState::Open
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    shared: Arc<Shared>,
    open: Arc<AtomicBool>,
    confirming: AtomicBool,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MemoryChannel {
    /// Unique id across all connections of the transport.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::Transport(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<()> {
        self.ensure_open()?;
        self.shared.lock().exchanges.insert(name.to_string(), kind);
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<QueueDescriptor> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        let queue = state.queues.entry(name.to_string()).or_default();
        queue.durable = options.durable;
        Ok(QueueDescriptor {
            name: name.to_string(),
            exchange: String::new(),
            durable: options.durable,
            messages: queue.backlog.len() as u32,
            consumers: queue.consumers.len() as u32,
        })
    }

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Bind {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                reason: format!("no exchange `{exchange}`"),
            });
        }
        state
            .bindings
            .insert((exchange.to_string(), routing_key.to_string()), queue.to_string());
        Ok(())
    }

    async fn qos(&self, _prefetch: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn confirm_select(&self) -> Result<()> {
        self.ensure_open()?;
        self.confirming.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm> {
        self.ensure_open()?;
        let mut state = self.shared.lock();

        let target = if message.exchange.is_empty() {
            state
                .queues
                .contains_key(&message.routing_key)
                .then(|| message.routing_key.clone())
        } else {
            state
                .bindings
                .get(&(message.exchange.clone(), message.routing_key.clone()))
                .cloned()
        };

        let outcome = match target {
            Some(queue) => {
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.push(message.body.clone());
                }
                state.published.push(message.clone());
                Confirmation::Ack
            }
            None if message.mandatory => Confirmation::Returned,
            None => Confirmation::Ack,
        };
        let behavior = state.confirm;
        drop(state);

        if !self.confirming.load(Ordering::SeqCst) {
            return Ok(futures::future::ready(Ok(Confirmation::Ack)).boxed());
        }

        Ok(match (outcome, behavior) {
            (Confirmation::Returned, _) => futures::future::ready(Ok(Confirmation::Returned)).boxed(),
            (_, ConfirmBehavior::Ack) => futures::future::ready(Ok(Confirmation::Ack)).boxed(),
            (_, ConfirmBehavior::Nack) => futures::future::ready(Ok(Confirmation::Nack)).boxed(),
            (_, ConfirmBehavior::Withhold) => futures::future::pending::<Result<Confirmation>>().boxed(),
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: ConsumeOptions,
        _lazy: bool,
    ) -> Result<DeliveryStream<Self::Delivery>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded();
        {
            let mut state = self.shared.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(BrokerError::Consume {
                    queue: queue.to_string(),
                    reason: "NOT_FOUND - no queue".to_string(),
                });
            };
            q.consumers.push(QueueConsumer {
                tag: consumer_tag.to_string(),
                channel: self.id,
                tx,
            });
            let backlog: Vec<_> = q.backlog.drain(..).collect();
            for body in backlog {
                q.push(body);
            }
        }

        let shared = Arc::clone(&self.shared);
        let open = Arc::clone(&self.open);
        Ok(rx
            .map(move |body| MemoryDelivery {
                body,
                shared: Arc::clone(&shared),
                channel_open: Arc::clone(&open),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str, _no_wait: bool) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        let mut found = false;
        for queue in state.queues.values_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.tag != consumer_tag);
            found |= queue.consumers.len() != before;
        }
        if !found {
            return Err(BrokerError::Cancel {
                consumer: consumer_tag.to_string(),
                reason: "unknown consumer tag".to_string(),
            });
        }
        state.cancelled.push(consumer_tag.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.shared.lock().detach_channel(self.id);
        Ok(())
    }
}

/// A message delivered by a [`MemoryTransport`].
pub struct MemoryDelivery {
    body: Vec<u8>,
    shared: Arc<Shared>,
    channel_open: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDelivery")
            .field("body", &String::from_utf8_lossy(&self.body))
            .finish()
    }
}

impl MemoryDelivery {
    fn settle(&self, event: AckEvent) -> Result<()> {
        if !self.channel_open.load(Ordering::SeqCst) {
            return Err(BrokerError::Acknowledge("channel is closed".to_string()));
        }
        self.shared.record(event);
        Ok(())
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(&self, _multiple: bool) -> Result<()> {
        self.settle(AckEvent::Ack {
            body: self.body.clone(),
        })
    }

    async fn nack(&self, _multiple: bool, requeue: bool) -> Result<()> {
        self.settle(AckEvent::Nack {
            body: self.body.clone(),
            requeue,
        })
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(AckEvent::Reject {
            body: self.body.clone(),
            requeue,
        })
    }
}
