//! In-memory broker for tests.
//!
//! Models the parts of a topic broker the bus relies on: exchanges,
//! queues, exact routing-key bindings, unacked deliveries that return to
//! their queue when the channel or connection dies, and redelivery flags.
//!
//! Fault injection hooks (`fail_next_connects`, `fail_next_publishes`,
//! `fail_next_receives`, `close_connections`) let tests drive the retry and
//! recovery paths deterministically. The publish log behind `published_to`
//! keeps only the most recent `DEFAULT_HISTORY_LIMIT` messages.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::domain::foundation::{DomainError, ErrorCode, Timestamp};
use crate::ports::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery, OutboundMessage};

/// Messages kept in the publish log before the oldest are dropped.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
struct StoredMessage {
    message: OutboundMessage,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerInner {
    exchanges: HashSet<String>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    /// exchange -> routing key -> bound queues
    bindings: HashMap<String, HashMap<String, BTreeSet<String>>>,
    unacked: HashMap<String, Unacked>,
    published: VecDeque<(String, OutboundMessage)>,
    /// Overrides `DEFAULT_HISTORY_LIMIT` when set.
    history_limit: Option<usize>,
    next_tag: u64,
}

impl BrokerInner {
    fn requeue_where(&mut self, pred: impl Fn(&Unacked) -> bool) {
        let tags: Vec<String> = self
            .unacked
            .iter()
            .filter(|(_, u)| pred(u))
            .map(|(tag, _)| tag.clone())
            .collect();

        for tag in tags {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                self.queues
                    .entry(unacked.queue)
                    .or_default()
                    .push_front(unacked.message);
            }
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    inner: Mutex<BrokerInner>,
    delivered: Notify,
    generation: AtomicU64,
    next_channel_id: AtomicU64,
    connects: AtomicU64,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
    fail_receives: AtomicU32,
}

impl BrokerState {
    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Consumes one unit of an injected fault budget.
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-process broker shared by every connection it hands out.
///
/// Cloning is cheap; clones observe the same exchanges and queues.
///
/// # Example
///
/// ```ignore
/// let broker = InMemoryBroker::new();
/// let connector: Arc<dyn BrokerConnector> = Arc::new(broker.clone());
///
/// broker.fail_next_publishes(2);
/// publisher.publish(&event).await?; // succeeds on the third attempt
/// assert_eq!(broker.published_to("bus.events").len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `limit` messages in the publish log.
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.state.lock().history_limit = Some(limit);
        self
    }

    // === Fault Injection ===

    /// The next `n` connect attempts fail with `BrokerUnavailable`.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` publishes fail with `BrokerUnavailable`.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// The next `n` receives fail with `ChannelClosed`.
    pub fn fail_next_receives(&self, n: u32) {
        self.state.fail_receives.store(n, Ordering::SeqCst);
        self.state.delivered.notify_waiters();
    }

    /// Drops every open connection, as a broker restart would.
    ///
    /// Unacked deliveries go back to their queues marked redelivered.
    pub fn close_connections(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state.lock().requeue_where(|_| true);
        self.state.delivered.notify_waiters();
    }

    // === Test Helpers ===

    /// Recent messages accepted by `exchange`, in publish order.
    pub fn published_to(&self, exchange: &str) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(ex, _)| ex == exchange)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    /// Messages waiting in `queue`, not counting unacked deliveries.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Routing keys that route `exchange` into `queue`, sorted.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        let inner = self.state.lock();
        let mut keys: Vec<String> = inner
            .bindings
            .get(exchange)
            .map(|by_key| {
                by_key
                    .iter()
                    .filter(|(_, queues)| queues.contains(queue))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, DomainError> {
        if take_fault(&self.state.fail_connects) {
            return Err(DomainError::broker_unavailable("Connection refused (injected)"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(InMemoryConnection {
            state: self.state.clone(),
            generation: self.state.generation(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct InMemoryConnection {
    state: Arc<BrokerState>,
    generation: u64,
    closed: Arc<AtomicBool>,
}

impl InMemoryConnection {
    fn alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.generation == self.state.generation()
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.alive()
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, DomainError> {
        if !self.alive() {
            return Err(DomainError::broker_unavailable("Connection is closed"));
        }

        Ok(Box::new(InMemoryChannel {
            state: self.state.clone(),
            generation: self.generation,
            connection_closed: self.closed.clone(),
            id: self.state.next_channel_id.fetch_add(1, Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), DomainError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.delivered.notify_waiters();
        }
        Ok(())
    }
}

struct InMemoryChannel {
    state: Arc<BrokerState>,
    generation: u64,
    connection_closed: Arc<AtomicBool>,
    id: u64,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), DomainError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DomainError::channel_closed("Channel is closed"));
        }
        if self.connection_closed.load(Ordering::SeqCst)
            || self.generation != self.state.generation()
        {
            return Err(DomainError::channel_closed("Connection was closed by the broker"));
        }
        Ok(())
    }

    fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut inner = self.state.lock();
        let stored = inner.queues.get_mut(queue)?.pop_front()?;

        inner.next_tag += 1;
        let delivery_tag = format!("{}.{}", self.id, inner.next_tag);
        let delivery = Delivery {
            delivery_tag: delivery_tag.clone(),
            routing_key: stored.message.routing_key.clone(),
            body: stored.message.body.clone(),
            message_id: stored.message.message_id.clone(),
            redelivered: stored.redelivered,
            received_at: Timestamp::now(),
        };
        inner.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_string(),
                channel_id: self.id,
                message: stored,
            },
        );
        Some(delivery)
    }

    fn settle(&self, delivery: &Delivery) -> Result<Unacked, DomainError> {
        self.state
            .lock()
            .unacked
            .remove(&delivery.delivery_tag)
            .ok_or_else(|| {
                DomainError::new(
                    ErrorCode::BrokerProtocol,
                    format!("Unknown delivery tag {}", delivery.delivery_tag),
                )
            })
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), DomainError> {
        self.ensure_open()?;
        self.state.lock().exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), DomainError> {
        self.ensure_open()?;
        self.state.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        let mut inner = self.state.lock();
        if !inner.exchanges.contains(exchange) {
            return Err(DomainError::new(
                ErrorCode::BrokerProtocol,
                format!("Exchange '{}' is not declared", exchange),
            ));
        }
        inner.queues.entry(queue.to_string()).or_default();
        inner
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .entry(routing_key.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        let mut inner = self.state.lock();
        if let Some(by_key) = inner.bindings.get_mut(exchange) {
            if let Some(queues) = by_key.get_mut(routing_key) {
                queues.remove(queue);
                if queues.is_empty() {
                    by_key.remove(routing_key);
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<(), DomainError> {
        self.ensure_open()?;
        if take_fault(&self.state.fail_publishes) {
            return Err(DomainError::broker_unavailable("Publish rejected (injected)"));
        }

        {
            let mut inner = self.state.lock();
            if !inner.exchanges.contains(exchange) {
                return Err(DomainError::new(
                    ErrorCode::BrokerProtocol,
                    format!("Exchange '{}' is not declared", exchange),
                ));
            }

            let targets: Vec<String> = inner
                .bindings
                .get(exchange)
                .and_then(|by_key| by_key.get(&message.routing_key))
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default();

            // Unroutable messages are dropped, like a topic exchange without a match.
            for queue in targets {
                inner.queues.entry(queue).or_default().push_back(StoredMessage {
                    message: message.clone(),
                    redelivered: false,
                });
            }
            let limit = inner.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
            inner.published.push_back((exchange.to_string(), message));
            while inner.published.len() > limit {
                inner.published.pop_front();
            }
        }

        self.state.delivered.notify_waiters();
        Ok(())
    }

    async fn next_delivery(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, DomainError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before checking so a concurrent publish cannot be missed.
            let notified = self.state.delivered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if take_fault(&self.state.fail_receives) {
                return Err(DomainError::channel_closed("Consumer channel dropped (injected)"));
            }
            if let Some(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), DomainError> {
        self.ensure_open()?;
        self.settle(delivery).map(|_| ())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), DomainError> {
        self.ensure_open()?;
        let mut unacked = self.settle(delivery)?;
        if requeue {
            unacked.message.redelivered = true;
            self.state
                .lock()
                .queues
                .entry(unacked.queue)
                .or_default()
                .push_front(unacked.message);
            self.state.delivered.notify_waiters();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DomainError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let id = self.id;
            self.state.lock().requeue_where(|u| u.channel_id == id);
            self.state.delivered.notify_waiters();
        }
        Ok(())
    }
}
