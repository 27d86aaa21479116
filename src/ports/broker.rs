//! Broker ports - Interfaces for the message broker transport.
//!
//! The bus speaks to the broker in terms of exchanges, queues, and routing
//! keys. Adapters map these onto a concrete transport (in-memory for tests,
//! Redis Streams in production).
//!
//! ## Object Model
//!
//! - `BrokerConnector` - Opens connections (one long-lived per process)
//! - `BrokerConnection` - A live connection that hands out channels
//! - `BrokerChannel` - Cheap logical session for declare/publish/consume
//! - `QueueBinder` - Narrow port the subscription registry uses to bind topics

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::foundation::{DomainError, Timestamp};

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Routing key - the event type name.
    pub routing_key: String,

    /// UTF-8 serialized event.
    pub body: String,

    /// Ask the broker to retain the message across a broker restart.
    pub persistent: bool,

    /// Message id for broker-side dedupe and tracing (the event id).
    pub message_id: String,
}

impl OutboundMessage {
    /// Creates a persistent message. The bus never publishes transient ones.
    pub fn persistent(
        routing_key: impl Into<String>,
        body: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            persistent: true,
            message_id: message_id.into(),
        }
    }
}

/// A message received from a queue, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque token identifying this delivery to the channel that produced it.
    pub delivery_tag: String,
    pub routing_key: String,
    pub body: String,
    pub message_id: String,
    /// True if the broker delivered this message before without an ack.
    pub redelivered: bool,
    pub received_at: Timestamp,
}

/// Exchange + queue a consumer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerTopology {
    pub exchange: String,
    pub queue: String,
}

impl ConsumerTopology {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
        }
    }
}

/// Opens connections to the broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Establish a new connection.
    ///
    /// Failures are `BrokerUnavailable` so callers can retry with backoff.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, DomainError>;
}

/// A live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// False once the broker or the socket has dropped the connection.
    fn is_open(&self) -> bool;

    /// Opens a new logical channel.
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, DomainError>;

    /// Closes the connection and every channel on it.
    async fn close(&self) -> Result<(), DomainError>;
}

/// A logical channel on a connection.
///
/// All declare/bind operations are idempotent.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), DomainError>;

    async fn declare_queue(&self, queue: &str) -> Result<(), DomainError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DomainError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DomainError>;

    /// Publishes to an exchange. Returns once the broker accepted the message.
    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<(), DomainError>;

    /// Waits up to `wait` for the next message on `queue`.
    ///
    /// `Ok(None)` means nothing arrived in time. A transport failure is
    /// reported as `ChannelClosed` or `BrokerUnavailable`.
    async fn next_delivery(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, DomainError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), DomainError>;

    /// Rejects a delivery, optionally putting it back on the queue.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), DomainError>;

    async fn close(&self) -> Result<(), DomainError>;
}

/// Port for binding and unbinding the inbound queue to routing keys.
#[async_trait]
pub trait QueueBinder: Send + Sync {
    async fn bind(&self, routing_key: &str) -> Result<(), DomainError>;

    async fn unbind(&self, routing_key: &str) -> Result<(), DomainError>;
}
