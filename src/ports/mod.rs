//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the bus core and the outside world. Adapters implement these ports.
//!
//! ## Broker Ports
//!
//! - `BrokerConnector` / `BrokerConnection` / `BrokerChannel` - Transport
//! - `QueueBinder` - Topic binding used by the subscription registry
//!
//! ## Event Ports
//!
//! - `EventPublisher` - Port for publishing integration events
//! - `EventSubscriber` - Port for subscribing handler factories
//! - `EventHandler` / `HandlerFactory` - Per-message handler contract
//! - `ProcessedEventStore` - Idempotency tracking for event handlers
//!
//! ## Outbox Ports
//!
//! - `OutboxStore` - Pending/failed/processed record lifecycle
//! - `TransactionalOutbox` - Enqueue inside the caller's transaction

mod broker;
mod event_publisher;
mod event_subscriber;
mod outbox_store;
mod processed_event_store;

pub use broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConsumerTopology, Delivery,
    OutboundMessage, QueueBinder,
};
pub use event_publisher::EventPublisher;
pub use event_subscriber::{DecodedEvent, EventHandler, EventSubscriber, HandlerFactory};
pub use outbox_store::{OutboxStore, TransactionalOutbox};
pub use processed_event_store::ProcessedEventStore;
