//! Application layer - Services that drive the ports.
//!
//! - `ConnectionManager` owns the shared broker connection
//! - `BrokerPublisher` publishes with bounded retries
//! - `SubscriptionRegistry` and `EventTypeRegistry` describe what this
//!   process consumes
//! - `ConsumerDispatcher` runs the consume loop
//! - `OutboxCoordinator` and `OutboxRelay` implement the transactional outbox
//! - `EventBus` wires the broker side together

mod connection_manager;
mod coordinator;
mod dispatcher;
mod event_bus;
mod event_type_registry;
mod handler_factory;
mod outbox_relay;
mod publisher;
mod subscription_registry;

pub use connection_manager::ConnectionManager;
pub use coordinator::{Committed, FailedPublish, OutboxCoordinator, PublishReport, UnitOfWork};
pub use dispatcher::{
    ConsumerDispatcher, ConsumerDispatcherConfig, ConsumerState, DispatchOutcome, HandlerFailure,
    HandlerFailurePolicy,
};
pub use event_bus::EventBus;
pub use event_type_registry::EventTypeRegistry;
pub use handler_factory::{IntegrationEventHandler, TypedHandler, TypedHandlerFactory};
pub use outbox_relay::{OutboxRelay, OutboxRelayConfig, RelayBatch};
pub use publisher::BrokerPublisher;
pub use subscription_registry::SubscriptionRegistry;
