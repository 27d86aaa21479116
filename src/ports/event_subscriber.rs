//! EventSubscriber port - Interface for subscribing to integration events.
//!
//! This port defines how handlers register interest in event types
//! without knowing about the underlying transport mechanism.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::domain::foundation::{DomainError, HandlerId, IntegrationEvent};

/// An event whose payload has been decoded into its concrete type.
///
/// The typed value is produced by the decoder registered for the event type
/// and shared read-only between all handlers of one delivery.
#[derive(Clone)]
pub struct DecodedEvent {
    envelope: IntegrationEvent,
    typed: Arc<dyn Any + Send + Sync>,
}

impl DecodedEvent {
    pub fn new(envelope: IntegrationEvent, typed: Arc<dyn Any + Send + Sync>) -> Self {
        Self { envelope, typed }
    }

    pub fn envelope(&self) -> &IntegrationEvent {
        &self.envelope
    }

    /// Borrows the typed payload if it is an `E`.
    pub fn downcast<E: Any>(&self) -> Option<&E> {
        self.typed.downcast_ref::<E>()
    }
}

impl std::fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedEvent")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Handler for processing integration events.
///
/// Implementations should be:
/// - **Idempotent** - The broker may deliver the same event twice
/// - **Quick** - The consume loop waits for every handler of a message
/// - **Isolated** - Errors don't affect other handlers
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process an event.
    async fn handle(&self, event: &DecodedEvent) -> Result<(), DomainError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Box<H> {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), DomainError> {
        (**self).handle(event).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Creates a fresh handler instance for every delivered message.
///
/// The dispatcher never reuses an instance across messages, so handler state
/// cannot leak between deliveries. How the factory builds its handlers
/// (shared pools, per-call resources) is up to the caller.
pub trait HandlerFactory: Send + Sync {
    /// Stable identity used to dedupe subscriptions.
    fn handler_id(&self) -> &HandlerId;

    fn create(&self) -> Result<Box<dyn EventHandler>, DomainError>;
}

/// Port for registering interest in event types.
///
/// # Example
///
/// ```ignore
/// subscriber.subscribe("order.created", Arc::new(inventory_factory)).await?;
/// subscriber.unsubscribe("order.created", &inventory_id).await?;
/// ```
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Subscribe a handler factory to an event type.
    ///
    /// Subscribing the same handler id twice is a no-op.
    async fn subscribe(
        &self,
        event_type: &str,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<(), DomainError>;

    /// Remove a handler from an event type.
    async fn unsubscribe(&self, event_type: &str, handler_id: &HandlerId)
        -> Result<(), DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Compile-time check that traits are object-safe
    #[allow(dead_code)]
    fn assert_handler_object_safe(_: &dyn EventHandler) {}

    #[allow(dead_code)]
    fn assert_factory_object_safe(_: &dyn HandlerFactory) {}

    #[allow(dead_code)]
    fn assert_subscriber_object_safe(_: &dyn EventSubscriber) {}

    #[test]
    fn downcast_returns_typed_payload_only_for_matching_type() {
        let envelope = IntegrationEvent::new("count.changed", "c-1", json!(3)).unwrap();
        let decoded = DecodedEvent::new(envelope, Arc::new(3u32));

        assert_eq!(decoded.downcast::<u32>(), Some(&3));
        assert!(decoded.downcast::<String>().is_none());
        assert_eq!(decoded.envelope().event_type(), "count.changed");
    }
}
