//! Typed handler support.
//!
//! Business code implements `IntegrationEventHandler<E>` against its own
//! event type; `TypedHandler` adapts it to the object-safe `EventHandler`
//! the dispatcher calls, and `TypedHandlerFactory` builds one per message.

use async_trait::async_trait;
use std::marker::PhantomData;

use crate::domain::foundation::{
    DomainError, HandlerId, IntegrationEvent, IntegrationEventType,
};
use crate::ports::{DecodedEvent, EventHandler, HandlerFactory};

/// Handler for one typed integration event.
///
/// # Example
///
/// ```ignore
/// struct ReserveStock { inventory: Arc<dyn Inventory> }
///
/// #[async_trait]
/// impl IntegrationEventHandler<OrderCreated> for ReserveStock {
///     async fn handle(&self, event: &OrderCreated, _: &IntegrationEvent) -> Result<(), DomainError> {
///         self.inventory.reserve(&event.order_id).await
///     }
///
///     fn name(&self) -> &'static str { "ReserveStock" }
/// }
/// ```
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEventType>: Send + Sync {
    /// `envelope` carries the id, timestamps and correlation metadata.
    async fn handle(&self, event: &E, envelope: &IntegrationEvent) -> Result<(), DomainError>;

    fn name(&self) -> &'static str;
}

/// Adapts an `IntegrationEventHandler<E>` to `EventHandler`.
pub struct TypedHandler<E, H> {
    inner: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> TypedHandler<E, H>
where
    E: IntegrationEventType,
    H: IntegrationEventHandler<E>,
{
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H> EventHandler for TypedHandler<E, H>
where
    E: IntegrationEventType,
    H: IntegrationEventHandler<E>,
{
    async fn handle(&self, event: &DecodedEvent) -> Result<(), DomainError> {
        let envelope = event.envelope();
        match event.downcast::<E>() {
            Some(typed) => self.inner.handle(typed, envelope).await,
            // Decoded under another registration; fall back to the raw payload.
            None => {
                let typed: E = envelope.payload_as()?;
                self.inner.handle(&typed, envelope).await
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Builds a fresh `TypedHandler` per message from a constructor closure.
pub struct TypedHandlerFactory<E, H, F> {
    handler_id: HandlerId,
    make: F,
    _types: PhantomData<fn() -> (E, H)>,
}

impl<E, H, F> TypedHandlerFactory<E, H, F>
where
    E: IntegrationEventType,
    H: IntegrationEventHandler<E> + 'static,
    F: Fn() -> H + Send + Sync,
{
    pub fn new(handler_id: HandlerId, make: F) -> Self {
        Self {
            handler_id,
            make,
            _types: PhantomData,
        }
    }
}

impl<E, H, F> HandlerFactory for TypedHandlerFactory<E, H, F>
where
    E: IntegrationEventType,
    H: IntegrationEventHandler<E> + 'static,
    F: Fn() -> H + Send + Sync,
{
    fn handler_id(&self) -> &HandlerId {
        &self.handler_id
    }

    fn create(&self) -> Result<Box<dyn EventHandler>, DomainError> {
        Ok(Box::new(TypedHandler::<E, H>::new((self.make)())))
    }
}
