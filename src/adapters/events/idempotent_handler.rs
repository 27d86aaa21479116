//! IdempotentHandler - Wrapper for ensuring at-most-once event processing.
//!
//! This adapter wraps any `EventHandler` and uses a `ProcessedEventStore`
//! to ensure each event is processed at most once per handler, even though
//! the broker delivers at least once.
//!
//! ## Usage
//!
//! ```ignore
//! let factory = IdempotentHandlerFactory::new(
//!     Arc::new(inventory_factory),
//!     processed_event_store.clone(),
//! );
//!
//! registry.subscribe("order.created", Arc::new(factory)).await?;
//! ```
//!
//! ## How It Works
//!
//! 1. Before processing: Check if event was already processed by this handler
//! 2. If already processed: Skip and return Ok
//! 3. If not processed: Delegate to inner handler
//! 4. After successful handling: Mark event as processed
//!
//! ## Error Handling
//!
//! - If the inner handler fails, the event is NOT marked as processed
//! - This allows retry on the next delivery attempt
//! - ProcessedEventStore errors are propagated to the caller

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::foundation::{
    Clock, DomainError, EventId, HandlerId, SystemClock, Timestamp,
};
use crate::ports::{DecodedEvent, EventHandler, HandlerFactory, ProcessedEventStore};

/// Wrapper that ensures at-most-once event processing.
///
/// Decorates any `EventHandler` with idempotency tracking.
/// Uses the handler's `name()` as the idempotency key.
pub struct IdempotentHandler<H: EventHandler> {
    inner: H,
    processed_events: Arc<dyn ProcessedEventStore>,
}

impl<H: EventHandler> IdempotentHandler<H> {
    /// Create a new IdempotentHandler wrapping the given handler.
    pub fn new(inner: H, processed_events: Arc<dyn ProcessedEventStore>) -> Self {
        Self {
            inner,
            processed_events,
        }
    }
}

#[async_trait]
impl<H: EventHandler + 'static> EventHandler for IdempotentHandler<H> {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), DomainError> {
        let handler_name = self.inner.name();
        let event_id = event.envelope().id();

        if self
            .processed_events
            .contains(event_id, handler_name)
            .await?
        {
            tracing::debug!(event_id = %event_id, handler = handler_name, "Skipping duplicate event");
            return Ok(());
        }

        self.inner.handle(event).await?;

        // Mark as processed (only after successful handling)
        self.processed_events
            .mark_processed(event_id, handler_name)
            .await?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Factory decorator that wraps every handler it creates in an `IdempotentHandler`.
pub struct IdempotentHandlerFactory {
    inner: Arc<dyn HandlerFactory>,
    processed_events: Arc<dyn ProcessedEventStore>,
}

impl IdempotentHandlerFactory {
    pub fn new(inner: Arc<dyn HandlerFactory>, processed_events: Arc<dyn ProcessedEventStore>) -> Self {
        Self {
            inner,
            processed_events,
        }
    }
}

impl HandlerFactory for IdempotentHandlerFactory {
    fn handler_id(&self) -> &HandlerId {
        self.inner.handler_id()
    }

    fn create(&self) -> Result<Box<dyn EventHandler>, DomainError> {
        let handler = self.inner.create()?;
        Ok(Box::new(IdempotentHandler::new(
            handler,
            self.processed_events.clone(),
        )))
    }
}

/// In-memory `ProcessedEventStore`.
///
/// Suitable for a single process; entries are lost on restart.
pub struct InMemoryProcessedEventStore {
    processed: RwLock<HashMap<(String, String), Timestamp>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryProcessedEventStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            processed: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.processed.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processed.read().await.is_empty()
    }
}

impl Default for InMemoryProcessedEventStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(event_id: &EventId, handler_name: &str) -> (String, String) {
    (event_id.as_str().to_string(), handler_name.to_string())
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEventStore {
    async fn contains(&self, event_id: &EventId, handler_name: &str) -> Result<bool, DomainError> {
        Ok(self
            .processed
            .read()
            .await
            .contains_key(&key(event_id, handler_name)))
    }

    async fn mark_processed(
        &self,
        event_id: &EventId,
        handler_name: &str,
    ) -> Result<(), DomainError> {
        let now = self.clock.now();
        self.processed
            .write()
            .await
            .entry(key(event_id, handler_name))
            .or_insert(now);
        Ok(())
    }

    async fn delete_before(&self, timestamp: Timestamp) -> Result<u64, DomainError> {
        let mut processed = self.processed.write().await;
        let before = processed.len();
        processed.retain(|_, at| !at.is_before(&timestamp));
        Ok((before - processed.len()) as u64)
    }
}
