//! EventPublisher port - Interface for publishing integration events.
//!
//! This port defines how events leave the process without the caller knowing
//! about the broker, channels, or retry policy behind it.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, IntegrationEvent};

/// Port for publishing integration events.
///
/// Implementations must ensure:
/// - Messages are marked for persistent delivery
/// - Transient transport errors are retried internally with backoff
/// - Exhausted retries and non-transient errors are returned to the caller
///
/// # Example
///
/// ```ignore
/// let event = IntegrationEvent::from_typed(&OrderCreated { order_id: 1 })?;
/// publisher.publish(&event).await?;
/// ```
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: &IntegrationEvent) -> Result<(), DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time check that trait is object-safe
    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn EventPublisher) {}
}
