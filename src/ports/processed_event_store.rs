//! ProcessedEventStore port - Interface for tracking processed events.
//!
//! The broker delivers at least once: a consumer that crashes after handling
//! but before acking sees the message again. This store records which
//! handler already applied which event so redeliveries can be skipped.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, EventId, Timestamp};

/// Port for tracking which events have been processed by which handlers.
///
/// Each handler has its own processing record, allowing different handlers
/// to process the same event independently.
///
/// # Example
///
/// ```ignore
/// if store.contains(&event_id, "InventoryProjector").await? {
///     return Ok(()); // duplicate delivery
/// }
/// // ... handle ...
/// store.mark_processed(&event_id, "InventoryProjector").await?;
/// ```
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Returns `true` if the event has already been processed by this handler.
    async fn contains(&self, event_id: &EventId, handler_name: &str) -> Result<bool, DomainError>;

    /// Mark an event as processed by a specific handler.
    ///
    /// Called only after the handler succeeded.
    async fn mark_processed(&self, event_id: &EventId, handler_name: &str)
        -> Result<(), DomainError>;

    /// Removes entries recorded before `timestamp`. Returns how many were deleted.
    async fn delete_before(&self, timestamp: Timestamp) -> Result<u64, DomainError>;
}
