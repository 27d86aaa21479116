//! OutboxStore port - Interface for transactional event persistence.
//!
//! This port implements the Transactional Outbox Pattern, which ensures
//! events are persisted in the same transaction as the business change they
//! describe, so no event is lost even if the process crashes before publish.
//!
//! ## Pattern Overview
//!
//! 1. Business code enqueues events inside its own DB transaction
//! 2. After commit, the coordinator publishes and marks each record
//! 3. The OutboxRelay sweeps records left Active or Failed by a crash or
//!    a broker outage

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, IntegrationEvent, OutboxId};
use crate::domain::outbox::OutboxRecord;

/// Read and lifecycle operations on the outbox table.
///
/// Object-safe so relays and coordinators can share one `Arc<dyn OutboxStore>`.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Records with status != Processed whose `next_retry_at` is null or
    /// has passed, oldest first, at most `batch_size`.
    async fn fetch_pending(&self, batch_size: u32) -> Result<Vec<OutboxRecord>, DomainError>;

    /// Sets status=Processed and processed_at=now. Calling it again is a no-op.
    async fn mark_processed(&self, id: OutboxId) -> Result<(), DomainError>;

    /// Increments retry_count, stores `error`, and schedules the next attempt
    /// with exponential backoff. Never deletes the record.
    async fn mark_failed(&self, id: OutboxId, error: &str) -> Result<OutboxRecord, DomainError>;

    /// Looks a record up by id.
    async fn find(&self, id: OutboxId) -> Result<Option<OutboxRecord>, DomainError>;
}

/// Outbox store that can take part in the caller's transaction.
///
/// # Example
///
/// ```ignore
/// let mut tx = store.begin().await?;
/// orders.insert(&mut tx, &order).await?;             // business write
/// store.enqueue(&mut tx, &order_created_event).await?; // same transaction
/// store.commit(tx).await?;
/// ```
#[async_trait]
pub trait TransactionalOutbox: OutboxStore {
    /// The transaction shared with ordinary business writes.
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction, DomainError>;

    /// Inserts one Active record inside `tx`. Publishes nothing.
    async fn enqueue(
        &self,
        tx: &mut Self::Transaction,
        event: &IntegrationEvent,
    ) -> Result<OutboxRecord, DomainError>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), DomainError>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), DomainError>;
}
