//! In-memory outbox store for testing.
//!
//! Transactions stage outbox records and deferred business writes; nothing
//! becomes visible until `commit`, and `rollback` discards both. This gives
//! tests the same atomicity contract a database-backed store provides.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::foundation::{
    Clock, DomainError, ErrorCode, IntegrationEvent, OutboxId, SystemClock,
};
use crate::domain::outbox::OutboxRecord;
use crate::domain::retry::ExponentialBackoff;
use crate::ports::{OutboxStore, TransactionalOutbox};

/// Pending changes of one in-memory transaction.
#[derive(Default)]
pub struct InMemoryOutboxTransaction {
    staged: Vec<OutboxRecord>,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
}

impl InMemoryOutboxTransaction {
    /// Registers a business write to apply only if the transaction commits.
    pub fn defer(&mut self, write: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(write));
    }

    /// Outbox records enqueued so far.
    pub fn staged(&self) -> &[OutboxRecord] {
        &self.staged
    }
}

impl std::fmt::Debug for InMemoryOutboxTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxTransaction")
            .field("staged", &self.staged.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

/// In-memory outbox store.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryOutboxStore::new());
/// let mut tx = store.begin().await?;
/// store.enqueue(&mut tx, &event).await?;
/// store.commit(tx).await?;
/// assert_eq!(store.len().await, 1);
/// ```
pub struct InMemoryOutboxStore {
    records: RwLock<Vec<OutboxRecord>>,
    clock: Arc<dyn Clock>,
    backoff: ExponentialBackoff,
    fail_commits: AtomicU32,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), ExponentialBackoff::default())
    }

    pub fn with_clock(clock: Arc<dyn Clock>, backoff: ExponentialBackoff) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            clock,
            backoff,
            fail_commits: AtomicU32::new(0),
        }
    }

    // === Test Helpers ===

    /// The next `n` commits fail with `DatabaseError` and discard the transaction.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Every committed record in insertion order.
    pub async fn all(&self) -> Vec<OutboxRecord> {
        self.records.read().await.clone()
    }

    /// Stores `record` as if a transaction had committed it.
    pub async fn insert_committed(&self, record: OutboxRecord) {
        self.records.write().await.push(record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn not_found(id: OutboxId) -> DomainError {
        DomainError::new(
            ErrorCode::RecordNotFound,
            format!("Outbox record not found: {}", id),
        )
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn fetch_pending(&self, batch_size: u32) -> Result<Vec<OutboxRecord>, DomainError> {
        let now = self.clock.now();
        let records = self.records.read().await;

        let mut due: Vec<&OutboxRecord> = records.iter().filter(|r| r.is_due(now)).collect();
        // Stable sort keeps insertion order for equal timestamps.
        due.sort_by_key(|r| r.created_at());

        Ok(due
            .into_iter()
            .take(batch_size as usize)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, id: OutboxId) -> Result<(), DomainError> {
        let now = self.clock.now();
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| Self::not_found(id))?;

        record.mark_processed(now);
        Ok(())
    }

    async fn mark_failed(&self, id: OutboxId, error: &str) -> Result<OutboxRecord, DomainError> {
        let now = self.clock.now();
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| Self::not_found(id))?;

        record.mark_failed(error, now, &self.backoff)?;
        Ok(record.clone())
    }

    async fn find(&self, id: OutboxId) -> Result<Option<OutboxRecord>, DomainError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.id() == id)
            .cloned())
    }
}

#[async_trait]
impl TransactionalOutbox for InMemoryOutboxStore {
    type Transaction = InMemoryOutboxTransaction;

    async fn begin(&self) -> Result<Self::Transaction, DomainError> {
        Ok(InMemoryOutboxTransaction::default())
    }

    async fn enqueue(
        &self,
        tx: &mut Self::Transaction,
        event: &IntegrationEvent,
    ) -> Result<OutboxRecord, DomainError> {
        let record = OutboxRecord::for_event(event, self.clock.now())?;
        tx.staged.push(record.clone());
        Ok(record)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), DomainError> {
        let injected = self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DomainError::database("Commit failed (injected)"));
        }

        let mut records = self.records.write().await;
        records.extend(tx.staged);
        for write in tx.deferred {
            write();
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), DomainError> {
        drop(tx);
        Ok(())
    }
}
