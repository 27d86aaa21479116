//! OutboxCoordinator - Runs business work and event enqueueing atomically.
//!
//! ```text
//! begin ──► work(&mut UnitOfWork) ──► commit ──► publish each record
//!               │ Err                   │ Err        ├─ Ok  → mark_processed
//!               ▼                       ▼            └─ Err → mark_failed
//!            rollback               rollback
//! ```
//!
//! Once the commit succeeds the business change stands no matter what the
//! broker does. Records that could not be published stay in the outbox and
//! the `OutboxRelay` delivers them later.

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::domain::foundation::{DomainError, IntegrationEvent, IntegrationEventType, OutboxId};
use crate::domain::outbox::OutboxRecord;
use crate::ports::{EventPublisher, OutboxStore, TransactionalOutbox};

/// Handle given to the caller's work inside `run_with_outbox`.
pub struct UnitOfWork<S: TransactionalOutbox> {
    store: Arc<S>,
    tx: S::Transaction,
    pending: Vec<OutboxRecord>,
}

impl<S: TransactionalOutbox> UnitOfWork<S> {
    /// Adds `event` to the outbox inside the current transaction.
    pub async fn enqueue(&mut self, event: &IntegrationEvent) -> Result<OutboxId, DomainError> {
        let record = self.store.enqueue(&mut self.tx, event).await?;
        let id = record.id();
        self.pending.push(record);
        Ok(id)
    }

    pub async fn enqueue_typed<E: IntegrationEventType>(
        &mut self,
        event: &E,
    ) -> Result<OutboxId, DomainError> {
        let envelope = IntegrationEvent::from_typed(event)?;
        self.enqueue(&envelope).await
    }

    /// The open transaction, for business writes that must commit together
    /// with the enqueued events.
    pub fn transaction(&mut self) -> &mut S::Transaction {
        &mut self.tx
    }

    /// Records enqueued so far, in order.
    pub fn pending(&self) -> &[OutboxRecord] {
        &self.pending
    }
}

/// A record the coordinator could not publish right after commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPublish {
    pub id: OutboxId,
    pub event_type: String,
    pub error: String,
}

/// What happened to the records of one committed unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: Vec<OutboxId>,
    pub failed: Vec<FailedPublish>,
}

impl PublishReport {
    pub fn all_published(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of a successful `run_with_outbox`.
#[derive(Debug)]
pub struct Committed<T> {
    pub output: T,
    pub report: PublishReport,
}

/// Couples an outbox store with a publisher.
pub struct OutboxCoordinator<S: TransactionalOutbox> {
    store: Arc<S>,
    publisher: Arc<dyn EventPublisher>,
}

impl<S> OutboxCoordinator<S>
where
    S: TransactionalOutbox + 'static,
{
    pub fn new(store: Arc<S>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Runs `work` in a transaction, commits, then publishes what it enqueued.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let committed = coordinator
    ///     .run_with_outbox(|uow| async move {
    ///         orders.insert(uow.transaction(), &order).await?;
    ///         uow.enqueue_typed(&OrderCreated { order_id }).await?;
    ///         Ok(order_id)
    ///     }.boxed())
    ///     .await?;
    /// ```
    ///
    /// # Errors
    ///
    /// Errors from `begin`, `work` or `commit`. In every such case the
    /// transaction is rolled back and nothing is published. Publish failures
    /// after commit are reported in `Committed::report`, not as errors.
    pub async fn run_with_outbox<T, F>(&self, work: F) -> Result<Committed<T>, DomainError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut UnitOfWork<S>) -> BoxFuture<'a, Result<T, DomainError>> + Send,
    {
        let tx = self.store.begin().await?;
        let mut uow = UnitOfWork {
            store: self.store.clone(),
            tx,
            pending: Vec::new(),
        };

        let output = match work(&mut uow).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(error = %e, "Unit of work failed; rolling back");
                if let Err(rollback) = self.store.rollback(uow.tx).await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                return Err(e);
            }
        };

        let UnitOfWork { tx, pending, .. } = uow;
        if let Err(e) = self.store.commit(tx).await {
            tracing::error!(error = %e, records = pending.len(), "Outbox commit failed");
            return Err(e);
        }

        let report = self.publish_committed(&pending).await;
        Ok(Committed { output, report })
    }

    async fn publish_committed(&self, records: &[OutboxRecord]) -> PublishReport {
        let mut report = PublishReport::default();
        for record in records {
            match deliver(&*self.store, &*self.publisher, record).await {
                Ok(()) => report.published.push(record.id()),
                Err(error) => report.failed.push(FailedPublish {
                    id: record.id(),
                    event_type: record.event_type().to_string(),
                    error,
                }),
            }
        }
        report
    }
}

/// Publishes one record and records the outcome in the store.
///
/// Returns the publish error, if any. Failures to update the record are
/// logged only; the record then stays pending for the relay.
pub(crate) async fn deliver(
    store: &dyn OutboxStore,
    publisher: &dyn EventPublisher,
    record: &OutboxRecord,
) -> Result<(), String> {
    let published = match record.to_event() {
        Ok(event) => publisher.publish(&event).await,
        Err(e) => Err(e),
    };

    match published {
        Ok(()) => {
            if let Err(e) = store.mark_processed(record.id()).await {
                tracing::warn!(outbox_id = %record.id(), error = %e, "Failed to mark outbox record processed");
            }
            Ok(())
        }
        Err(publish_error) => {
            let message = publish_error.to_string();
            tracing::warn!(
                outbox_id = %record.id(),
                event_type = record.event_type(),
                error = %message,
                "Outbox record not published"
            );
            if let Err(e) = store.mark_failed(record.id(), &message).await {
                tracing::warn!(outbox_id = %record.id(), error = %e, "Failed to mark outbox record failed");
            }
            Err(message)
        }
    }
}
