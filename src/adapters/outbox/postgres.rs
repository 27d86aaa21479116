//! PostgreSQL implementation of the outbox store.
//!
//! Records live in `outbox_messages` (see `migrations/`). `enqueue` runs
//! inside the caller's `sqlx::Transaction`, so the outbox row commits or
//! rolls back together with the business rows written on the same
//! transaction.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;

use crate::domain::foundation::{
    Clock, DomainError, ErrorCode, IntegrationEvent, OutboxId, SystemClock, Timestamp,
};
use crate::domain::outbox::{OutboxRecord, OutboxStatus};
use crate::domain::retry::ExponentialBackoff;
use crate::ports::{OutboxStore, TransactionalOutbox};

const SELECT_COLUMNS: &str = r#"
    id, event_type, aggregate_id, event_data, status,
    created_at, processed_at, next_retry_at, retry_count, error_message
"#;

/// PostgreSQL implementation of `TransactionalOutbox`.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    backoff: ExponentialBackoff,
}

impl PostgresOutboxStore {
    /// Creates a new PostgresOutboxStore.
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock), ExponentialBackoff::default())
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>, backoff: ExponentialBackoff) -> Self {
        Self {
            pool,
            clock,
            backoff,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(context: &str, e: sqlx::Error) -> DomainError {
    DomainError::new(ErrorCode::DatabaseError, format!("{}: {}", context, e))
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn fetch_pending(&self, batch_size: u32) -> Result<Vec<OutboxRecord>, DomainError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM outbox_messages
            WHERE status <> 'processed'
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            SELECT_COLUMNS
        ))
        .bind(*self.clock.now().as_datetime())
        .bind(i64::from(batch_size))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch pending outbox records", e))?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn mark_processed(&self, id: OutboxId) -> Result<(), DomainError> {
        // The status guard keeps the first processed_at on repeated calls.
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'processed', processed_at = $2
            WHERE id = $1 AND status <> 'processed'
            "#,
        )
        .bind(id.as_uuid())
        .bind(*self.clock.now().as_datetime())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark outbox record processed", e))?;

        if result.rows_affected() == 0 && self.find(id).await?.is_none() {
            return Err(DomainError::new(
                ErrorCode::RecordNotFound,
                format!("Outbox record not found: {}", id),
            ));
        }

        Ok(())
    }

    async fn mark_failed(&self, id: OutboxId, error: &str) -> Result<OutboxRecord, DomainError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM outbox_messages WHERE id = $1 FOR UPDATE",
            SELECT_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to lock outbox record", e))?
        .ok_or_else(|| {
            DomainError::new(
                ErrorCode::RecordNotFound,
                format!("Outbox record not found: {}", id),
            )
        })?;

        let mut record = row_to_record(row)?;
        record.mark_failed(error, self.clock.now(), &self.backoff)?;

        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = $2, retry_count = $3, next_retry_at = $4, error_message = $5
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(record.status().as_str())
        .bind(i32::try_from(record.retry_count()).unwrap_or(i32::MAX))
        .bind(record.next_retry_at().map(|t| *t.as_datetime()))
        .bind(record.error_message())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to mark outbox record failed", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit outbox update", e))?;

        Ok(record)
    }

    async fn find(&self, id: OutboxId) -> Result<Option<OutboxRecord>, DomainError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM outbox_messages WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch outbox record", e))?;

        row.map(row_to_record).transpose()
    }
}

#[async_trait]
impl TransactionalOutbox for PostgresOutboxStore {
    type Transaction = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction, DomainError> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))
    }

    async fn enqueue(
        &self,
        tx: &mut Self::Transaction,
        event: &IntegrationEvent,
    ) -> Result<OutboxRecord, DomainError> {
        let record = OutboxRecord::for_event(event, self.clock.now())?;

        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, event_type, aggregate_id, event_data, status, created_at, retry_count
            ) VALUES ($1, $2, $3, $4, $5, $6, 0)
            "#,
        )
        .bind(record.id().as_uuid())
        .bind(record.event_type())
        .bind(record.aggregate_id())
        .bind(record.event_data())
        .bind(record.status().as_str())
        .bind(*record.created_at().as_datetime())
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to insert outbox record", e))?;

        Ok(record)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), DomainError> {
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), DomainError> {
        tx.rollback()
            .await
            .map_err(|e| db_error("Failed to roll back transaction", e))
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, DomainError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(|e| {
        DomainError::new(
            ErrorCode::DatabaseError,
            format!("Failed to get {}: {}", name, e),
        )
    })
}

fn row_to_record(row: PgRow) -> Result<OutboxRecord, DomainError> {
    let id: uuid::Uuid = column(&row, "id")?;
    let status: String = column(&row, "status")?;
    let created_at: chrono::DateTime<chrono::Utc> = column(&row, "created_at")?;
    let processed_at: Option<chrono::DateTime<chrono::Utc>> = column(&row, "processed_at")?;
    let next_retry_at: Option<chrono::DateTime<chrono::Utc>> = column(&row, "next_retry_at")?;
    let retry_count: i32 = column(&row, "retry_count")?;

    OutboxRecord::restore(
        OutboxId::from_uuid(id),
        column(&row, "event_type")?,
        column(&row, "aggregate_id")?,
        column(&row, "event_data")?,
        OutboxStatus::parse(&status)?,
        Timestamp::from_datetime(created_at),
        processed_at.map(Timestamp::from_datetime),
        next_retry_at.map(Timestamp::from_datetime),
        u32::try_from(retry_count).unwrap_or(0),
        column(&row, "error_message")?,
    )
}
