//! OutboxRecord - the durable unit of the transactional outbox.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::foundation::{
    DomainError, ErrorCode, IntegrationEvent, OutboxId, StateMachine, Timestamp,
};
use crate::domain::retry::ExponentialBackoff;

/// Lifecycle status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Written, never attempted or not yet attempted since commit.
    Active,
    /// Published to the broker. Terminal.
    Processed,
    /// Last publish attempt failed; eligible again once `next_retry_at` passes.
    Failed,
}

impl OutboxStatus {
    /// Column value used by persistent stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Active => "active",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s.to_lowercase().as_str() {
            "active" => Ok(OutboxStatus::Active),
            "processed" => Ok(OutboxStatus::Processed),
            "failed" => Ok(OutboxStatus::Failed),
            _ => Err(DomainError::new(
                ErrorCode::DatabaseError,
                format!("Invalid outbox status value: {}", s),
            )),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StateMachine for OutboxStatus {
    fn can_transition_to(&self, target: &Self) -> bool {
        use OutboxStatus::*;
        matches!(
            (self, target),
            (Active, Processed) | (Active, Failed) | (Failed, Failed) | (Failed, Processed)
        )
    }

    fn valid_transitions(&self) -> Vec<Self> {
        use OutboxStatus::*;
        match self {
            Active => vec![Processed, Failed],
            Failed => vec![Failed, Processed],
            Processed => vec![],
        }
    }
}

/// A pending, failed, or processed event in the outbox table.
///
/// Invariants:
/// - `processed_at` is set iff `status == Processed`
/// - `retry_count` never decreases
/// - every `mark_failed` strictly increases `next_retry_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    id: OutboxId,
    event_type: String,
    aggregate_id: String,
    event_data: String,
    status: OutboxStatus,
    created_at: Timestamp,
    processed_at: Option<Timestamp>,
    next_retry_at: Option<Timestamp>,
    retry_count: u32,
    error_message: Option<String>,
}

impl OutboxRecord {
    /// Creates an Active record holding the serialized event.
    pub fn for_event(event: &IntegrationEvent, now: Timestamp) -> Result<Self, DomainError> {
        Ok(Self {
            id: OutboxId::new(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            event_data: event.to_json()?,
            status: OutboxStatus::Active,
            created_at: now,
            processed_at: None,
            next_retry_at: None,
            retry_count: 0,
            error_message: None,
        })
    }

    /// Rebuilds a record read back from storage, checking its invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: OutboxId,
        event_type: String,
        aggregate_id: String,
        event_data: String,
        status: OutboxStatus,
        created_at: Timestamp,
        processed_at: Option<Timestamp>,
        next_retry_at: Option<Timestamp>,
        retry_count: u32,
        error_message: Option<String>,
    ) -> Result<Self, DomainError> {
        if processed_at.is_some() != (status == OutboxStatus::Processed) {
            return Err(DomainError::new(
                ErrorCode::DatabaseError,
                format!("Outbox record {} has processed_at inconsistent with status {}", id, status),
            ));
        }

        Ok(Self {
            id,
            event_type,
            aggregate_id,
            event_data,
            status,
            created_at,
            processed_at,
            next_retry_at,
            retry_count,
            error_message,
        })
    }

    pub fn id(&self) -> OutboxId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event_data(&self) -> &str {
        &self.event_data
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn processed_at(&self) -> Option<Timestamp> {
        self.processed_at
    }

    pub fn next_retry_at(&self) -> Option<Timestamp> {
        self.next_retry_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// True when a sweep may attempt this record at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status != OutboxStatus::Processed
            && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Reconstructs the event this record carries.
    pub fn to_event(&self) -> Result<IntegrationEvent, DomainError> {
        IntegrationEvent::from_json(&self.event_data)
    }

    /// Marks the record processed.
    ///
    /// Returns `false` (and changes nothing) if it was already processed.
    pub fn mark_processed(&mut self, now: Timestamp) -> bool {
        if self.status == OutboxStatus::Processed {
            return false;
        }
        self.status = OutboxStatus::Processed;
        self.processed_at = Some(now);
        true
    }

    /// Records a failed publish attempt and schedules the next one at
    /// `now + backoff(retry_count)`.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` if the record is already processed.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: Timestamp,
        backoff: &ExponentialBackoff,
    ) -> Result<(), DomainError> {
        self.status = self
            .status
            .transition_to(OutboxStatus::Failed)
            .map_err(|e| DomainError::new(ErrorCode::InvalidStateTransition, e.to_string()))?;

        self.retry_count = self.retry_count.saturating_add(1);
        self.error_message = Some(error.into());

        let mut next = now.saturating_add(backoff.delay_for(self.retry_count));
        // Strictly increasing even when the cap or a frozen clock would repeat a value.
        if let Some(previous) = self.next_retry_at {
            if next <= previous {
                next = previous.plus_millis(1);
            }
        }
        self.next_retry_at = Some(next);
        Ok(())
    }
}
