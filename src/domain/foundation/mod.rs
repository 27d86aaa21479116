//! Foundation module - Shared domain primitives.
//!
//! Contains value objects, identifiers, events, clocks, and error types
//! that form the vocabulary of the outbox bus.

mod clock;
mod errors;
mod events;
mod ids;
mod state_machine;
mod timestamp;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{DomainError, ErrorCode, ValidationError};
pub use events::{EventId, EventMetadata, IntegrationEvent, IntegrationEventType};
pub use ids::{HandlerId, OutboxId};
pub use state_machine::StateMachine;
pub use timestamp::Timestamp;
