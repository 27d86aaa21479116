//! Integration event types.
//!
//! This module provides the core types for cross-service events:
//! - `EventId` - Unique identifier for events (deduplication)
//! - `EventMetadata` - Tracing and correlation context
//! - `IntegrationEvent` - Immutable transport record of something that happened
//! - `IntegrationEventType` - Trait implemented by typed event payloads
//! - `integration_event!` - Macro to simplify `IntegrationEventType` implementations

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use super::{DomainError, Timestamp, ValidationError};

/// Trait implemented by every typed integration event payload.
///
/// `EVENT_TYPE` is the routing key on the broker and the key of the
/// decoder registered in the `EventTypeRegistry`.
pub trait IntegrationEventType: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical type name, e.g. "order.created".
    const EVENT_TYPE: &'static str;

    /// ID of the aggregate this event concerns.
    fn aggregate_id(&self) -> String;
}

/// Macro to implement `IntegrationEventType` with minimal boilerplate.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct OrderCreated {
///     pub order_id: u64,
///     pub total_cents: i64,
/// }
///
/// integration_event!(OrderCreated, event_type = "order.created", aggregate_id = order_id);
/// ```
#[macro_export]
macro_rules! integration_event {
    (
        $event_name:ident,
        event_type = $event_type:expr,
        aggregate_id = $agg_id_field:ident
    ) => {
        impl $crate::domain::foundation::IntegrationEventType for $event_name {
            const EVENT_TYPE: &'static str = $event_type;

            fn aggregate_id(&self) -> String {
                self.$agg_id_field.to_string()
            }
        }
    };
}

/// Unique identifier for events (used for deduplication).
///
/// Uses a String internally so ids minted by other services in other
/// formats survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates a new random EventId using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates an EventId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the inner string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata for tracing and correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// ID linking related events across a single request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// ID of the event that directly caused this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

/// Immutable record that something happened, ready to cross a process boundary.
///
/// Identity is the `EventId`: two events with the same id are equal no matter
/// what else they carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationEvent {
    id: EventId,
    event_type: String,
    aggregate_id: String,
    created_at: Timestamp,
    payload: JsonValue,
    #[serde(default)]
    metadata: EventMetadata,
}

impl IntegrationEvent {
    /// Creates a new event with a fresh id and the current time.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: JsonValue,
    ) -> Result<Self, ValidationError> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(ValidationError::empty_field("event_type"));
        }

        Ok(Self {
            id: EventId::new(),
            event_type,
            aggregate_id: aggregate_id.into(),
            created_at: Timestamp::now(),
            payload,
            metadata: EventMetadata::default(),
        })
    }

    /// Creates an event from a typed payload.
    ///
    /// # Errors
    ///
    /// Returns `SerializationFailed` if the payload cannot be turned into JSON.
    pub fn from_typed<E: IntegrationEventType>(event: &E) -> Result<Self, DomainError> {
        let payload = serde_json::to_value(event)?;
        Ok(Self::new(E::EVENT_TYPE, event.aggregate_id(), payload)?)
    }

    /// Add correlation ID for request tracing.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    /// Add causation ID (ID of event that caused this one).
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.causation_id = Some(id.into());
        self
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    /// Deserialize payload to a specific event type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Serializes the whole event as the UTF-8 wire body.
    pub fn to_json(&self) -> Result<String, DomainError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an event previously produced by `to_json`.
    pub fn from_json(body: &str) -> Result<Self, DomainError> {
        Ok(serde_json::from_str(body)?)
    }
}

impl PartialEq for IntegrationEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for IntegrationEvent {}

impl Hash for IntegrationEvent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
