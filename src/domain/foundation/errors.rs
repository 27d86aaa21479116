//! Error types for the domain layer.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use thiserror::Error;

/// Errors that occur during value object construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Field '{field}' cannot be empty")]
    EmptyField { field: String },

    #[error("Field '{field}' has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    /// Creates an empty field validation error.
    pub fn empty_field(field: impl Into<String>) -> Self {
        ValidationError::EmptyField { field: field.into() }
    }

    /// Creates an invalid format validation error.
    pub fn invalid_format(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFormat {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Error codes organized by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Validation errors
    ValidationFailed,
    InvalidStateTransition,

    // Transport errors (transient)
    BrokerUnavailable,
    ChannelClosed,

    // Transport errors (permanent)
    BrokerProtocol,
    PublishRetriesExhausted,
    Cancelled,

    // Serialization errors
    SerializationFailed,
    UnknownEventType,

    // Persistence errors
    DatabaseError,
    RecordNotFound,

    // Consumer errors
    HandlerFailed,

    InternalError,
}

impl ErrorCode {
    /// Transient codes are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCode::BrokerUnavailable | ErrorCode::ChannelClosed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorCode::BrokerUnavailable => "BROKER_UNAVAILABLE",
            ErrorCode::ChannelClosed => "CHANNEL_CLOSED",
            ErrorCode::BrokerProtocol => "BROKER_PROTOCOL",
            ErrorCode::PublishRetriesExhausted => "PUBLISH_RETRIES_EXHAUSTED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::SerializationFailed => "SERIALIZATION_FAILED",
            ErrorCode::UnknownEventType => "UNKNOWN_EVENT_TYPE",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::RecordNotFound => "RECORD_NOT_FOUND",
            ErrorCode::HandlerFailed => "HANDLER_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Standard domain error with code, message, and optional details.
#[derive(Debug, Clone)]
pub struct DomainError {
    pub code: ErrorCode,
    pub message: String,
    pub details: HashMap<String, String>,
}

impl DomainError {
    /// Creates a new domain error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    /// Creates a validation error for a specific field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message).with_detail("field", field.into())
    }

    /// Broker could not be reached or the socket failed.
    pub fn broker_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BrokerUnavailable, message)
    }

    /// A channel was closed underneath the caller.
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ChannelClosed, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializationFailed, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Adds a detail to the error.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Returns true when the failure is a transient transport error.
    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for DomainError {}

impl From<ValidationError> for DomainError {
    fn from(err: ValidationError) -> Self {
        DomainError::new(ErrorCode::ValidationFailed, err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_empty_field_displays_correctly() {
        let err = ValidationError::empty_field("event_type");
        assert_eq!(format!("{}", err), "Field 'event_type' cannot be empty");
    }

    #[test]
    fn validation_error_invalid_format_displays_correctly() {
        let err = ValidationError::invalid_format("handler_id", "contains whitespace");
        assert_eq!(
            format!("{}", err),
            "Field 'handler_id' has invalid format: contains whitespace"
        );
    }

    #[test]
    fn domain_error_displays_code_and_message() {
        let err = DomainError::new(ErrorCode::RecordNotFound, "Outbox record not found");
        assert_eq!(format!("{}", err), "[RECORD_NOT_FOUND] Outbox record not found");
    }

    #[test]
    fn domain_error_with_detail_adds_detail() {
        let err = DomainError::new(ErrorCode::HandlerFailed, "Handler failed")
            .with_detail("handler", "InventoryProjector")
            .with_detail("event_type", "order.created");

        assert_eq!(err.details.get("handler"), Some(&"InventoryProjector".to_string()));
        assert_eq!(err.details.get("event_type"), Some(&"order.created".to_string()));
    }

    #[test]
    fn only_transport_codes_are_transient() {
        assert!(DomainError::broker_unavailable("down").is_transient());
        assert!(DomainError::channel_closed("closed").is_transient());
        assert!(!DomainError::serialization("bad json").is_transient());
        assert!(!DomainError::database("deadlock").is_transient());
        assert!(!DomainError::new(ErrorCode::PublishRetriesExhausted, "gave up").is_transient());
    }

    #[test]
    fn serde_error_converts_to_serialization_failure() {
        let err: DomainError = serde_json::from_str::<u32>("not-a-number").unwrap_err().into();
        assert_eq!(err.code, ErrorCode::SerializationFailed);
    }
}
