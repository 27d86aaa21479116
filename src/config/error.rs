//! Configuration error types

use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

/// Errors that can occur during configuration validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required configuration missing: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid database URL format")]
    InvalidDatabaseUrl,

    #[error("Pool max_connections must be at least 1")]
    InvalidPoolSize,

    #[error("Pool size exceeds maximum allowed (32)")]
    PoolSizeTooLarge,

    #[error("Invalid broker URL format")]
    InvalidBrokerUrl,

    #[error("Invalid {0} name: must be non-empty without whitespace")]
    InvalidName(&'static str),

    #[error("Publisher max_attempts must be at least 1")]
    InvalidRetryAttempts,

    #[error("Backoff unit must be greater than zero")]
    InvalidBackoff,

    #[error("Outbox batch_size must be between 1 and 10000")]
    InvalidBatchSize,

    #[error("Interval {0} must be greater than zero")]
    InvalidInterval(&'static str),

    #[error("Stream max length must be at least 1")]
    InvalidStreamMaxLen,

    #[error("Invalid log filter: {0}")]
    InvalidLogFilter(String),
}

/// Shared check for exchange, queue and consumer names.
pub(crate) fn validate_name(kind: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidName(kind));
    }
    Ok(())
}
