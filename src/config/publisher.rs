//! Publisher retry configuration

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;
use crate::domain::retry::{ExponentialBackoff, RetryPolicy};

/// Retry settings for publishing to the broker
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Total attempts per publish, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit in milliseconds; attempt n waits `unit * 2^n`
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,

    /// Upper bound of a single backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl PublisherConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            ExponentialBackoff::new(Duration::from_millis(self.backoff_unit_ms))
                .with_max_delay(Duration::from_millis(self.max_backoff_ms)),
        )
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidRetryAttempts);
        }
        if self.backoff_unit_ms == 0 {
            return Err(ValidationError::InvalidBackoff);
        }
        Ok(())
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_unit_ms: default_backoff_unit_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}
