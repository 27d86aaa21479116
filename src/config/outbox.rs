//! Outbox relay configuration

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;
use crate::application::OutboxRelayConfig;
use crate::domain::retry::ExponentialBackoff;

/// Settings for the outbox sweep and record rescheduling
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    /// How often the relay looks for due records, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum records per sweep
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Backoff unit for `next_retry_at`, in milliseconds
    #[serde(default = "default_retry_unit_ms")]
    pub retry_unit_ms: u64,

    /// Longest delay between two attempts of one record, in milliseconds
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

impl OutboxConfig {
    pub fn relay_config(&self) -> OutboxRelayConfig {
        OutboxRelayConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_batch_size(self.batch_size)
    }

    /// Schedule used by `mark_failed`.
    pub fn retry_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(self.retry_unit_ms))
            .with_max_delay(Duration::from_millis(self.max_retry_delay_ms))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::InvalidInterval("poll_interval_ms"));
        }
        if self.batch_size == 0 || self.batch_size > 10_000 {
            return Err(ValidationError::InvalidBatchSize);
        }
        if self.retry_unit_ms == 0 {
            return Err(ValidationError::InvalidBackoff);
        }
        Ok(())
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            retry_unit_ms: default_retry_unit_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_batch_size() -> u32 {
    100
}

fn default_retry_unit_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    3_600_000
}
