//! Consumer dispatcher configuration

use serde::Deserialize;
use std::time::Duration;

use super::error::{validate_name, ValidationError};
use crate::application::{ConsumerDispatcherConfig, HandlerFailurePolicy};
use crate::domain::retry::ExponentialBackoff;

/// Settings of the consume loop
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Longest a receive blocks before checking for shutdown, in milliseconds
    #[serde(default = "default_receive_wait_ms")]
    pub receive_wait_ms: u64,

    /// First delay between channel recovery attempts, in milliseconds
    #[serde(default = "default_recovery_unit_ms")]
    pub recovery_unit_ms: u64,

    /// Longest delay between channel recovery attempts, in milliseconds
    #[serde(default = "default_max_recovery_delay_ms")]
    pub max_recovery_delay_ms: u64,

    /// `acknowledge`, `requeue` or `dead_letter`
    #[serde(default)]
    pub failure_policy: HandlerFailurePolicy,

    #[serde(default = "default_dead_letter_exchange")]
    pub dead_letter_exchange: String,
}

impl DispatcherConfig {
    pub fn dispatcher_config(&self) -> ConsumerDispatcherConfig {
        ConsumerDispatcherConfig::default()
            .with_receive_wait(Duration::from_millis(self.receive_wait_ms))
            .with_recovery_backoff(
                ExponentialBackoff::new(Duration::from_millis(self.recovery_unit_ms))
                    .with_max_delay(Duration::from_millis(self.max_recovery_delay_ms)),
            )
            .with_failure_policy(self.failure_policy)
            .with_dead_letter_exchange(&self.dead_letter_exchange)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.receive_wait_ms == 0 {
            return Err(ValidationError::InvalidInterval("receive_wait_ms"));
        }
        if self.recovery_unit_ms == 0 {
            return Err(ValidationError::InvalidBackoff);
        }
        if self.failure_policy == HandlerFailurePolicy::DeadLetter {
            validate_name("dead-letter exchange", &self.dead_letter_exchange)?;
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            receive_wait_ms: default_receive_wait_ms(),
            recovery_unit_ms: default_recovery_unit_ms(),
            max_recovery_delay_ms: default_max_recovery_delay_ms(),
            failure_policy: HandlerFailurePolicy::default(),
            dead_letter_exchange: default_dead_letter_exchange(),
        }
    }
}

fn default_receive_wait_ms() -> u64 {
    1000
}

fn default_recovery_unit_ms() -> u64 {
    100
}

fn default_max_recovery_delay_ms() -> u64 {
    30_000
}

fn default_dead_letter_exchange() -> String {
    "bus.dead-letter".to_string()
}
