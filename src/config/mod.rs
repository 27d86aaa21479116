//! Bus configuration module
//!
//! Type-safe configuration loaded from environment variables with the
//! `config` and `dotenvy` crates. Variables use the `OUTBOX_BUS` prefix and
//! nested values are separated by double underscores.
//!
//! # Example
//!
//! ```no_run
//! use outbox_bus::config::BusConfig;
//!
//! let config = BusConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//!
//! println!("Consuming from {}", config.broker.queue);
//! ```

mod broker;
mod database;
mod dispatcher;
mod error;
mod outbox;
mod publisher;
mod telemetry;

pub use broker::BrokerConfig;
pub use database::DatabaseConfig;
pub use dispatcher::DispatcherConfig;
pub use error::{ConfigError, ValidationError};
pub use outbox::OutboxConfig;
pub use publisher::PublisherConfig;
pub use telemetry::TelemetryConfig;

use serde::Deserialize;

/// Root configuration
///
/// Load using [`BusConfig::load()`] which reads from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// PostgreSQL holding the outbox table
    pub database: DatabaseConfig,

    /// Broker connection and topology
    pub broker: BrokerConfig,

    /// Publish retries
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Outbox sweep and rescheduling
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Consume loop
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Log output
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl BusConfig {
    /// Load configuration from environment variables
    ///
    /// This function:
    /// 1. Loads `.env` file if present (for development)
    /// 2. Reads environment variables with `OUTBOX_BUS` prefix
    /// 3. Uses `__` (double underscore) to separate nested values
    /// 4. Deserializes into typed configuration structs
    ///
    /// # Environment Variable Format
    ///
    /// - `OUTBOX_BUS__BROKER__QUEUE=billing` -> `broker.queue = "billing"`
    /// - `OUTBOX_BUS__DATABASE__URL=...` -> `database.url = ...`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or values
    /// cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("OUTBOX_BUS")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.database.validate()?;
        self.broker.validate()?;
        self.publisher.validate()?;
        self.outbox.validate()?;
        self.dispatcher.validate()?;
        self.telemetry.validate()?;
        Ok(())
    }

    /// `load` followed by `validate`.
    pub fn load_validated() -> Result<Self, ConfigError> {
        let config = Self::load()?;
        config.validate()?;
        Ok(config)
    }
}
