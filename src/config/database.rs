//! Database configuration for the outbox table.
//!
//! The bus only touches Postgres for `outbox_messages`: enqueues ride on the
//! caller's own transaction, so this pool serves the relay's polls and the
//! post-commit `mark_processed` / `mark_failed` updates. A handful of
//! connections is enough.

use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use super::error::ValidationError;
use crate::domain::foundation::DomainError;

const MAX_POOL_SIZE: u32 = 32;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a sweep waits for a connection before the batch fails
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Apply the bundled `outbox_messages` migration on connect
    #[serde(default)]
    pub run_migrations: bool,
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::MissingRequired("DATABASE_URL"));
        }
        if !self.url.starts_with("postgres://") && !self.url.starts_with("postgresql://") {
            return Err(ValidationError::InvalidDatabaseUrl);
        }
        match self.max_connections {
            0 => return Err(ValidationError::InvalidPoolSize),
            n if n > MAX_POOL_SIZE => return Err(ValidationError::PoolSizeTooLarge),
            _ => {}
        }
        if self.acquire_timeout_ms == 0 {
            return Err(ValidationError::InvalidInterval("acquire_timeout"));
        }
        Ok(())
    }

    /// Opens the pool and, if enabled, applies migrations.
    pub async fn connect(&self) -> Result<PgPool, DomainError> {
        let pool = self
            .pool_options()
            .connect(&self.url)
            .await
            .map_err(|e| DomainError::database(format!("Failed to connect: {}", e)))?;

        if self.run_migrations {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| DomainError::database(format!("Migration failed: {}", e)))?;
            tracing::info!("Outbox migrations applied");
        }

        Ok(pool)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            run_migrations: false,
        }
    }
}

fn default_max_connections() -> u32 {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}
