//! Outbox store adapters.
//!
//! - `InMemoryOutboxStore` - Staged in-process transactions for tests
//! - `PostgresOutboxStore` - `outbox_messages` table via sqlx

mod in_memory;
mod postgres;

pub use in_memory::{InMemoryOutboxStore, InMemoryOutboxTransaction};
pub use postgres::PostgresOutboxStore;
