//! Outbox domain - records awaiting delivery to the broker.

mod record;

pub use record::{OutboxRecord, OutboxStatus};
