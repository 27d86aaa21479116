//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the bus to external systems:
//! - `broker` - Message broker transports (in-memory, Redis Streams)
//! - `outbox` - Outbox stores (in-memory, PostgreSQL)
//! - `events` - Handler decorators and processed-event tracking

pub mod broker;
pub mod events;
pub mod outbox;

pub use broker::{InMemoryBroker, RedisStreamsBroker, DEFAULT_KEY_PREFIX, DEFAULT_STREAM_MAX_LEN};
pub use events::{IdempotentHandler, IdempotentHandlerFactory, InMemoryProcessedEventStore};
pub use outbox::{InMemoryOutboxStore, InMemoryOutboxTransaction, PostgresOutboxStore};
