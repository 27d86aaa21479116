//! Broker adapters.
//!
//! - `InMemoryBroker` - In-process broker with fault injection for tests
//! - `RedisStreamsBroker` - Redis Streams transport for production

mod in_memory;
mod redis_streams;

pub use in_memory::{InMemoryBroker, DEFAULT_HISTORY_LIMIT};
pub use redis_streams::{RedisStreamsBroker, DEFAULT_KEY_PREFIX, DEFAULT_STREAM_MAX_LEN};
