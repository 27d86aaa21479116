//! outbox-bus - Transactional-outbox-backed integration event bus
//!
//! Services publish integration events through a transactional outbox so
//! that a business change and its events commit together, then deliver them
//! to a topic exchange with bounded retries. On the consuming side handlers
//! subscribe by event type and a dispatcher fans each message out to fresh
//! handler instances, surviving broker restarts.
//!
//! # Layout
//!
//! - `domain` - Events, outbox records, retry math
//! - `ports` - Broker, outbox store and handler contracts
//! - `adapters` - In-memory, Redis Streams and PostgreSQL implementations
//! - `application` - Connection manager, publisher, registries, dispatcher,
//!   outbox coordinator and relay
//! - `config` / `telemetry` - Environment configuration and logging

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;
