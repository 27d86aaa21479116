//! Domain layer containing the bus vocabulary and outbox rules.
//!
//! # Module Organization
//!
//! - `foundation` - Shared primitives (ids, timestamps, events, errors)
//! - `outbox` - Outbox record lifecycle
//! - `retry` - Exponential backoff and retry policy

pub mod foundation;
pub mod outbox;
pub mod retry;
