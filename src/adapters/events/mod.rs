//! Event handling adapters.
//!
//! - `IdempotentHandler` - Wrapper for at-most-once event processing
//! - `IdempotentHandlerFactory` - Applies `IdempotentHandler` to every created handler
//! - `InMemoryProcessedEventStore` - Process-local processed-event tracking

mod idempotent_handler;

pub use idempotent_handler::{
    IdempotentHandler, IdempotentHandlerFactory, InMemoryProcessedEventStore,
};
