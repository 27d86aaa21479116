//! EventTypeRegistry - Maps event type names to payload decoders.
//!
//! Populated at startup with `register::<E>()` for every typed event the
//! process consumes. The dispatcher uses it to turn a raw message body into
//! a `DecodedEvent` whose typed payload handlers can downcast.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::foundation::{DomainError, ErrorCode, IntegrationEvent, IntegrationEventType};
use crate::ports::DecodedEvent;

type Decoder =
    Arc<dyn Fn(&IntegrationEvent) -> Result<Arc<dyn Any + Send + Sync>, DomainError> + Send + Sync>;

/// Name -> decoder table for typed integration events.
#[derive(Default)]
pub struct EventTypeRegistry {
    decoders: RwLock<HashMap<String, Decoder>>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the decoder for `E` under `E::EVENT_TYPE`.
    ///
    /// Registering the same type again replaces the decoder.
    pub fn register<E: IntegrationEventType>(&self) {
        let decoder: Decoder = Arc::new(|event: &IntegrationEvent| {
            let typed: E = event.payload_as()?;
            Ok(Arc::new(typed) as Arc<dyn Any + Send + Sync>)
        });

        self.decoders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(E::EVENT_TYPE.to_string(), decoder);
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(event_type)
    }

    /// Registered event type names, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .decoders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Decodes the typed payload of an already parsed envelope.
    ///
    /// # Errors
    ///
    /// - `UnknownEventType` if nothing is registered for the event type
    /// - `SerializationFailed` if the payload does not match the type
    pub fn decode(&self, envelope: IntegrationEvent) -> Result<DecodedEvent, DomainError> {
        let decoder = self
            .decoders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(envelope.event_type())
            .cloned()
            .ok_or_else(|| {
                DomainError::new(
                    ErrorCode::UnknownEventType,
                    format!("No decoder registered for '{}'", envelope.event_type()),
                )
            })?;

        let typed = decoder(&envelope)?;
        Ok(DecodedEvent::new(envelope, typed))
    }

    /// Parses a wire body and decodes it.
    pub fn decode_body(&self, body: &str) -> Result<DecodedEvent, DomainError> {
        self.decode(IntegrationEvent::from_json(body)?)
    }

    /// Parses a body received under `routing_key` and decodes it.
    ///
    /// The envelope must carry the same event type it was routed by;
    /// otherwise handlers of one type would see another type's payload.
    pub fn decode_routed(&self, routing_key: &str, body: &str) -> Result<DecodedEvent, DomainError> {
        let envelope = IntegrationEvent::from_json(body)?;
        if envelope.event_type() != routing_key {
            return Err(DomainError::new(
                ErrorCode::UnknownEventType,
                format!(
                    "Message routed as '{}' carries a '{}' event",
                    routing_key,
                    envelope.event_type()
                ),
            )
            .with_detail("routing_key", routing_key)
            .with_detail("event_type", envelope.event_type()));
        }
        self.decode(envelope)
    }
}
