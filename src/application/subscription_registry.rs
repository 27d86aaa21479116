//! SubscriptionRegistry - Event type -> handler factories.
//!
//! The first subscriber for an event type binds the inbound queue to that
//! routing key; the last unsubscribe removes the binding. Mutations are
//! serialized so the table and the broker bindings never disagree, and
//! readers (the dispatcher) get cloned snapshots.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::domain::foundation::{DomainError, HandlerId, ValidationError};
use crate::ports::{EventSubscriber, HandlerFactory, QueueBinder};

#[derive(Clone)]
struct Subscription {
    handler_id: HandlerId,
    factory: Arc<dyn HandlerFactory>,
}

/// Registry of handler factories keyed by event type.
pub struct SubscriptionRegistry {
    binder: Arc<dyn QueueBinder>,
    entries: RwLock<HashMap<String, Vec<Subscription>>>,
    mutations: Mutex<()>,
}

impl SubscriptionRegistry {
    pub fn new(binder: Arc<dyn QueueBinder>) -> Self {
        Self {
            binder,
            entries: RwLock::new(HashMap::new()),
            mutations: Mutex::new(()),
        }
    }

    fn read_entries<T>(&self, f: impl FnOnce(&HashMap<String, Vec<Subscription>>) -> T) -> T {
        f(&self.entries.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn write_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<Subscription>>) -> T) -> T {
        f(&mut self.entries.write().unwrap_or_else(|e| e.into_inner()))
    }

    /// Handler ids subscribed to `event_type`, in subscription order.
    pub fn handlers_for(&self, event_type: &str) -> Vec<HandlerId> {
        self.read_entries(|entries| {
            entries
                .get(event_type)
                .map(|subs| subs.iter().map(|s| s.handler_id.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Snapshot of the factories for `event_type`, in subscription order.
    pub fn factories_for(&self, event_type: &str) -> Vec<Arc<dyn HandlerFactory>> {
        self.read_entries(|entries| {
            entries
                .get(event_type)
                .map(|subs| subs.iter().map(|s| s.factory.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Event types with at least one subscriber, sorted. These are exactly
    /// the routing keys bound on the inbound queue.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.read_entries(|entries| entries.keys().cloned().collect());
        types.sort();
        types
    }

    pub fn is_subscribed(&self, event_type: &str, handler_id: &HandlerId) -> bool {
        self.read_entries(|entries| {
            entries
                .get(event_type)
                .map_or(false, |subs| subs.iter().any(|s| &s.handler_id == handler_id))
        })
    }
}

#[async_trait]
impl EventSubscriber for SubscriptionRegistry {
    async fn subscribe(
        &self,
        event_type: &str,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<(), DomainError> {
        if event_type.trim().is_empty() {
            return Err(ValidationError::empty_field("event_type").into());
        }
        let handler_id = factory.handler_id().clone();
        let _guard = self.mutations.lock().await;

        let first = self.read_entries(|entries| !entries.contains_key(event_type));
        if !first && self.is_subscribed(event_type, &handler_id) {
            tracing::debug!(event_type, handler = %handler_id, "Handler already subscribed");
            return Ok(());
        }

        // Bind before the entry becomes visible; a failed bind leaves no trace.
        if first {
            self.binder.bind(event_type).await.map_err(|e| {
                tracing::error!(event_type, error = %e, "Failed to bind routing key");
                e
            })?;
        }

        self.write_entries(|entries| {
            entries
                .entry(event_type.to_string())
                .or_default()
                .push(Subscription {
                    handler_id: handler_id.clone(),
                    factory,
                })
        });
        tracing::info!(event_type, handler = %handler_id, "Handler subscribed");
        Ok(())
    }

    async fn unsubscribe(
        &self,
        event_type: &str,
        handler_id: &HandlerId,
    ) -> Result<(), DomainError> {
        let _guard = self.mutations.lock().await;

        let (removed, now_empty) = self.write_entries(|entries| {
            let Some(subs) = entries.get_mut(event_type) else {
                return (false, false);
            };
            let before = subs.len();
            subs.retain(|s| &s.handler_id != handler_id);
            let removed = subs.len() != before;
            let now_empty = subs.is_empty();
            if now_empty {
                entries.remove(event_type);
            }
            (removed, now_empty)
        });

        if !removed {
            return Ok(());
        }
        tracing::info!(event_type, handler = %handler_id, "Handler unsubscribed");

        if now_empty {
            self.binder.unbind(event_type).await.map_err(|e| {
                tracing::error!(event_type, error = %e, "Failed to unbind routing key");
                e
            })?;
        }
        Ok(())
    }
}
