//! EventBus - One handle over the publish and consume sides.
//!
//! Wires the shared connection, subscription registry, event type registry,
//! publisher and dispatcher together so services deal with typed events and
//! handler constructors only.

use std::sync::Arc;

use crate::domain::foundation::{
    DomainError, HandlerId, IntegrationEvent, IntegrationEventType,
};
use crate::domain::retry::RetryPolicy;
use crate::ports::{
    BrokerConnector, ConsumerTopology, EventPublisher, EventSubscriber, HandlerFactory,
};

use super::{
    BrokerPublisher, ConnectionManager, ConsumerDispatcher, ConsumerDispatcherConfig,
    ConsumerState, EventTypeRegistry, IntegrationEventHandler, SubscriptionRegistry,
    TypedHandlerFactory,
};

/// Typed publish/subscribe over one exchange and one inbound queue.
///
/// # Example
///
/// ```ignore
/// let bus = EventBus::new(Arc::new(broker), ConsumerTopology::new("bus", "billing"));
/// bus.subscribe::<OrderCreated, _, _>("billing.invoice", || CreateInvoice::new(db.clone())).await?;
/// bus.start_consuming().await?;
/// bus.publish_typed(&OrderCreated { order_id }).await?;
/// ```
pub struct EventBus {
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    types: Arc<EventTypeRegistry>,
    publisher: Arc<BrokerPublisher>,
    dispatcher: ConsumerDispatcher,
}

impl EventBus {
    pub fn new(connector: Arc<dyn BrokerConnector>, topology: ConsumerTopology) -> Self {
        Self::with_settings(
            connector,
            topology,
            RetryPolicy::default(),
            ConsumerDispatcherConfig::default(),
        )
    }

    pub fn with_settings(
        connector: Arc<dyn BrokerConnector>,
        topology: ConsumerTopology,
        retry: RetryPolicy,
        dispatcher_config: ConsumerDispatcherConfig,
    ) -> Self {
        let exchange = topology.exchange.clone();
        let connections = Arc::new(ConnectionManager::new(connector, topology));
        let registry = Arc::new(SubscriptionRegistry::new(connections.clone()));
        let types = Arc::new(EventTypeRegistry::new());
        let publisher = Arc::new(
            BrokerPublisher::new(connections.clone(), exchange).with_retry_policy(retry),
        );
        let dispatcher = ConsumerDispatcher::new(
            connections.clone(),
            registry.clone(),
            types.clone(),
            dispatcher_config,
        );

        Self {
            connections,
            registry,
            types,
            publisher,
            dispatcher,
        }
    }

    /// Subscribes a typed handler. `make_handler` runs once per delivery.
    ///
    /// Also registers the decoder for `E`.
    pub async fn subscribe<E, H, F>(
        &self,
        handler_id: impl Into<String>,
        make_handler: F,
    ) -> Result<HandlerId, DomainError>
    where
        E: IntegrationEventType,
        H: IntegrationEventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let handler_id = HandlerId::new(handler_id)?;
        self.types.register::<E>();
        let factory = TypedHandlerFactory::<E, H, F>::new(handler_id.clone(), make_handler);
        self.registry.subscribe(E::EVENT_TYPE, Arc::new(factory)).await?;
        Ok(handler_id)
    }

    /// Subscribes an arbitrary factory, e.g. an `IdempotentHandlerFactory`.
    /// The decoder for `E` is registered as well.
    pub async fn subscribe_factory<E: IntegrationEventType>(
        &self,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<(), DomainError> {
        self.types.register::<E>();
        self.registry.subscribe(E::EVENT_TYPE, factory).await
    }

    pub async fn unsubscribe<E: IntegrationEventType>(
        &self,
        handler_id: &HandlerId,
    ) -> Result<(), DomainError> {
        self.registry.unsubscribe(E::EVENT_TYPE, handler_id).await
    }

    pub async fn publish(&self, event: &IntegrationEvent) -> Result<(), DomainError> {
        self.publisher.publish(event).await
    }

    pub async fn publish_typed<E: IntegrationEventType>(&self, event: &E) -> Result<(), DomainError> {
        self.publish(&IntegrationEvent::from_typed(event)?).await
    }

    pub async fn start_consuming(&self) -> Result<(), DomainError> {
        self.dispatcher.start_consuming().await
    }

    pub async fn stop_consuming(&self) -> Result<(), DomainError> {
        self.dispatcher.stop_consuming().await
    }

    /// Stops consuming and closes the broker connection.
    pub async fn shutdown(&self) -> Result<(), DomainError> {
        self.dispatcher.stop_consuming().await?;
        self.connections.shutdown().await
    }

    pub fn consumer_state(&self) -> ConsumerState {
        self.dispatcher.state()
    }

    /// The publisher as a port, for an `OutboxCoordinator` or `OutboxRelay`.
    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        self.publisher.clone()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn event_types(&self) -> &Arc<EventTypeRegistry> {
        &self.types
    }

    pub fn dispatcher(&self) -> &ConsumerDispatcher {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryBroker;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserRegistered {
        user_id: String,
    }

    crate::integration_event!(UserRegistered, event_type = "user.registered", aggregate_id = user_id);

    struct SendWelcome {
        outbox: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl IntegrationEventHandler<UserRegistered> for SendWelcome {
        async fn handle(&self, event: &UserRegistered, _: &IntegrationEvent) -> Result<(), DomainError> {
            self.outbox.lock().unwrap().push(event.user_id.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "SendWelcome"
        }
    }

    fn bus(broker: &InMemoryBroker) -> EventBus {
        EventBus::with_settings(
            Arc::new(broker.clone()),
            ConsumerTopology::new("bus", "mailer"),
            RetryPolicy::default(),
            ConsumerDispatcherConfig::default().with_receive_wait(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn typed_round_trip_through_the_broker() {
        let broker = InMemoryBroker::new();
        let bus = bus(&broker);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let shared = sent.clone();

        bus.subscribe::<UserRegistered, _, _>("mailer.welcome", move || SendWelcome {
            outbox: shared.clone(),
        })
        .await
        .unwrap();
        bus.start_consuming().await.unwrap();
        bus.publish_typed(&UserRegistered { user_id: "u-1".into() })
            .await
            .unwrap();

        for _ in 0..200 {
            if !sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*sent.lock().unwrap(), vec!["u-1".to_string()]);

        bus.shutdown().await.unwrap();
        assert_eq!(bus.consumer_state(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn subscribe_registers_decoder_and_binding() {
        let broker = InMemoryBroker::new();
        let bus = bus(&broker);
        let sent = Arc::new(Mutex::new(Vec::new()));

        let id = bus
            .subscribe::<UserRegistered, _, _>("mailer.welcome", move || SendWelcome {
                outbox: sent.clone(),
            })
            .await
            .unwrap();

        assert!(bus.event_types().contains("user.registered"));
        assert_eq!(broker.bindings("bus", "mailer"), vec!["user.registered".to_string()]);

        bus.unsubscribe::<UserRegistered>(&id).await.unwrap();
        assert!(broker.bindings("bus", "mailer").is_empty());
    }

    #[tokio::test]
    async fn invalid_handler_id_is_rejected() {
        let broker = InMemoryBroker::new();
        let bus = bus(&broker);
        let sent = Arc::new(Mutex::new(Vec::new()));

        let result = bus
            .subscribe::<UserRegistered, _, _>("", move || SendWelcome { outbox: sent.clone() })
            .await;

        assert!(result.is_err());
        assert!(broker.bindings("bus", "mailer").is_empty());
    }
}
