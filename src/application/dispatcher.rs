//! ConsumerDispatcher - Fans inbound messages out to subscribed handlers.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --start_consuming--> Consuming --stop_consuming--> Idle
//!                             |   ^
//!          transport error    v   |  channel reopened, bindings restored
//!                           Recovering --stop_consuming--> Idle
//! ```
//!
//! ## Per-message flow
//!
//! 1. Look up the handler factories for the routing key (none: warn, ack)
//! 2. Decode the body through the `EventTypeRegistry` (failure: error, ack)
//! 3. Build a fresh handler per factory and run each in its own task
//! 4. Ack, or apply the `HandlerFailurePolicy` if any handler failed

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::domain::foundation::{DomainError, ErrorCode, HandlerId, StateMachine};
use crate::domain::retry::ExponentialBackoff;
use crate::ports::{BrokerChannel, DecodedEvent, Delivery, HandlerFactory, OutboundMessage};

use super::{ConnectionManager, EventTypeRegistry, SubscriptionRegistry};

/// State of the consume loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Idle,
    Consuming,
    /// The consumer channel failed and is being recreated.
    Recovering,
}

impl StateMachine for ConsumerState {
    fn can_transition_to(&self, target: &Self) -> bool {
        use ConsumerState::*;
        matches!(
            (self, target),
            (Idle, Consuming)
                | (Consuming, Idle)
                | (Consuming, Recovering)
                | (Recovering, Consuming)
                | (Recovering, Idle)
        )
    }

    fn valid_transitions(&self) -> Vec<Self> {
        use ConsumerState::*;
        match self {
            Idle => vec![Consuming],
            Consuming => vec![Idle, Recovering],
            Recovering => vec![Consuming, Idle],
        }
    }
}

/// What happens to a message when at least one handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerFailurePolicy {
    /// Log and ack. The message is gone.
    #[default]
    Acknowledge,
    /// Nack with requeue; every handler sees the message again.
    Requeue,
    /// Publish the raw message to the dead-letter exchange, then ack.
    DeadLetter,
}

/// Runtime settings of the dispatcher.
#[derive(Debug, Clone)]
pub struct ConsumerDispatcherConfig {
    /// Longest a single receive blocks before re-checking for shutdown.
    pub receive_wait: Duration,

    /// Delay schedule between attempts to reopen a failed consumer channel.
    pub recovery_backoff: ExponentialBackoff,

    pub failure_policy: HandlerFailurePolicy,

    pub dead_letter_exchange: String,
}

impl Default for ConsumerDispatcherConfig {
    fn default() -> Self {
        Self {
            receive_wait: Duration::from_secs(1),
            recovery_backoff: ExponentialBackoff::new(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(30)),
            failure_policy: HandlerFailurePolicy::default(),
            dead_letter_exchange: "bus.dead-letter".to_string(),
        }
    }
}

impl ConsumerDispatcherConfig {
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_recovery_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.recovery_backoff = backoff;
        self
    }

    pub fn with_failure_policy(mut self, policy: HandlerFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = exchange.into();
        self
    }
}

/// One handler that did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler_id: HandlerId,
    pub error: String,
}

/// Result of dispatching one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No handler subscribed to the routing key; acked and dropped.
    NoSubscribers,
    /// Body could not be decoded; acked and dropped.
    Undecodable,
    /// Every handler ran; `failures` lists the ones that failed.
    Handled {
        handlers: usize,
        failures: Vec<HandlerFailure>,
    },
}

struct Shared {
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    types: Arc<EventTypeRegistry>,
    config: ConsumerDispatcherConfig,
    state: watch::Sender<ConsumerState>,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Consumes the inbound queue and invokes subscribed handlers.
pub struct ConsumerDispatcher {
    shared: Arc<Shared>,
    running: Mutex<Option<RunningLoop>>,
}

impl ConsumerDispatcher {
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        types: Arc<EventTypeRegistry>,
        config: ConsumerDispatcherConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            shared: Arc::new(Shared {
                connections,
                registry,
                types,
                config,
                state,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state.borrow()
    }

    /// Observes state changes, e.g. to wait for recovery to finish.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.shared.state.subscribe()
    }

    /// Opens the consumer channel with every current binding and spawns
    /// the consume loop. A no-op if the loop is already running.
    ///
    /// # Errors
    ///
    /// Broker errors from opening the channel; the dispatcher stays Idle.
    pub async fn start_consuming(&self) -> Result<(), DomainError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Consumer already running");
            return Ok(());
        }

        let topology = self.shared.connections.topology().clone();
        let channel = self
            .shared
            .connections
            .open_consumer_channel(&topology, &self.shared.registry.event_types())
            .await?;

        self.shared.transition(ConsumerState::Consuming)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consume_loop(self.shared.clone(), channel, shutdown_rx));
        *running = Some(RunningLoop { shutdown, handle });

        tracing::info!(queue = %topology.queue, "Consumer started");
        Ok(())
    }

    /// Signals the loop to stop, waits for the in-flight message to finish
    /// and closes the channel. Calling it while Idle does nothing.
    pub async fn stop_consuming(&self) -> Result<(), DomainError> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return Ok(());
        };

        let _ = run.shutdown.send(true);
        if let Err(e) = run.handle.await {
            tracing::error!(error = %e, "Consume loop terminated abnormally");
        }

        if self.state() != ConsumerState::Idle {
            self.shared.transition(ConsumerState::Idle)?;
        }
        tracing::info!("Consumer stopped");
        Ok(())
    }

    /// Dispatches one delivery received on `channel` and settles it there.
    ///
    /// # Errors
    ///
    /// Only transport errors from ack/nack/dead-lettering. Handler failures
    /// are reported in the outcome.
    pub async fn handle_delivery(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
    ) -> Result<DispatchOutcome, DomainError> {
        self.shared.dispatch(channel, delivery).await
    }
}

impl Shared {
    fn transition(&self, to: ConsumerState) -> Result<(), DomainError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| match current.transition_to(to) {
            Ok(next) => {
                *current = next;
                true
            }
            Err(e) => {
                result = Err(DomainError::new(ErrorCode::InvalidStateTransition, e.to_string()));
                false
            }
        });
        result
    }

    #[tracing::instrument(
        name = "dispatch",
        skip(self, channel, delivery),
        fields(routing_key = %delivery.routing_key, message_id = %delivery.message_id)
    )]
    async fn dispatch(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
    ) -> Result<DispatchOutcome, DomainError> {
        let factories = self.registry.factories_for(&delivery.routing_key);
        if factories.is_empty() {
            tracing::warn!("No subscribers for message; dropping");
            channel.ack(delivery).await?;
            return Ok(DispatchOutcome::NoSubscribers);
        }

        let decoded = match self.types.decode_routed(&delivery.routing_key, &delivery.body) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::error!(error = %e, "Failed to decode message; dropping");
                channel.ack(delivery).await?;
                return Ok(DispatchOutcome::Undecodable);
            }
        };

        let handlers = factories.len();
        let mut failures = Vec::new();
        for factory in factories {
            if let Err(error) = run_handler(factory.as_ref(), &decoded).await {
                tracing::error!(handler = %factory.handler_id(), error = %error, "Event handler failed");
                failures.push(HandlerFailure {
                    handler_id: factory.handler_id().clone(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            channel.ack(delivery).await?;
        } else {
            self.settle_failed(channel, delivery).await?;
        }

        Ok(DispatchOutcome::Handled { handlers, failures })
    }

    async fn settle_failed(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
    ) -> Result<(), DomainError> {
        match self.config.failure_policy {
            HandlerFailurePolicy::Acknowledge => channel.ack(delivery).await,
            HandlerFailurePolicy::Requeue => channel.nack(delivery, true).await,
            HandlerFailurePolicy::DeadLetter => {
                let exchange = &self.config.dead_letter_exchange;
                let forwarded = async {
                    channel.declare_exchange(exchange).await?;
                    channel
                        .publish(
                            exchange,
                            OutboundMessage::persistent(
                                &delivery.routing_key,
                                &delivery.body,
                                &delivery.message_id,
                            ),
                        )
                        .await
                }
                .await;

                match forwarded {
                    Ok(()) => channel.ack(delivery).await,
                    Err(e) => {
                        tracing::error!(error = %e, "Dead-lettering failed; requeueing");
                        channel.nack(delivery, true).await
                    }
                }
            }
        }
    }

    /// Reopens the consumer channel until it works or shutdown is requested.
    ///
    /// Returns the new channel, or `None` on shutdown.
    async fn recover(
        &self,
        cause: DomainError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn BrokerChannel>> {
        tracing::warn!(error = %cause, "Consumer channel failed; recovering");
        if self.transition(ConsumerState::Recovering).is_err() {
            return None;
        }

        let topology = self.connections.topology().clone();
        let mut attempt: u32 = 0;
        loop {
            if !self.connections.is_connected() {
                self.connections.invalidate().await;
            }

            match self
                .connections
                .open_consumer_channel(&topology, &self.registry.event_types())
                .await
            {
                Ok(channel) => {
                    if self.transition(ConsumerState::Consuming).is_err() {
                        let _ = channel.close().await;
                        return None;
                    }
                    tracing::info!(attempts = attempt + 1, "Consumer channel recovered");
                    return Some(channel);
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Consumer recovery attempt failed");
                }
            }

            let delay = self.config.recovery_backoff.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }
}

/// Creates a handler and runs it in its own task so a panic or leaked
/// state cannot reach the loop or the other handlers.
async fn run_handler(factory: &dyn HandlerFactory, event: &DecodedEvent) -> Result<(), String> {
    let handler = factory.create().map_err(|e| e.to_string())?;
    let span = tracing::info_span!(
        "event_handler",
        handler = %factory.handler_id(),
        event_id = %event.envelope().id(),
    );

    let event = event.clone();
    let task = tokio::spawn(async move { handler.handle(&event).await }.instrument(span));

    match task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(join) if join.is_panic() => Err("handler panicked".to_string()),
        Err(join) => Err(join.to_string()),
    }
}

async fn consume_loop(
    shared: Arc<Shared>,
    mut channel: Box<dyn BrokerChannel>,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue = shared.connections.topology().queue.clone();
    let wait = shared.config.receive_wait;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = channel.next_delivery(&queue, wait) => received,
        };

        let failure = match received {
            Ok(None) => continue,
            Ok(Some(delivery)) => match shared.dispatch(channel.as_ref(), &delivery).await {
                Ok(_) => continue,
                Err(e) => e,
            },
            Err(e) => e,
        };

        let _ = channel.close().await;
        match shared.recover(failure, &mut shutdown).await {
            Some(reopened) => channel = reopened,
            None => return,
        }
    }

    let _ = channel.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryBroker;
    use crate::domain::foundation::IntegrationEvent;
    use crate::ports::{ConsumerTopology, EventHandler, EventSubscriber};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct StockReserved {
        sku: String,
    }

    crate::integration_event!(StockReserved, event_type = "stock.reserved", aggregate_id = sku);

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _: &DecodedEvent) -> Result<(), DomainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DomainError::new(ErrorCode::HandlerFailed, "boom"));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Counting"
        }
    }

    struct CountingFactory {
        id: HandlerId,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl HandlerFactory for CountingFactory {
        fn handler_id(&self) -> &HandlerId {
            &self.id
        }

        fn create(&self) -> Result<Box<dyn EventHandler>, DomainError> {
            Ok(Box::new(Counting {
                calls: self.calls.clone(),
                fail: self.fail,
            }))
        }
    }

    struct Fixture {
        broker: InMemoryBroker,
        connections: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: ConsumerDispatcher,
    }

    fn fixture(policy: HandlerFailurePolicy) -> Fixture {
        let broker = InMemoryBroker::new();
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            ConsumerTopology::new("bus", "svc"),
        ));
        let registry = Arc::new(SubscriptionRegistry::new(connections.clone()));
        let types = Arc::new(EventTypeRegistry::new());
        types.register::<StockReserved>();
        let dispatcher = ConsumerDispatcher::new(
            connections.clone(),
            registry.clone(),
            types,
            ConsumerDispatcherConfig::default()
                .with_receive_wait(Duration::from_millis(10))
                .with_recovery_backoff(ExponentialBackoff::new(Duration::from_millis(1)))
                .with_failure_policy(policy),
        );
        Fixture {
            broker,
            connections,
            registry,
            dispatcher,
        }
    }

    async fn subscribe(f: &Fixture, id: &str, fail: bool) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        f.registry
            .subscribe(
                "stock.reserved",
                Arc::new(CountingFactory {
                    id: HandlerId::new(id).unwrap(),
                    calls: calls.clone(),
                    fail,
                }),
            )
            .await
            .unwrap();
        calls
    }

    fn body() -> String {
        IntegrationEvent::from_typed(&StockReserved { sku: "sku-1".into() })
            .unwrap()
            .to_json()
            .unwrap()
    }

    async fn publish(f: &Fixture, routing_key: &str, body: &str) {
        let channel = f.connections.open_channel().await.unwrap();
        channel.declare_exchange("bus").await.unwrap();
        channel
            .publish("bus", OutboundMessage::persistent(routing_key, body, "m-1"))
            .await
            .unwrap();
    }

    async fn receive(f: &Fixture) -> (Box<dyn BrokerChannel>, Delivery) {
        let topology = f.connections.topology().clone();
        let channel = f
            .connections
            .open_consumer_channel(&topology, &f.registry.event_types())
            .await
            .unwrap();
        let delivery = channel
            .next_delivery("svc", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        (channel, delivery)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn consumer_state_transitions() {
        use ConsumerState::*;
        assert!(Idle.can_transition_to(&Consuming));
        assert!(Consuming.can_transition_to(&Recovering));
        assert!(Recovering.can_transition_to(&Consuming));
        assert!(Recovering.can_transition_to(&Idle));
        assert!(!Idle.can_transition_to(&Recovering));
        assert!(!Idle.is_terminal());
    }

    #[test]
    fn failure_policy_defaults_to_acknowledge() {
        assert_eq!(HandlerFailurePolicy::default(), HandlerFailurePolicy::Acknowledge);
    }

    #[tokio::test]
    async fn all_handlers_run_even_when_one_fails() {
        let f = fixture(HandlerFailurePolicy::Acknowledge);
        let first = subscribe(&f, "first", true).await;
        let second = subscribe(&f, "second", false).await;
        publish(&f, "stock.reserved", &body()).await;
        let (channel, delivery) = receive(&f).await;

        let outcome = f
            .dispatcher
            .handle_delivery(channel.as_ref(), &delivery)
            .await
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        match outcome {
            DispatchOutcome::Handled { handlers, failures } => {
                assert_eq!(handlers, 2);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].handler_id.as_str(), "first");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(f.broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn requeue_policy_returns_failed_message() {
        let f = fixture(HandlerFailurePolicy::Requeue);
        subscribe(&f, "failing", true).await;
        publish(&f, "stock.reserved", &body()).await;
        let (channel, delivery) = receive(&f).await;

        f.dispatcher
            .handle_delivery(channel.as_ref(), &delivery)
            .await
            .unwrap();

        assert_eq!(f.broker.queue_depth("svc"), 1);
    }

    #[tokio::test]
    async fn dead_letter_policy_forwards_raw_message() {
        let f = fixture(HandlerFailurePolicy::DeadLetter);
        subscribe(&f, "failing", true).await;
        let body = body();
        publish(&f, "stock.reserved", &body).await;
        let (channel, delivery) = receive(&f).await;

        f.dispatcher
            .handle_delivery(channel.as_ref(), &delivery)
            .await
            .unwrap();

        let dead = f.broker.published_to("bus.dead-letter");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, body);
        assert_eq!(f.broker.unacked_count(), 0);
        assert_eq!(f.broker.queue_depth("svc"), 0);
    }

    #[tokio::test]
    async fn undecodable_message_is_acked_and_dropped() {
        let f = fixture(HandlerFailurePolicy::Requeue);
        let calls = subscribe(&f, "h", false).await;
        publish(&f, "stock.reserved", "{not json").await;
        let (channel, delivery) = receive(&f).await;

        let outcome = f
            .dispatcher
            .handle_delivery(channel.as_ref(), &delivery)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Undecodable);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn envelope_of_another_type_is_not_dispatched() {
        let f = fixture(HandlerFailurePolicy::Requeue);
        let calls = subscribe(&f, "h", false).await;
        let foreign = IntegrationEvent::new("stock.released", "sku-1", json!({"sku": "sku-1"}))
            .unwrap()
            .to_json()
            .unwrap();
        publish(&f, "stock.reserved", &foreign).await;
        let (channel, delivery) = receive(&f).await;

        let outcome = f
            .dispatcher
            .handle_delivery(channel.as_ref(), &delivery)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Undecodable);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.broker.unacked_count(), 0);
        assert_eq!(f.broker.queue_depth("svc"), 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        struct Panics;

        #[async_trait]
        impl EventHandler for Panics {
            async fn handle(&self, _: &DecodedEvent) -> Result<(), DomainError> {
                panic!("handler bug");
            }

            fn name(&self) -> &'static str {
                "Panics"
            }
        }

        struct PanicsFactory(HandlerId);

        impl HandlerFactory for PanicsFactory {
            fn handler_id(&self) -> &HandlerId {
                &self.0
            }

            fn create(&self) -> Result<Box<dyn EventHandler>, DomainError> {
                Ok(Box::new(Panics))
            }
        }

        let f = fixture(HandlerFailurePolicy::Acknowledge);
        f.registry
            .subscribe("stock.reserved", Arc::new(PanicsFactory(HandlerId::new("panics").unwrap())))
            .await
            .unwrap();
        let healthy = subscribe(&f, "healthy", false).await;
        publish(&f, "stock.reserved", &body()).await;
        let (channel, delivery) = receive(&f).await;

        let outcome = f
            .dispatcher
            .handle_delivery(channel.as_ref(), &delivery)
            .await
            .unwrap();

        assert_eq!(healthy.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, DispatchOutcome::Handled { ref failures, .. } if failures.len() == 1));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let f = fixture(HandlerFailurePolicy::Acknowledge);

        f.dispatcher.stop_consuming().await.unwrap();
        f.dispatcher.start_consuming().await.unwrap();
        f.dispatcher.start_consuming().await.unwrap();
        assert_eq!(f.dispatcher.state(), ConsumerState::Consuming);

        f.dispatcher.stop_consuming().await.unwrap();
        f.dispatcher.stop_consuming().await.unwrap();
        assert_eq!(f.dispatcher.state(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn failed_start_stays_idle() {
        let f = fixture(HandlerFailurePolicy::Acknowledge);
        f.broker.fail_next_connects(1);

        assert!(f.dispatcher.start_consuming().await.is_err());
        assert_eq!(f.dispatcher.state(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn consume_loop_dispatches_published_messages() {
        let f = fixture(HandlerFailurePolicy::Acknowledge);
        let calls = subscribe(&f, "h", false).await;
        f.dispatcher.start_consuming().await.unwrap();

        publish(&f, "stock.reserved", &body()).await;

        let seen = calls.clone();
        eventually(move || seen.load(Ordering::SeqCst) == 1).await;
        f.dispatcher.stop_consuming().await.unwrap();
    }

    #[tokio::test]
    async fn recovers_after_channel_failure_and_rebinds() {
        let f = fixture(HandlerFailurePolicy::Acknowledge);
        let calls = subscribe(&f, "h", false).await;
        f.dispatcher.start_consuming().await.unwrap();
        let mut states = f.dispatcher.watch_state();

        f.broker.close_connections();
        let broker = f.broker.clone();
        eventually(move || broker.connect_count() == 2).await;
        states
            .wait_for(|s| *s == ConsumerState::Consuming)
            .await
            .unwrap();

        assert_eq!(f.broker.bindings("bus", "svc"), vec!["stock.reserved".to_string()]);
        publish(&f, "stock.reserved", &body()).await;
        let seen = calls.clone();
        eventually(move || seen.load(Ordering::SeqCst) == 1).await;

        f.dispatcher.stop_consuming().await.unwrap();
        assert_eq!(f.dispatcher.state(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn stop_during_recovery_returns_to_idle() {
        let f = fixture(HandlerFailurePolicy::Acknowledge);
        subscribe(&f, "h", false).await;
        f.dispatcher.start_consuming().await.unwrap();
        let mut states = f.dispatcher.watch_state();

        f.broker.fail_next_connects(u32::MAX);
        f.broker.close_connections();
        states
            .wait_for(|s| *s == ConsumerState::Recovering)
            .await
            .unwrap();

        f.dispatcher.stop_consuming().await.unwrap();
        assert_eq!(f.dispatcher.state(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn message_without_subscribers_is_acked() {
        let f = fixture(HandlerFailurePolicy::Acknowledge);
        subscribe(&f, "h", false).await;
        publish(&f, "stock.reserved", &json!({}).to_string()).await;
        let (channel, delivery) = receive(&f).await;
        f.registry
            .unsubscribe("stock.reserved", &HandlerId::new("h").unwrap())
            .await
            .unwrap();

        let outcome = f
            .dispatcher
            .handle_delivery(channel.as_ref(), &delivery)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::NoSubscribers);
        assert_eq!(f.broker.unacked_count(), 0);
    }
}
