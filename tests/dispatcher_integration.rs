//! Integration tests for the consume side.
//!
//! Runs the real consume loop against the in-memory broker: fan-out to
//! several handlers, messages nobody subscribes to, unsubscribe while
//! messages are in flight, and recovery after the broker drops the
//! connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outbox_bus::adapters::{IdempotentHandlerFactory, InMemoryBroker, InMemoryProcessedEventStore};
use outbox_bus::application::{
    ConsumerDispatcherConfig, ConsumerState, EventBus, IntegrationEventHandler,
    TypedHandlerFactory,
};
use outbox_bus::domain::foundation::{DomainError, ErrorCode, HandlerId, IntegrationEvent};
use outbox_bus::domain::retry::{ExponentialBackoff, RetryPolicy};
use outbox_bus::integration_event;
use outbox_bus::ports::{ConsumerTopology, OutboundMessage};

// =============================================================================
// Test Infrastructure
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ShipmentDispatched {
    shipment_id: String,
}

integration_event!(ShipmentDispatched, event_type = "shipment.dispatched", aggregate_id = shipment_id);

/// Counts invocations; optionally fails every time.
struct Counter {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl IntegrationEventHandler<ShipmentDispatched> for Counter {
    async fn handle(&self, _: &ShipmentDispatched, _: &IntegrationEvent) -> Result<(), DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DomainError::new(ErrorCode::HandlerFailed, "handler threw"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Counter"
    }
}

fn bus(broker: &InMemoryBroker) -> EventBus {
    EventBus::with_settings(
        Arc::new(broker.clone()),
        ConsumerTopology::new("bus", "warehouse"),
        RetryPolicy::new(3, ExponentialBackoff::new(Duration::from_millis(1))),
        ConsumerDispatcherConfig::default()
            .with_receive_wait(Duration::from_millis(10))
            .with_recovery_backoff(ExponentialBackoff::new(Duration::from_millis(1))),
    )
}

async fn subscribe_counter(bus: &EventBus, id: &str, fail: bool) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let shared = calls.clone();
    bus.subscribe::<ShipmentDispatched, _, _>(id, move || Counter {
        calls: shared.clone(),
        fail,
    })
    .await
    .unwrap();
    calls
}

fn shipment(id: &str) -> ShipmentDispatched {
    ShipmentDispatched {
        shipment_id: id.to_string(),
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn settled(broker: &InMemoryBroker) {
    let broker = broker.clone();
    eventually(move || broker.queue_depth("warehouse") == 0 && broker.unacked_count() == 0).await;
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn every_handler_runs_once_even_if_the_first_fails() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let failing = subscribe_counter(&bus, "first", true).await;
    let healthy = subscribe_counter(&bus, "second", false).await;
    bus.start_consuming().await.unwrap();

    bus.publish_typed(&shipment("s-1")).await.unwrap();
    settled(&broker).await;

    assert_eq!(failing.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.load(Ordering::SeqCst), 1);
    assert_eq!(bus.consumer_state(), ConsumerState::Consuming);
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_subscription_invokes_handler_once() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let calls = subscribe_counter(&bus, "only", false).await;
    let ignored = subscribe_counter(&bus, "only", false).await;
    bus.start_consuming().await.unwrap();

    bus.publish_typed(&shipment("s-2")).await.unwrap();
    settled(&broker).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ignored.load(Ordering::SeqCst), 0);
    bus.shutdown().await.unwrap();
}

// =============================================================================
// Messages without subscribers
// =============================================================================

#[tokio::test]
async fn message_without_subscribers_is_acked_and_loop_continues() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let calls = subscribe_counter(&bus, "h", false).await;
    bus.start_consuming().await.unwrap();

    // A stale binding left behind by an earlier deployment.
    let channel = {
        use outbox_bus::application::ConnectionManager;
        let connections = ConnectionManager::new(
            Arc::new(broker.clone()),
            ConsumerTopology::new("bus", "warehouse"),
        );
        let channel = connections.open_channel().await.unwrap();
        channel.bind_queue("warehouse", "bus", "parcel.lost").await.unwrap();
        channel
    };
    let orphan = IntegrationEvent::new("parcel.lost", "p-1", serde_json::json!({})).unwrap();
    channel
        .publish(
            "bus",
            OutboundMessage::persistent("parcel.lost", orphan.to_json().unwrap(), orphan.id().as_str()),
        )
        .await
        .unwrap();
    settled(&broker).await;

    bus.publish_typed(&shipment("s-3")).await.unwrap();
    let seen = calls.clone();
    eventually(move || seen.load(Ordering::SeqCst) == 1).await;
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn unsubscribing_the_last_handler_stops_delivery() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let calls = subscribe_counter(&bus, "h", false).await;
    bus.start_consuming().await.unwrap();

    bus.unsubscribe::<ShipmentDispatched>(&HandlerId::new("h").unwrap())
        .await
        .unwrap();
    bus.publish_typed(&shipment("s-4")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(broker.bindings("bus", "warehouse").is_empty());
    assert_eq!(broker.published_to("bus").len(), 1);
    bus.shutdown().await.unwrap();
}

// =============================================================================
// Recovery
// =============================================================================

/// Drops the broker connection while handling its first message.
struct Saboteur {
    broker: InMemoryBroker,
    tripped: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl IntegrationEventHandler<ShipmentDispatched> for Saboteur {
    async fn handle(&self, _: &ShipmentDispatched, _: &IntegrationEvent) -> Result<(), DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.tripped.swap(true, Ordering::SeqCst) {
            self.broker.close_connections();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Saboteur"
    }
}

#[tokio::test]
async fn unacked_message_is_redelivered_after_recovery() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let tripped = Arc::new(AtomicBool::new(false));
    let (b, t, c) = (broker.clone(), tripped.clone(), calls.clone());
    bus.subscribe::<ShipmentDispatched, _, _>("saboteur", move || Saboteur {
        broker: b.clone(),
        tripped: t.clone(),
        calls: c.clone(),
    })
    .await
    .unwrap();
    bus.start_consuming().await.unwrap();

    bus.publish_typed(&shipment("s-5")).await.unwrap();

    let seen = calls.clone();
    eventually(move || seen.load(Ordering::SeqCst) == 2).await;
    settled(&broker).await;
    let mut states = bus.dispatcher().watch_state();
    states
        .wait_for(|s| *s == ConsumerState::Consuming)
        .await
        .unwrap();
    assert_eq!(broker.bindings("bus", "warehouse"), vec!["shipment.dispatched".to_string()]);
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn idempotent_handler_skips_the_redelivered_copy() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let tripped = Arc::new(AtomicBool::new(false));
    let (b, t, c) = (broker.clone(), tripped.clone(), calls.clone());
    let typed = TypedHandlerFactory::<ShipmentDispatched, _, _>::new(
        HandlerId::new("saboteur").unwrap(),
        move || Saboteur {
            broker: b.clone(),
            tripped: t.clone(),
            calls: c.clone(),
        },
    );
    let processed = Arc::new(InMemoryProcessedEventStore::new());
    bus.subscribe_factory::<ShipmentDispatched>(Arc::new(IdempotentHandlerFactory::new(
        Arc::new(typed),
        processed.clone(),
    )))
    .await
    .unwrap();
    bus.start_consuming().await.unwrap();

    bus.publish_typed(&shipment("s-6")).await.unwrap();

    let flag = tripped.clone();
    eventually(move || flag.load(Ordering::SeqCst)).await;
    settled(&broker).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(processed.len().await, 1);
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn subscribing_while_consuming_binds_immediately() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.start_consuming().await.unwrap();

    let calls = subscribe_counter(&bus, "late", false).await;
    bus.publish_typed(&shipment("s-7")).await.unwrap();

    let seen = calls.clone();
    eventually(move || seen.load(Ordering::SeqCst) == 1).await;
    assert!(bus.registry().is_subscribed("shipment.dispatched", &HandlerId::new("late").unwrap()));
    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn stop_consuming_is_idempotent_through_the_facade() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    bus.stop_consuming().await.unwrap();
    bus.start_consuming().await.unwrap();
    bus.stop_consuming().await.unwrap();
    bus.stop_consuming().await.unwrap();

    assert_eq!(bus.consumer_state(), ConsumerState::Idle);
}
