//! BrokerPublisher - Pushes integration events to the broker.
//!
//! Each publish serializes the event, opens a one-shot channel, declares the
//! exchange and sends a persistent message routed by event type. Transient
//! transport errors are retried with exponential backoff; everything else is
//! returned to the caller at once.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::domain::foundation::{DomainError, ErrorCode, IntegrationEvent};
use crate::domain::retry::RetryPolicy;
use crate::ports::{EventPublisher, OutboundMessage};

use super::ConnectionManager;

/// Publishes events to one exchange with bounded retries.
pub struct BrokerPublisher {
    connections: Arc<ConnectionManager>,
    exchange: String,
    retry: RetryPolicy,
    cancel: Option<watch::Receiver<bool>>,
}

impl BrokerPublisher {
    pub fn new(connections: Arc<ConnectionManager>, exchange: impl Into<String>) -> Self {
        Self {
            connections,
            exchange: exchange.into(),
            retry: RetryPolicy::default(),
            cancel: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Aborts pending retries of every `publish` once `cancel` turns true.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `event`, retrying transient failures.
    ///
    /// `cancel` stops the loop before the next attempt. A message the
    /// broker already accepted is not retracted.
    ///
    /// # Errors
    ///
    /// - `SerializationFailed` if the event cannot be encoded (never retried)
    /// - `PublishRetriesExhausted` after `max_attempts` transient failures
    /// - `Cancelled` if `cancel` fired first
    /// - any non-transient broker error, unchanged
    #[tracing::instrument(
        name = "publish",
        skip(self, event, cancel),
        fields(event_id = %event.id(), event_type = %event.event_type())
    )]
    pub async fn publish_cancellable(
        &self,
        event: &IntegrationEvent,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), DomainError> {
        let message = OutboundMessage::persistent(
            event.event_type(),
            event.to_json()?,
            event.id().as_str(),
        );

        let mut attempt = 0;
        loop {
            if is_cancelled(&cancel) {
                return Err(cancelled(attempt));
            }
            attempt += 1;

            let error = match self.try_publish(&message).await {
                Ok(()) => {
                    tracing::debug!(attempt, "Event published");
                    return Ok(());
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            tracing::warn!(attempt, max_attempts = self.retry.max_attempts, error = %error, "Publish attempt failed");
            if !self.connections.is_connected() {
                self.connections.invalidate().await;
            }

            if attempt >= self.retry.max_attempts {
                return Err(DomainError::new(
                    ErrorCode::PublishRetriesExhausted,
                    format!(
                        "Publishing {} gave up after {} attempts: {}",
                        event.event_type(),
                        attempt,
                        error
                    ),
                )
                .with_detail("event_id", event.id().as_str())
                .with_detail("last_error", error.to_string()));
            }

            if sleep_or_cancel(self.retry.delay_after(attempt), &mut cancel).await {
                return Err(cancelled(attempt));
            }
        }
    }

    async fn try_publish(&self, message: &OutboundMessage) -> Result<(), DomainError> {
        let channel = self.connections.open_channel().await?;

        let result = async {
            channel.declare_exchange(&self.exchange).await?;
            channel.publish(&self.exchange, message.clone()).await
        }
        .await;

        let _ = channel.close().await;
        result
    }
}

#[async_trait]
impl EventPublisher for BrokerPublisher {
    async fn publish(&self, event: &IntegrationEvent) -> Result<(), DomainError> {
        self.publish_cancellable(event, self.cancel.clone()).await
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map_or(false, |rx| *rx.borrow())
}

fn cancelled(attempts: u32) -> DomainError {
    DomainError::new(
        ErrorCode::Cancelled,
        format!("Publish cancelled after {} attempt(s)", attempts),
    )
}

/// Sleeps for `delay`. Returns true if cancellation fired first.
async fn sleep_or_cancel(delay: Duration, cancel: &mut Option<watch::Receiver<bool>>) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    let Some(rx) = cancel.as_mut() else {
        tokio::time::sleep_until(deadline).await;
        return false;
    };

    let fired = tokio::select! {
        _ = tokio::time::sleep_until(deadline) => return false,
        result = rx.wait_for(|cancelled| *cancelled) => result.is_ok(),
    };
    if !fired {
        // Sender dropped: nobody can cancel any more.
        tokio::time::sleep_until(deadline).await;
    }
    fired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryBroker;
    use crate::domain::retry::ExponentialBackoff;
    use crate::ports::ConsumerTopology;
    use serde_json::json;

    fn publisher(broker: &InMemoryBroker, attempts: u32) -> BrokerPublisher {
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            ConsumerTopology::new("bus", "svc"),
        ));
        BrokerPublisher::new(connections, "bus").with_retry_policy(RetryPolicy::new(
            attempts,
            ExponentialBackoff::new(Duration::from_millis(1)),
        ))
    }

    fn event() -> IntegrationEvent {
        IntegrationEvent::new("order.created", "order-1", json!({"total": 10})).unwrap()
    }

    #[tokio::test]
    async fn publishes_persistent_message_routed_by_event_type() {
        let broker = InMemoryBroker::new();
        let event = event();

        publisher(&broker, 3).publish(&event).await.unwrap();

        let sent = broker.published_to("bus");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].routing_key, "order.created");
        assert_eq!(sent[0].message_id, event.id().as_str());
        assert!(sent[0].persistent);
        assert_eq!(IntegrationEvent::from_json(&sent[0].body).unwrap(), event);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(2);

        publisher(&broker, 5).publish(&event()).await.unwrap();

        assert_eq!(broker.published_to("bus").len(), 1);
    }

    #[tokio::test]
    async fn connect_failures_are_retried_too() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);

        publisher(&broker, 3).publish(&event()).await.unwrap();

        assert_eq!(broker.published_to("bus").len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_last_error() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(10);

        let err = publisher(&broker, 3).publish(&event()).await.unwrap_err();

        assert_eq!(err.code, ErrorCode::PublishRetriesExhausted);
        assert!(err.details.contains_key("last_error"));
        assert!(broker.published_to("bus").is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_attempt() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(10);
        let (tx, rx) = watch::channel(false);
        let publisher = publisher(&broker, 10).with_retry_policy(RetryPolicy::new(
            10,
            ExponentialBackoff::new(Duration::from_secs(60)),
        ));

        let task = tokio::spawn(async move { publisher.publish_cancellable(&event(), Some(rx)).await });
        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn already_cancelled_publish_sends_nothing() {
        let broker = InMemoryBroker::new();
        let (_tx, rx) = watch::channel(true);

        let err = publisher(&broker, 3)
            .publish_cancellable(&event(), Some(rx))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::Cancelled);
        assert!(broker.published_to("bus").is_empty());
    }
}
