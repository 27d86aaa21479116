//! OutboxRelay - Background sweep for records the coordinator left behind.
//!
//! The coordinator publishes right after commit. Whatever it could not
//! deliver (broker down, process crashed between commit and publish) stays
//! in the outbox as Active or Failed; the relay picks those up here.
//!
//! ## Configuration
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `poll_interval` | 100ms | How often to check for due records |
//! | `batch_size` | 100 | Max records to publish per poll cycle |
//!
//! ## Graceful Shutdown
//!
//! The relay listens for a shutdown signal and runs one final batch before
//! stopping.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use crate::domain::foundation::DomainError;
use crate::ports::{EventPublisher, OutboxStore};

use super::coordinator::deliver;

/// Configuration for the OutboxRelay service.
#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    /// How often to poll for due records.
    pub poll_interval: Duration,

    /// Maximum records to process per poll cycle.
    pub batch_size: u32,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
        }
    }
}

impl OutboxRelayConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayBatch {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
}

/// Background service that republishes due outbox records.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxRelayConfig,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self::with_config(store, publisher, OutboxRelayConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OutboxRelayConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Polls until `shutdown` turns true, then runs one final batch.
    ///
    /// A failing batch is logged and retried at the next tick. Only an error
    /// from the final batch is returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DomainError> {
        let mut interval = time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.process_batch().await?;
                        tracing::info!("Outbox relay stopped");
                        return Ok(());
                    }
                }

                _ = interval.tick() => {
                    if let Err(e) = self.process_batch().await {
                        tracing::error!(error = %e, "Outbox sweep failed");
                    }
                }
            }
        }
    }

    /// Fetches due records and tries each one once.
    pub async fn process_batch(&self) -> Result<RelayBatch, DomainError> {
        let records = self.store.fetch_pending(self.config.batch_size).await?;
        let mut batch = RelayBatch {
            fetched: records.len(),
            ..RelayBatch::default()
        };

        for record in &records {
            match deliver(self.store.as_ref(), self.publisher.as_ref(), record).await {
                Ok(()) => batch.published += 1,
                Err(_) => batch.failed += 1,
            }
        }

        if batch.fetched > 0 {
            tracing::debug!(
                fetched = batch.fetched,
                published = batch.published,
                failed = batch.failed,
                "Outbox sweep finished"
            );
        }
        Ok(batch)
    }

    /// Runs exactly one sweep.
    pub async fn poll_once(&self) -> Result<RelayBatch, DomainError> {
        self.process_batch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryOutboxStore;
    use crate::domain::foundation::{
        Clock, ErrorCode, IntegrationEvent, ManualClock, OutboxId, Timestamp,
    };
    use crate::domain::outbox::{OutboxRecord, OutboxStatus};
    use crate::domain::retry::ExponentialBackoff;
    use crate::ports::TransactionalOutbox;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        down: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &IntegrationEvent) -> Result<(), DomainError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(DomainError::new(ErrorCode::PublishRetriesExhausted, "Broker down"));
            }
            self.sent.lock().unwrap().push(event.aggregate_id().to_string());
            Ok(())
        }
    }

    async fn seed(store: &InMemoryOutboxStore, aggregates: &[&str]) -> Vec<OutboxId> {
        let mut tx = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for agg in aggregates {
            let event = IntegrationEvent::new("test.event", *agg, json!({})).unwrap();
            ids.push(store.enqueue(&mut tx, &event).await.unwrap().id());
        }
        store.commit(tx).await.unwrap();
        ids
    }

    #[tokio::test]
    async fn poll_once_publishes_pending_records() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        seed(&store, &["agg-1", "agg-2"]).await;

        let relay = OutboxRelay::new(store.clone(), publisher.clone());
        let batch = relay.poll_once().await.unwrap();

        assert_eq!(batch.published, 2);
        assert_eq!(*publisher.sent.lock().unwrap(), vec!["agg-1", "agg-2"]);
        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_once_respects_batch_size() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        seed(&store, &["a", "b", "c", "d", "e"]).await;

        let config = OutboxRelayConfig::default().with_batch_size(2);
        let relay = OutboxRelay::with_config(store.clone(), publisher.clone(), config);

        assert_eq!(relay.poll_once().await.unwrap().published, 2);
        assert_eq!(relay.poll_once().await.unwrap().published, 2);
        assert_eq!(relay.poll_once().await.unwrap().published, 1);
        assert_eq!(relay.poll_once().await.unwrap(), RelayBatch::default());
    }

    #[tokio::test]
    async fn failed_publish_schedules_a_retry() {
        let clock = Arc::new(ManualClock::new(Timestamp::now()));
        let store = Arc::new(InMemoryOutboxStore::with_clock(
            clock.clone(),
            ExponentialBackoff::new(Duration::from_secs(1)),
        ));
        let publisher = Arc::new(RecordingPublisher::default());
        let ids = seed(&store, &["agg-1"]).await;
        publisher.down.store(true, Ordering::SeqCst);
        let relay = OutboxRelay::new(store.clone(), publisher.clone());

        let batch = relay.poll_once().await.unwrap();
        assert_eq!(batch.failed, 1);

        let record = store.find(ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status(), OutboxStatus::Failed);
        assert_eq!(record.retry_count(), 1);
        assert!(record.next_retry_at().unwrap().is_after(&clock.now()));

        // Not due yet.
        publisher.down.store(false, Ordering::SeqCst);
        assert_eq!(relay.poll_once().await.unwrap().fetched, 0);

        clock.advance_millis(2_001);
        assert_eq!(relay.poll_once().await.unwrap().published, 1);
        let record = store.find(ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status(), OutboxStatus::Processed);
    }

    #[tokio::test]
    async fn undecodable_record_is_marked_failed() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let corrupted = OutboxRecord::restore(
            OutboxId::new(),
            "test.event".to_string(),
            "agg-1".to_string(),
            "{broken".to_string(),
            OutboxStatus::Active,
            Timestamp::now(),
            None,
            None,
            0,
            None,
        )
        .unwrap();
        let id = corrupted.id();
        store.insert_committed(corrupted).await;
        let relay = OutboxRelay::new(store.clone(), publisher.clone());

        let batch = relay.poll_once().await.unwrap();

        assert_eq!(batch.failed, 1);
        assert!(publisher.sent.lock().unwrap().is_empty());
        let stored = store.find(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), OutboxStatus::Failed);
        assert!(stored.error_message().is_some());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_after_final_batch() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        seed(&store, &["agg-1"]).await;

        let config = OutboxRelayConfig::default().with_poll_interval(Duration::from_secs(3600));
        let relay = OutboxRelay::with_config(store.clone(), publisher.clone(), config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { relay.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        seed(&store, &["agg-2"]).await;
        shutdown_tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(*publisher.sent.lock().unwrap(), vec!["agg-1", "agg-2"]);
    }

    #[test]
    fn config_defaults_are_reasonable() {
        let config = OutboxRelayConfig::default();

        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.batch_size, 100);
    }
}
