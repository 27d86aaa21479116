//! ConnectionManager - Owns the process-wide broker connection.
//!
//! The connection is created lazily on first use, shared by every publisher
//! and consumer, and recreated after the broker drops it. Connecting is
//! serialized so concurrent callers never open duplicate connections.
//!
//! The manager never retries on its own: `ensure_connected` makes exactly
//! one attempt and returns the error, leaving the backoff to callers.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::domain::foundation::DomainError;
use crate::ports::{BrokerChannel, BrokerConnection, BrokerConnector, ConsumerTopology, QueueBinder};

/// Lazily connected, shared broker connection.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    topology: ConsumerTopology,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    connecting: Mutex<()>,
}

impl ConnectionManager {
    /// Creates a manager. `topology` names the exchange and the inbound
    /// queue this process consumes from and binds routing keys to.
    pub fn new(connector: Arc<dyn BrokerConnector>, topology: ConsumerTopology) -> Self {
        Self {
            connector,
            topology,
            current: RwLock::new(None),
            connecting: Mutex::new(()),
        }
    }

    pub fn topology(&self) -> &ConsumerTopology {
        &self.topology
    }

    fn snapshot(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace(&self, next: Option<Arc<dyn BrokerConnection>>) -> Option<Arc<dyn BrokerConnection>> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, next)
    }

    /// Returns the live connection, opening one if needed.
    ///
    /// Makes a single connect attempt; a failure is returned as is.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn BrokerConnection>, DomainError> {
        if let Some(conn) = self.snapshot().filter(|c| c.is_open()) {
            return Ok(conn);
        }

        let _guard = self.connecting.lock().await;

        // Another caller may have connected while we waited.
        if let Some(conn) = self.snapshot().filter(|c| c.is_open()) {
            return Ok(conn);
        }

        let conn = self.connector.connect().await.map_err(|e| {
            tracing::warn!(error = %e, "Broker connection attempt failed");
            e
        })?;
        if let Some(stale) = self.replace(Some(conn.clone())) {
            let _ = stale.close().await;
        }
        tracing::info!(exchange = %self.topology.exchange, "Broker connection established");

        Ok(conn)
    }

    /// True while a live connection is held.
    pub fn is_connected(&self) -> bool {
        self.snapshot().map_or(false, |c| c.is_open())
    }

    /// Opens a fresh channel for one-shot use (one publish).
    pub async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, DomainError> {
        let conn = self.ensure_connected().await?;
        conn.create_channel().await
    }

    /// Opens a long-lived consumer channel with the exchange and queue
    /// declared and every routing key bound.
    ///
    /// Called on start and again after a channel-level failure, so the
    /// bindings are re-established before consumption resumes.
    pub async fn open_consumer_channel(
        &self,
        topology: &ConsumerTopology,
        routing_keys: &[String],
    ) -> Result<Box<dyn BrokerChannel>, DomainError> {
        let channel = self.open_channel().await?;

        let declared = async {
            channel.declare_exchange(&topology.exchange).await?;
            channel.declare_queue(&topology.queue).await?;
            for key in routing_keys {
                channel
                    .bind_queue(&topology.queue, &topology.exchange, key)
                    .await?;
            }
            Ok::<(), DomainError>(())
        }
        .await;

        if let Err(e) = declared {
            let _ = channel.close().await;
            return Err(e);
        }

        tracing::debug!(
            queue = %topology.queue,
            bindings = routing_keys.len(),
            "Consumer channel ready"
        );
        Ok(channel)
    }

    /// Forgets a connection the broker reported dead. The next call reconnects.
    pub async fn invalidate(&self) {
        if let Some(conn) = self.replace(None) {
            tracing::warn!("Invalidating broker connection");
            let _ = conn.close().await;
        }
    }

    /// Closes the connection explicitly.
    pub async fn shutdown(&self) -> Result<(), DomainError> {
        let _guard = self.connecting.lock().await;
        match self.replace(None) {
            Some(conn) => {
                tracing::info!("Closing broker connection");
                conn.close().await
            }
            None => Ok(()),
        }
    }

    /// Channel with the consumer topology declared, used for binding changes.
    async fn topology_channel(&self) -> Result<Box<dyn BrokerChannel>, DomainError> {
        let channel = self.open_channel().await?;

        let declared = async {
            channel.declare_exchange(&self.topology.exchange).await?;
            channel.declare_queue(&self.topology.queue).await
        }
        .await;

        match declared {
            Ok(()) => Ok(channel),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl QueueBinder for ConnectionManager {
    async fn bind(&self, routing_key: &str) -> Result<(), DomainError> {
        let channel = self.topology_channel().await?;
        let result = channel
            .bind_queue(&self.topology.queue, &self.topology.exchange, routing_key)
            .await;
        let _ = channel.close().await;
        result
    }

    async fn unbind(&self, routing_key: &str) -> Result<(), DomainError> {
        let channel = self.topology_channel().await?;
        let result = channel
            .unbind_queue(&self.topology.queue, &self.topology.exchange, routing_key)
            .await;
        let _ = channel.close().await;
        result
    }
}
