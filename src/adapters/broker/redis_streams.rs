//! Redis Streams broker adapter.
//!
//! Maps the exchange/queue model onto Redis Streams:
//!
//! - **Stream key**: `{prefix}:{exchange}:{routing_key}` (one stream per event type)
//! - **Queue**: a consumer group, created on each bound stream
//! - **Bindings**: Redis set `{prefix}:bindings:{queue}` holding stream keys
//! - **Publish**: `XADD MAXLEN ~ n` with `routing_key`, `message_id`, `persistent`, `body` fields
//! - **Consume**: `XREADGROUP` across every bound stream, own pending entries first
//! - **Ack**: `XACK`; a requeue nack leaves the entry pending for redelivery
//! - **Retention**: acked entries stay in the stream until approximate
//!   trimming on publish evicts the oldest ones
//!
//! Blocking reads run on a dedicated connection per consumer channel so they
//! never stall publishes multiplexed on the shared connection.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::foundation::{DomainError, ErrorCode, Timestamp};
use crate::ports::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery, OutboundMessage};

/// Default key prefix for every key this adapter writes.
pub const DEFAULT_KEY_PREFIX: &str = "bus";

/// Default approximate cap on entries kept per stream.
pub const DEFAULT_STREAM_MAX_LEN: usize = 100_000;

/// Connector for a Redis server acting as the message broker.
#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: redis::Client,
    consumer_name: String,
    key_prefix: String,
    stream_max_len: usize,
}

impl RedisStreamsBroker {
    /// Creates a connector. `consumer_name` identifies this process inside
    /// every consumer group and must be stable across restarts so pending
    /// entries are redelivered to it.
    pub fn new(redis_url: &str, consumer_name: impl Into<String>) -> Result<Self, DomainError> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            DomainError::new(ErrorCode::ValidationFailed, format!("Invalid Redis URL: {}", e))
        })?;

        Ok(Self {
            client,
            consumer_name: consumer_name.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            stream_max_len: DEFAULT_STREAM_MAX_LEN,
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Approximate number of entries each stream keeps. Publishing trims
    /// older entries, whether or not every group has read them.
    pub fn with_stream_max_len(mut self, max_len: usize) -> Self {
        self.stream_max_len = max_len;
        self
    }

    pub fn stream_max_len(&self) -> usize {
        self.stream_max_len
    }
}

#[async_trait]
impl BrokerConnector for RedisStreamsBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, DomainError> {
        let open = Arc::new(AtomicBool::new(true));
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error(e, &open))?;

        tracing::info!(consumer = %self.consumer_name, "Connected to Redis broker");

        Ok(Arc::new(RedisConnection {
            client: self.client.clone(),
            conn,
            keys: Keys::new(&self.key_prefix),
            consumer_name: self.consumer_name.clone(),
            stream_max_len: self.stream_max_len,
            open,
        }))
    }
}

/// Maps a Redis error, flagging the connection dead on transport failures.
fn map_redis_error(e: RedisError, open: &AtomicBool) -> DomainError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        open.store(false, Ordering::SeqCst);
        DomainError::broker_unavailable(format!("Redis unavailable: {}", e))
    } else {
        DomainError::new(ErrorCode::BrokerProtocol, format!("Redis command failed: {}", e))
    }
}

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn stream(&self, exchange: &str, routing_key: &str) -> String {
        format!("{}:{}:{}", self.prefix, exchange, routing_key)
    }

    fn exchanges(&self) -> String {
        format!("{}:exchanges", self.prefix)
    }

    fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn bindings(&self, queue: &str) -> String {
        format!("{}:bindings:{}", self.prefix, queue)
    }
}

/// Delivery tags carry everything `XACK` needs: `{entry_id}|{queue}|{stream}`.
fn encode_tag(entry_id: &str, queue: &str, stream: &str) -> String {
    format!("{}|{}|{}", entry_id, queue, stream)
}

fn decode_tag(tag: &str) -> Result<(&str, &str, &str), DomainError> {
    let mut parts = tag.splitn(3, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(id), Some(queue), Some(stream)) if !id.is_empty() && !stream.is_empty() => {
            Ok((id, queue, stream))
        }
        _ => Err(DomainError::new(
            ErrorCode::BrokerProtocol,
            format!("Malformed delivery tag: {}", tag),
        )),
    }
}

struct RedisConnection {
    client: redis::Client,
    conn: MultiplexedConnection,
    keys: Keys,
    consumer_name: String,
    stream_max_len: usize,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, DomainError> {
        if !self.is_open() {
            return Err(DomainError::broker_unavailable("Redis connection is closed"));
        }

        Ok(Box::new(RedisChannel {
            client: self.client.clone(),
            conn: self.conn.clone(),
            reader: Mutex::new(None),
            keys: self.keys.clone(),
            consumer_name: self.consumer_name.clone(),
            stream_max_len: self.stream_max_len,
            connection_open: self.open.clone(),
            pending_drained: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), DomainError> {
        // The multiplexed driver task ends when the last handle drops.
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct RedisChannel {
    client: redis::Client,
    conn: MultiplexedConnection,
    reader: Mutex<Option<MultiplexedConnection>>,
    keys: Keys,
    consumer_name: String,
    stream_max_len: usize,
    connection_open: Arc<AtomicBool>,
    /// False until this channel has re-read its own unacked entries.
    pending_drained: AtomicBool,
    closed: AtomicBool,
}

impl RedisChannel {
    fn ensure_open(&self) -> Result<MultiplexedConnection, DomainError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DomainError::channel_closed("Channel is closed"));
        }
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(DomainError::channel_closed("Redis connection was dropped"));
        }
        Ok(self.conn.clone())
    }

    fn map_err(&self, e: RedisError) -> DomainError {
        map_redis_error(e, &self.connection_open)
    }

    async fn reader(&self) -> Result<MultiplexedConnection, DomainError> {
        let mut slot = self.reader.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| self.map_err(e))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn read_group(
        &self,
        queue: &str,
        streams: &[String],
        start_id: &str,
        block: Option<Duration>,
    ) -> Result<Option<Delivery>, DomainError> {
        let mut reader = self.reader().await?;
        let ids = vec![start_id; streams.len()];

        let mut opts = StreamReadOptions::default()
            .group(queue, &self.consumer_name)
            .count(1);
        if let Some(wait) = block {
            // BLOCK 0 would wait forever.
            opts = opts.block((wait.as_millis() as usize).max(1));
        }

        let reply: Option<StreamReadReply> = reader
            .xread_options(streams, &ids[..], &opts)
            .await
            .map_err(|e| self.map_err(e))?;

        let redelivered = start_id == "0";
        Ok(reply.and_then(|reply| {
            reply.keys.into_iter().find_map(|stream| {
                let key = stream.key;
                stream
                    .ids
                    .into_iter()
                    .find(|entry| !entry.map.is_empty())
                    .map(|entry| to_delivery(&key, queue, entry, redelivered))
            })
        }))
    }
}

fn to_delivery(stream: &str, queue: &str, entry: StreamId, redelivered: bool) -> Delivery {
    let field = |name: &str| entry.get::<String>(name).unwrap_or_default();

    Delivery {
        delivery_tag: encode_tag(&entry.id, queue, stream),
        routing_key: field("routing_key"),
        body: field("body"),
        message_id: field("message_id"),
        redelivered,
        received_at: Timestamp::now(),
    }
}

#[async_trait]
impl BrokerChannel for RedisChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), DomainError> {
        let mut conn = self.ensure_open()?;
        let _: () = conn
            .sadd(self.keys.exchanges(), exchange)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), DomainError> {
        let mut conn = self.ensure_open()?;
        let _: () = conn
            .sadd(self.keys.queues(), queue)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DomainError> {
        let mut conn = self.ensure_open()?;
        let stream = self.keys.stream(exchange, routing_key);

        let created: Result<(), RedisError> =
            conn.xgroup_create_mkstream(&stream, queue, "$").await;
        match created {
            Ok(()) => {}
            // Group survives reconnects; keep its pending entries.
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(self.map_err(e)),
        }

        let _: () = conn
            .sadd(self.keys.bindings(queue), &stream)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DomainError> {
        let mut conn = self.ensure_open()?;
        let stream = self.keys.stream(exchange, routing_key);

        let _: () = conn
            .srem(self.keys.bindings(queue), &stream)
            .await
            .map_err(|e| self.map_err(e))?;

        // Dropping the group stops messages accumulating for an unbound queue.
        let destroyed: Result<i64, RedisError> = conn.xgroup_destroy(&stream, queue).await;
        if let Err(e) = destroyed {
            tracing::warn!(stream = %stream, queue = %queue, error = %e, "Failed to destroy consumer group");
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<(), DomainError> {
        let mut conn = self.ensure_open()?;
        let stream = self.keys.stream(exchange, &message.routing_key);
        let persistent = if message.persistent { "1" } else { "0" };

        let _: String = conn
            .xadd_maxlen(
                &stream,
                StreamMaxlen::Approx(self.stream_max_len),
                "*",
                &[
                    ("routing_key", message.routing_key.as_str()),
                    ("message_id", message.message_id.as_str()),
                    ("persistent", persistent),
                    ("body", message.body.as_str()),
                ],
            )
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn next_delivery(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, DomainError> {
        let mut conn = self.ensure_open()?;
        let streams: Vec<String> = conn
            .smembers(self.keys.bindings(queue))
            .await
            .map_err(|e| self.map_err(e))?;

        if streams.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(None);
        }

        if !self.pending_drained.load(Ordering::SeqCst) {
            if let Some(delivery) = self.read_group(queue, &streams, "0", None).await? {
                return Ok(Some(delivery));
            }
            self.pending_drained.store(true, Ordering::SeqCst);
        }

        self.read_group(queue, &streams, ">", Some(wait)).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), DomainError> {
        let mut conn = self.ensure_open()?;
        let (id, queue, stream) = decode_tag(&delivery.delivery_tag)?;

        let _: i64 = conn
            .xack(stream, queue, &[id])
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), DomainError> {
        if requeue {
            // Left pending; the next read of own pending entries picks it up again.
            self.ensure_open()?;
            decode_tag(&delivery.delivery_tag)?;
            self.pending_drained.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.ack(delivery).await
    }

    async fn close(&self) -> Result<(), DomainError> {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_tag_round_trips_stream_with_separators() {
        let tag = encode_tag("1700000000000-0", "billing", "bus:orders:order.created");

        let (id, queue, stream) = decode_tag(&tag).unwrap();
        assert_eq!(id, "1700000000000-0");
        assert_eq!(queue, "billing");
        assert_eq!(stream, "bus:orders:order.created");
    }

    #[test]
    fn malformed_delivery_tag_is_rejected() {
        let err = decode_tag("no-separators").unwrap_err();
        assert_eq!(err.code, ErrorCode::BrokerProtocol);
    }

    #[test]
    fn keys_are_namespaced_by_prefix() {
        let keys = Keys::new("bus");

        assert_eq!(keys.stream("orders", "order.created"), "bus:orders:order.created");
        assert_eq!(keys.bindings("billing"), "bus:bindings:billing");
        assert_eq!(keys.exchanges(), "bus:exchanges");
    }

    #[test]
    fn invalid_url_is_rejected() {
        let result = RedisStreamsBroker::new("not a url", "worker-1");
        assert!(result.is_err());
    }

    #[test]
    fn key_prefix_is_configurable() {
        let broker = RedisStreamsBroker::new("redis://localhost:6379", "worker-1")
            .unwrap()
            .with_key_prefix("orders-svc");
        assert_eq!(broker.key_prefix, "orders-svc");
    }

    #[test]
    fn stream_max_len_defaults_and_overrides() {
        let broker = RedisStreamsBroker::new("redis://localhost:6379", "worker-1").unwrap();
        assert_eq!(broker.stream_max_len(), DEFAULT_STREAM_MAX_LEN);

        let broker = broker.with_stream_max_len(5_000);
        assert_eq!(broker.stream_max_len(), 5_000);
    }
}
