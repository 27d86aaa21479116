//! Broker configuration

use serde::Deserialize;

use super::error::{validate_name, ValidationError};
use crate::adapters::{RedisStreamsBroker, DEFAULT_KEY_PREFIX, DEFAULT_STREAM_MAX_LEN};
use crate::domain::foundation::DomainError;
use crate::ports::ConsumerTopology;

/// Broker configuration (Redis Streams)
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Redis connection URL
    pub url: String,

    /// Topic exchange every event is published to
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Inbound queue of this service; one per service, shared by its replicas
    pub queue: String,

    /// Consumer name within the queue; defaults to the queue name
    #[serde(default)]
    pub consumer_name: Option<String>,

    /// Prefix of every Redis key the broker creates
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Approximate entries kept per stream before publish trims the oldest
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,
}

impl BrokerConfig {
    pub fn topology(&self) -> ConsumerTopology {
        ConsumerTopology::new(&self.exchange, &self.queue)
    }

    pub fn consumer_name(&self) -> &str {
        self.consumer_name.as_deref().unwrap_or(&self.queue)
    }

    /// Builds the Redis Streams connector. Does not connect yet.
    pub fn connector(&self) -> Result<RedisStreamsBroker, DomainError> {
        Ok(RedisStreamsBroker::new(&self.url, self.consumer_name())?
            .with_key_prefix(&self.key_prefix)
            .with_stream_max_len(self.stream_max_len))
    }

    /// Validate broker configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::MissingRequired("BROKER_URL"));
        }
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(ValidationError::InvalidBrokerUrl);
        }
        validate_name("exchange", &self.exchange)?;
        validate_name("queue", &self.queue)?;
        validate_name("consumer", self.consumer_name())?;
        validate_name("key prefix", &self.key_prefix)?;
        if self.stream_max_len == 0 {
            return Err(ValidationError::InvalidStreamMaxLen);
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            exchange: default_exchange(),
            queue: String::new(),
            consumer_name: None,
            key_prefix: default_key_prefix(),
            stream_max_len: default_stream_max_len(),
        }
    }
}

fn default_exchange() -> String {
    "bus".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_stream_max_len() -> usize {
    DEFAULT_STREAM_MAX_LEN
}
