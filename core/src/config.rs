//! Configuration for pg-pubsub-core

use crate::backoff::Backoff;
use crate::db::ConnectionFactory;
use crate::message::ID_LENGTH;
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Default channel all topics are multiplexed on
pub const DEFAULT_CHANNEL_NAME: &str = "graphql_subscriptions";

/// PostgreSQL rejects NOTIFY payloads of 8000 bytes or more
pub const DEFAULT_MAX_MESSAGE_PAYLOAD_SIZE: usize = 7999;

/// Transport configuration shared by [`Channel`](crate::Channel) and
/// [`ChannelWriter`](crate::ChannelWriter)
#[derive(Clone)]
pub struct TransportOptions {
    /// Database channel used for every topic (default: "graphql_subscriptions")
    pub channel_name: String,

    /// Maximum encoded envelope size in bytes (default: 7999)
    pub max_message_payload_size: usize,

    /// Maximum envelopes sent in one statement (default: 256)
    pub max_send_batch_size: usize,

    /// Maximum envelopes waiting to be sent (default: 2048)
    pub max_send_queue_size: usize,

    /// Delay strategy between reconnect attempts (default: fixed 1s)
    pub reconnect_backoff: Backoff,

    /// Source of physical connections (required)
    pub connection_factory: Arc<dyn ConnectionFactory>,
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("channel_name", &self.channel_name)
            .field("max_message_payload_size", &self.max_message_payload_size)
            .field("max_send_batch_size", &self.max_send_batch_size)
            .field("max_send_queue_size", &self.max_send_queue_size)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .finish_non_exhaustive()
    }
}

impl TransportOptions {
    /// Create options around a connection factory
    pub fn new(connection_factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            max_message_payload_size: DEFAULT_MAX_MESSAGE_PAYLOAD_SIZE,
            max_send_batch_size: 256,
            max_send_queue_size: 2048,
            reconnect_backoff: Backoff::default(),
            connection_factory,
        }
    }

    /// Create options connecting to a PostgreSQL database URL
    #[cfg(feature = "postgres")]
    pub fn postgres(database_url: &str) -> Result<Self> {
        if !is_postgres_url(database_url) {
            return Err(Error::Config(format!(
                "Unsupported database URL: {}",
                database_url
            )));
        }
        let factory = crate::db::postgres::PostgresConnectionFactory::new(database_url)?;
        Ok(Self::new(Arc::new(factory)))
    }

    /// Builder pattern: set channel name
    pub fn channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    /// Builder pattern: set max message payload size
    pub fn max_message_payload_size(mut self, size: usize) -> Self {
        self.max_message_payload_size = size;
        self
    }

    /// Builder pattern: set max send batch size
    pub fn max_send_batch_size(mut self, size: usize) -> Self {
        self.max_send_batch_size = size;
        self
    }

    /// Builder pattern: set max send queue size
    pub fn max_send_queue_size(mut self, size: usize) -> Self {
        self.max_send_queue_size = size;
        self
    }

    /// Builder pattern: set reconnect backoff
    pub fn reconnect_backoff(mut self, backoff: Backoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Check the options for values the transport cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.channel_name.is_empty() {
            return Err(Error::Config("channel name must not be empty".into()));
        }
        // id, two separators and at least one byte of topic or payload
        if self.max_message_payload_size <= ID_LENGTH + 2 {
            return Err(Error::Config(format!(
                "max message payload size {} cannot hold an envelope",
                self.max_message_payload_size
            )));
        }
        if self.max_send_batch_size == 0 {
            return Err(Error::Config("max send batch size must be positive".into()));
        }
        if self.max_send_queue_size == 0 {
            return Err(Error::Config("max send queue size must be positive".into()));
        }
        Ok(())
    }
}

/// Check if a URL points at PostgreSQL
pub fn is_postgres_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}
