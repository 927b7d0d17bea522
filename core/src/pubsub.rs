//! High-level pub/sub API
//!
//! Pairs one [`Channel`] with one [`ChannelWriter`] over the same options:
//! - Topic subscriptions sharing a single listening connection
//! - Publishing from any number of concurrent callers
//! - Graceful shutdown

use crate::config::TransportOptions;
use crate::subscriber::{Channel, SubscriptionHandle};
use crate::writer::ChannelWriter;
use crate::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The main pub/sub engine
pub struct PubSub {
    channel: Channel,
    writer: ChannelWriter,
    shutdown: CancellationToken,
}

impl PubSub {
    /// Create both sides and connect them
    pub async fn start(options: TransportOptions) -> Result<Self> {
        let channel = Channel::new(&options)?;
        let writer = ChannelWriter::new(&options)?;
        let shutdown = CancellationToken::new();

        let started = async {
            channel.ensure_initialized(&shutdown).await?;
            writer.initialize(&shutdown).await
        }
        .await;

        if let Err(e) = started {
            let _ = writer.dispose().await;
            let _ = channel.dispose().await;
            return Err(e);
        }

        info!("PubSub engine started on channel {}", options.channel_name);

        Ok(Self {
            channel,
            writer,
            shutdown,
        })
    }

    /// Connect to a PostgreSQL database with default options
    #[cfg(feature = "postgres")]
    pub async fn postgres(database_url: &str) -> Result<Self> {
        Self::start(TransportOptions::postgres(database_url)?).await
    }

    /// Subscribe to messages published on `topic`
    ///
    /// The callback runs on the receive path; keep it short.
    pub fn subscribe<F>(&self, topic: impl Into<String>, on_message: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.channel.subscribe(topic, on_message)
    }

    /// Publish a message and wait until the database accepted it
    pub async fn publish(&self, topic: impl Into<String>, payload: impl Into<String>) -> Result<()> {
        self.writer.send(topic, payload, &self.shutdown).await
    }

    /// Publish a JSON-serialized value
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        self.writer.send_json(topic, value, &self.shutdown).await
    }

    /// Number of live subscriptions on `topic`
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.channel.subscriber_count(topic)
    }

    /// Subscribe side
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Publish side
    pub fn writer(&self) -> &ChannelWriter {
        &self.writer
    }

    /// Shutdown the pub/sub engine gracefully
    pub async fn shutdown(self) -> Result<()> {
        info!("PubSub engine shutting down...");
        self.shutdown.cancel();

        let writer = self.writer.dispose().await;
        if let Err(e) = &writer {
            error!("Error stopping writer: {}", e);
        }
        let channel = self.channel.dispose().await;
        if let Err(e) = &channel {
            error!("Error stopping channel: {}", e);
        }

        info!("PubSub engine shutdown complete");
        writer.and(channel)
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("channel", &self.channel.channel_name())
            .field("state", &self.channel.state())
            .finish_non_exhaustive()
    }
}
