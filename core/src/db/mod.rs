//! Database connection capability
//!
//! The transport only needs a handful of operations from a physical
//! connection: open it, `LISTEN` on a channel, send notifications, receive
//! notifications, and learn when the connection dropped. Backends:
//! - `postgres` - `sqlx` PostgreSQL connection driven by a background task
//! - `memory` - in-process broker for tests and single-node setups

#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A notification received on a listened channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the notification was sent on
    pub channel: String,
    /// Raw notification payload
    pub payload: String,
}

/// Callback invoked for every received notification, in arrival order
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync + 'static>;

/// Shared handle to a physical connection
pub type SharedConnection = Arc<dyn Connection>;

/// One physical database connection
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Whether the connection is open and usable
    fn is_open(&self) -> bool;

    /// Open the connection. Calling it on an open connection is a no-op.
    async fn open(&self) -> Result<()>;

    /// Start receiving notifications sent on `channel`
    async fn listen(&self, channel: &str) -> Result<()>;

    /// Send each payload as one notification on `channel`, in a single statement
    async fn notify(&self, channel: &str, payloads: &[String]) -> Result<()>;

    /// Install the callback for received notifications, replacing any previous one
    fn set_notification_handler(&self, handler: NotificationHandler);

    /// Resolves once the connection has closed, for whatever reason
    async fn closed(&self);

    /// Close the connection
    async fn close(&self);
}

/// Produces fresh connections, opened or not
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Create a new connection
    async fn connect(&self, cancel: CancellationToken) -> Result<SharedConnection>;
}
