//! In-process notification backend
//!
//! [`MemoryBroker`] plays the role of the database: every open connection that
//! listens on a channel receives the notifications sent on it, in send order,
//! from its own receive task. Connections can be killed to simulate drops and
//! the factory can be told to fail, which is what the reconnect tests rely on.

use super::{Connection, ConnectionFactory, Notification, NotificationHandler, SharedConnection};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shared in-memory "database" routing notifications between connections
#[derive(Default)]
pub struct MemoryBroker {
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
}

impl MemoryBroker {
    /// Create a new broker
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an unopened connection attached to this broker
    pub fn connection(self: &Arc<Self>) -> Arc<MemoryConnection> {
        let connection = Arc::new(MemoryConnection {
            broker: self.clone(),
            open: AtomicBool::new(false),
            closed: CancellationToken::new(),
            channels: Mutex::new(HashSet::new()),
            handler: Arc::new(Mutex::new(None)),
            sender: Mutex::new(None),
        });
        self.register(&connection);
        connection
    }

    fn register(&self, connection: &Arc<MemoryConnection>) {
        self.connections.lock().push(Arc::downgrade(connection));
    }

    fn publish(&self, channel: &str, payloads: &[String]) {
        let mut connections = self.connections.lock();
        connections.retain(|weak| weak.strong_count() > 0);

        for connection in connections.iter().filter_map(Weak::upgrade) {
            if !connection.is_open() || !connection.channels.lock().contains(channel) {
                continue;
            }
            let sender = connection.sender.lock();
            if let Some(sender) = sender.as_ref() {
                for payload in payloads {
                    let _ = sender.send(Notification {
                        channel: channel.to_string(),
                        payload: payload.clone(),
                    });
                }
            }
        }
    }
}

/// Connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    open: AtomicBool,
    closed: CancellationToken,
    channels: Mutex<HashSet<String>>,
    handler: Arc<Mutex<Option<NotificationHandler>>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
}

impl MemoryConnection {
    /// Drop the connection as if the server went away
    pub fn kill(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!("Memory connection killed");
        self.open.store(false, Ordering::SeqCst);
        self.sender.lock().take();
        self.closed.cancel();
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        if self.is_open() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let handler = self.handler.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = rx.recv() => match notification {
                        Some(notification) => {
                            let current = handler.lock().clone();
                            if let Some(handler) = current {
                                handler(notification);
                            }
                        }
                        None => break,
                    },
                    _ = closed.cancelled() => break,
                }
            }
        });

        *self.sender.lock() = Some(tx);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.channels.lock().insert(channel.to_string());
        Ok(())
    }

    async fn notify(&self, channel: &str, payloads: &[String]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.broker.publish(channel, payloads);
        Ok(())
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) {
        self.kill();
    }
}

/// Factory handing out [`MemoryConnection`]s, with scripted failures
pub struct MemoryConnectionFactory {
    broker: Arc<MemoryBroker>,
    failures: AtomicUsize,
    created: AtomicUsize,
    open_on_create: AtomicBool,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
}

impl MemoryConnectionFactory {
    /// Create a factory for connections to `broker`
    pub fn new(broker: Arc<MemoryBroker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            failures: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            open_on_create: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Make the next `count` calls to `connect` fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Hand out connections that are already open
    pub fn open_on_create(&self, enabled: bool) {
        self.open_on_create.store(enabled, Ordering::SeqCst);
    }

    /// Number of connections created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Kill every live connection created by this factory
    pub fn kill_all(&self) {
        for connection in self.connections.lock().iter().filter_map(Weak::upgrade) {
            connection.kill();
        }
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(&self, cancel: CancellationToken) -> Result<SharedConnection> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let scripted_failure = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(Error::Connection("scripted connection failure".into()));
        }

        let connection = self.broker.connection();
        if self.open_on_create.load(Ordering::SeqCst) {
            connection.open().await?;
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().push(Arc::downgrade(&connection));
        Ok(connection as SharedConnection)
    }
}
