//! Self-healing connection wrapper
//!
//! ```text
//! Uninitialized ──initialize──► Connecting ──► Connected
//!                                   ▲              │ connection closed
//!                                   │              ▼
//!                                   └──dispatch── Disconnected (on_disconnect)
//!
//! any state ──dispose──► Disposed
//! ```
//!
//! The first connect goes through a [`SingleFlightInitializer`]. Every later
//! connect is a dispatched run of the same handler, so a failing factory is
//! retried with the configured backoff until a connection is obtained.
//! Replaced handles are closed and never reused.

use crate::backoff::Backoff;
use crate::db::{ConnectionFactory, SharedConnection};
use crate::initializer::SingleFlightInitializer;
use crate::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Hook run on every freshly obtained connection before it is exposed
pub type ConnectHook =
    Arc<dyn Fn(SharedConnection, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Hook run once per lost connection, and on disposal
pub type DisconnectHook = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Lifecycle state of a [`ResilientConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
    Disposed,
}

/// Connection that transparently replaces itself after a drop
pub struct ResilientConnection {
    inner: Arc<Inner>,
}

struct Inner {
    name: Cow<'static, str>,
    factory: Arc<dyn ConnectionFactory>,
    on_connect: ConnectHook,
    on_disconnect: DisconnectHook,
    current: RwLock<Option<SharedConnection>>,
    state: watch::Sender<ConnectionState>,
    initializer: SingleFlightInitializer,
    shutdown: CancellationToken,
    watchers: TaskTracker,
    disposed: AtomicBool,
}

impl ResilientConnection {
    /// Create a connection wrapper; nothing connects until `initialize`.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        factory: Arc<dyn ConnectionFactory>,
        on_connect: ConnectHook,
        on_disconnect: DisconnectHook,
        backoff: Backoff,
    ) -> Self {
        let name = name.into();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let initializer = SingleFlightInitializer::with_backoff(
                format!("{}-connect", name),
                backoff,
                Arc::new(move |cancel: CancellationToken| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(inner) => inner.connect(cancel).await,
                            None => Err(Error::Disposed),
                        }
                    }
                    .boxed()
                }),
            );

            Inner {
                name,
                factory,
                on_connect,
                on_disconnect,
                current: RwLock::new(None),
                state: watch::Sender::new(ConnectionState::Uninitialized),
                initializer,
                shutdown: CancellationToken::new(),
                watchers: TaskTracker::new(),
                disposed: AtomicBool::new(false),
            }
        });

        Self { inner }
    }

    /// Connect once; concurrent and repeated calls share the first outcome.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        self.inner.initializer.initialize(cancel).await
    }

    /// The live connection handle
    pub fn connection(&self) -> Result<SharedConnection> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        self.inner
            .current
            .read()
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Stop reconnecting, run `on_disconnect` and close the live handle. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.shutdown.cancel();
        self.inner.initializer.dispose().await?;
        self.inner.watchers.close();
        self.inner.watchers.wait().await;

        let current = self.inner.current.write().take();
        if let Some(connection) = current {
            if let Err(e) = (self.inner.on_disconnect)(CancellationToken::new()).await {
                warn!("{}: disconnect hook failed during dispose: {}", self.inner.name, e);
            }
            connection.close().await;
        }

        self.inner.state.send_replace(ConnectionState::Disposed);
        info!("{}: connection disposed", self.inner.name);
        Ok(())
    }
}

impl Drop for ResilientConnection {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn connect(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.state.send_replace(ConnectionState::Connecting);

        let result = tokio::select! {
            res = self.establish(&cancel) => res,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        match result {
            Ok(connection) => {
                self.state.send_replace(ConnectionState::Connected);
                self.watch(connection);
                info!("{}: connected", self.name);
                Ok(())
            }
            Err(e) => {
                if !self.shutdown.is_cancelled() {
                    self.state.send_replace(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    async fn establish(&self, cancel: &CancellationToken) -> Result<SharedConnection> {
        let connection = self.factory.connect(cancel.clone()).await?;
        if !connection.is_open() {
            connection.open().await?;
        }

        if let Err(e) = (self.on_connect)(connection.clone(), cancel.clone()).await {
            connection.close().await;
            return Err(e);
        }

        if self.shutdown.is_cancelled() {
            connection.close().await;
            return Err(Error::Disposed);
        }

        let previous = self.current.write().replace(connection.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }

        Ok(connection)
    }

    fn watch(self: &Arc<Self>, connection: SharedConnection) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        self.watchers.spawn(async move {
            tokio::select! {
                _ = connection.closed() => {}
                _ = shutdown.cancelled() => return,
            }
            if let Some(inner) = weak.upgrade() {
                inner.handle_disconnect(&connection).await;
            }
        });
    }

    async fn handle_disconnect(&self, connection: &SharedConnection) {
        let is_current = self
            .current
            .read()
            .as_ref()
            .is_some_and(|current| same_connection(current, connection));
        if !is_current || self.shutdown.is_cancelled() {
            return;
        }

        warn!("{}: connection lost, reconnecting", self.name);
        self.state.send_replace(ConnectionState::Disconnected);

        if let Err(e) = (self.on_disconnect)(self.shutdown.child_token()).await {
            warn!("{}: disconnect hook failed: {}", self.name, e);
        }

        if let Err(e) = self.initializer.dispatch() {
            debug!("{}: reconnect not scheduled: {}", self.name, e);
        }
    }
}

fn same_connection(a: &SharedConnection, b: &SharedConnection) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
