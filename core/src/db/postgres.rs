//! PostgreSQL backend
//!
//! Each [`PostgresConnection`] owns one `PgListener` inside a driver task.
//! Statements are sent to the driver over a command queue, so `LISTEN` and
//! `pg_notify` share the connection with the notification stream. Received
//! notifications are handed to the installed handler from the driver loop,
//! one at a time. When the server connection is lost the driver exits and the
//! handle reports itself closed; reconnecting is the caller's job.

use super::{Connection, ConnectionFactory, Notification, NotificationHandler, SharedConnection};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const COMMAND_QUEUE_SIZE: usize = 64;

enum Command {
    Listen {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Notify {
        channel: String,
        payloads: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Creates [`PostgresConnection`]s from connect options
#[derive(Clone)]
pub struct PostgresConnectionFactory {
    options: PgConnectOptions,
}

impl PostgresConnectionFactory {
    /// Create a factory from a database URL
    pub fn new(database_url: &str) -> Result<Self> {
        Ok(Self::from_options(PgConnectOptions::from_str(database_url)?))
    }

    /// Create a factory from parsed connect options
    pub fn from_options(options: PgConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ConnectionFactory for PostgresConnectionFactory {
    async fn connect(&self, cancel: CancellationToken) -> Result<SharedConnection> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(Arc::new(PostgresConnection::new(self.options.clone())) as SharedConnection)
    }
}

/// One PostgreSQL session used for LISTEN/NOTIFY
pub struct PostgresConnection {
    options: PgConnectOptions,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    handler: Arc<Mutex<Option<NotificationHandler>>>,
    open: Arc<AtomicBool>,
    closed: CancellationToken,
    opening: tokio::sync::Mutex<()>,
}

impl PostgresConnection {
    /// Create an unopened connection
    pub fn new(options: PgConnectOptions) -> Self {
        Self {
            options,
            commands: Mutex::new(None),
            handler: Arc::new(Mutex::new(None)),
            open: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
            opening: tokio::sync::Mutex::new(()),
        }
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let sender = self
            .commands
            .lock()
            .clone()
            .ok_or(Error::ConnectionClosed)?;

        let (tx, rx) = oneshot::channel();
        sender
            .send(command(tx))
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<()> {
        let _opening = self.opening.lock().await;
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        if self.is_open() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(self.options.clone())
            .await?;
        let mut listener = PgListener::connect_with(&pool).await?;
        // a lost session must surface as `Ok(None)`, not be re-established here
        listener.eager_reconnect(false);

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        *self.commands.lock() = Some(tx);
        self.open.store(true, Ordering::SeqCst);

        let handler = self.handler.clone();
        let open = self.open.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            driver_loop(listener, rx, handler).await;
            open.store(false, Ordering::SeqCst);
            closed.cancel();
            pool.close().await;
            debug!("PostgreSQL connection driver stopped");
        });

        debug!("PostgreSQL connection opened");
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<()> {
        let channel = channel.to_string();
        self.request(|reply| Command::Listen { channel, reply }).await
    }

    async fn notify(&self, channel: &str, payloads: &[String]) -> Result<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let channel = channel.to_string();
        let payloads = payloads.to_vec();
        self.request(|reply| Command::Notify {
            channel,
            payloads,
            reply,
        })
        .await
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) {
        let sender = self.commands.lock().take();
        match sender {
            Some(sender) => {
                let _ = sender.send(Command::Close).await;
                self.closed.cancelled().await;
            }
            None => {
                self.open.store(false, Ordering::SeqCst);
                self.closed.cancel();
            }
        }
    }
}

async fn driver_loop(
    mut listener: PgListener,
    mut commands: mpsc::Receiver<Command>,
    handler: Arc<Mutex<Option<NotificationHandler>>>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Listen { channel, reply }) => {
                    let res = listener.listen(&channel).await.map_err(Error::from);
                    let lost = res.as_ref().is_err_and(is_connection_lost);
                    let _ = reply.send(res);
                    if lost {
                        error!("PostgreSQL connection lost during LISTEN");
                        break;
                    }
                }
                Some(Command::Notify { channel, payloads, reply }) => {
                    let res = execute_notify(&mut listener, &channel, &payloads).await;
                    let lost = res.as_ref().is_err_and(is_connection_lost);
                    let _ = reply.send(res);
                    if lost {
                        error!("PostgreSQL connection lost during NOTIFY");
                        break;
                    }
                }
                Some(Command::Close) | None => break,
            },
            received = listener.try_recv() => match received {
                Ok(Some(notification)) => {
                    let current = handler.lock().clone();
                    if let Some(handler) = current {
                        handler(Notification {
                            channel: notification.channel().to_string(),
                            payload: notification.payload().to_string(),
                        });
                    }
                }
                Ok(None) => {
                    warn!("PostgreSQL connection lost");
                    break;
                }
                Err(e) => {
                    error!("PostgreSQL listener error: {}", e);
                    break;
                }
            },
        }
    }
}

/// Errors after which the session cannot be used again
fn is_connection_lost(error: &Error) -> bool {
    matches!(
        error,
        Error::Database(
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolClosed
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::WorkerCrashed
        )
    )
}

/// Build `SELECT pg_notify($1, $2), pg_notify($1, $3), ...`
fn notify_statement(count: usize) -> String {
    let mut sql = String::from("SELECT ");
    for i in 0..count {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&format!("pg_notify($1, ${})", i + 2));
    }
    sql
}

async fn execute_notify(listener: &mut PgListener, channel: &str, payloads: &[String]) -> Result<()> {
    let sql = notify_statement(payloads.len());
    let mut query = sqlx::query(&sql).bind(channel);
    for payload in payloads {
        query = query.bind(payload);
    }
    query.execute(listener).await?;
    Ok(())
}
