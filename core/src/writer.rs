//! Publish side of the transport
//!
//! Sends are queued on a bounded Tokio channel and drained by a background
//! worker that writes up to `max_send_batch_size` envelopes per statement.
//! Every caller waits for the batch carrying its envelope, so a completed
//! `send` means the notification was handed to the database.

use crate::config::TransportOptions;
use crate::connection::{ConnectHook, ConnectionState, DisconnectHook, ResilientConnection};
use crate::db::SharedConnection;
use crate::message::MessageEnvelope;
use crate::worker::RetryingWorker;
use crate::{Error, Result};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct PendingSend {
    payload: String,
    reply: oneshot::Sender<Result<()>>,
}

type SendQueue = Arc<Mutex<mpsc::Receiver<PendingSend>>>;

/// Concurrent-safe publisher on one database channel
pub struct ChannelWriter {
    channel_name: Arc<str>,
    max_message_payload_size: usize,
    tx: mpsc::Sender<PendingSend>,
    rx: SendQueue,
    connection: Arc<ResilientConnection>,
    worker: RetryingWorker,
    disposed: AtomicBool,
}

impl ChannelWriter {
    /// Create the publish side and start its send worker.
    ///
    /// Must be called from within a Tokio runtime. Nothing connects until
    /// `initialize`.
    pub fn new(options: &TransportOptions) -> Result<Self> {
        options.validate()?;

        let channel_name: Arc<str> = Arc::from(options.channel_name.as_str());

        let on_connect: ConnectHook = {
            let channel_name = channel_name.clone();
            Arc::new(move |_connection: SharedConnection, _cancel: CancellationToken| {
                debug!("Writer connected for channel {}", channel_name);
                async { Ok(()) }.boxed()
            })
        };
        let on_disconnect: DisconnectHook = {
            let channel_name = channel_name.clone();
            Arc::new(move |_cancel: CancellationToken| {
                debug!("Writer disconnected from channel {}", channel_name);
                async { Ok(()) }.boxed()
            })
        };

        let connection = Arc::new(ResilientConnection::new(
            "writer",
            options.connection_factory.clone(),
            on_connect,
            on_disconnect,
            options.reconnect_backoff,
        ));

        let (tx, rx) = mpsc::channel(options.max_send_queue_size);
        let rx: SendQueue = Arc::new(Mutex::new(rx));

        let worker = {
            let rx = rx.clone();
            let connection = connection.clone();
            let channel_name = channel_name.clone();
            let batch_size = options.max_send_batch_size;
            RetryingWorker::with_backoff(
                "writer",
                options.reconnect_backoff,
                Arc::new(move |cancel: CancellationToken| {
                    write_next_batch(
                        rx.clone(),
                        connection.clone(),
                        channel_name.clone(),
                        batch_size,
                        cancel,
                    )
                    .boxed()
                }),
            )
        };

        info!(
            "ChannelWriter started with batch_size={}, queue_size={}",
            options.max_send_batch_size, options.max_send_queue_size
        );

        Ok(Self {
            channel_name,
            max_message_payload_size: options.max_message_payload_size,
            tx,
            rx,
            connection,
            worker,
            disposed: AtomicBool::new(false),
        })
    }

    /// Bring up the write connection. Safe to call repeatedly.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        self.connection.initialize(cancel).await
    }

    /// Publish `payload` on `topic` and wait until it was handed to the database.
    pub async fn send(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let envelope = MessageEnvelope::create(topic, payload, self.max_message_payload_size)?;
        self.send_envelope(envelope, cancel).await
    }

    /// Serialize `value` as JSON and publish it on `topic`.
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        topic: impl Into<String>,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.send(topic, payload, cancel).await
    }

    /// Publish an already encoded envelope.
    pub async fn send_envelope(
        &self,
        envelope: MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let size = envelope.formatted_payload().len();
        if size > self.max_message_payload_size {
            return Err(Error::MessageTooLarge {
                size,
                max: self.max_message_payload_size,
            });
        }

        let (reply, done) = oneshot::channel();
        let pending = PendingSend {
            payload: envelope.into_formatted_payload(),
            reply,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            sent = self.tx.send(pending) => sent.map_err(|_| Error::Disposed)?,
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = done => result.unwrap_or(Err(Error::Disposed)),
        }
    }

    /// Database channel this writer publishes on
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Lifecycle state of the write connection
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Watch lifecycle state changes of the write connection
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    /// Stop the send worker, fail queued sends and release the connection.
    /// Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("ChannelWriter shutting down...");
        self.worker.dispose().await?;

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut dropped = 0usize;
        while let Ok(pending) = rx.try_recv() {
            let _ = pending.reply.send(Err(Error::Disposed));
            dropped += 1;
        }
        drop(rx);
        if dropped > 0 {
            debug!("Failed {} queued sends on shutdown", dropped);
        }

        self.connection.dispose().await?;
        info!("ChannelWriter shutdown complete");
        Ok(())
    }
}

async fn write_next_batch(
    rx: SendQueue,
    connection: Arc<ResilientConnection>,
    channel_name: Arc<str>,
    batch_size: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let mut rx = rx.lock().await;

    // Wait for the first send
    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        next = rx.recv() => next,
    };
    let Some(first) = first else {
        cancel.cancelled().await;
        return Ok(());
    };

    // Fill the batch without waiting, skipping callers that gave up
    let mut batch = Vec::with_capacity(batch_size);
    if !first.reply.is_closed() {
        batch.push(first);
    }
    while batch.len() < batch_size {
        match rx.try_recv() {
            Ok(pending) if pending.reply.is_closed() => continue,
            Ok(pending) => batch.push(pending),
            Err(_) => break,
        }
    }
    drop(rx);

    if batch.is_empty() {
        return Ok(());
    }

    debug!("Writing batch of {} messages", batch.len());
    let payloads: Vec<String> = batch.iter().map(|pending| pending.payload.clone()).collect();

    let result = match live_connection(&connection, &cancel).await {
        Ok(current) => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Disposed),
                written = current.notify(&channel_name, &payloads) => written,
            }
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            for pending in batch {
                let _ = pending.reply.send(Ok(()));
            }
            Ok(())
        }
        Err(e) => {
            warn!("Failed to write batch of {} messages: {}", batch.len(), e);
            for pending in batch {
                let _ = pending.reply.send(Err(replicate(&e)));
            }
            // Back off while the connection is being replaced
            if e.is_transient() { Err(e) } else { Ok(()) }
        }
    }
}

/// Wait until the connection is up and its handle is open.
///
/// A drop that is still being recovered holds the batch instead of failing it.
async fn live_connection(
    connection: &ResilientConnection,
    cancel: &CancellationToken,
) -> Result<SharedConnection> {
    let mut states = connection.subscribe_state();

    loop {
        let state = *states.borrow_and_update();
        match state {
            ConnectionState::Uninitialized => return Err(Error::NotInitialized),
            ConnectionState::Disposed => return Err(Error::Disposed),
            ConnectionState::Connected => {
                let current = connection.connection()?;
                if current.is_open() {
                    return Ok(current);
                }
                // closed but the watcher has not reported it yet
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Disposed),
                    _ = current.closed() => {}
                }
            }
            ConnectionState::Disconnected => {
                // the initial connect failed; nothing will reconnect
                if matches!(connection.connection(), Err(Error::NotInitialized)) {
                    return Err(Error::NotInitialized);
                }
            }
            ConnectionState::Connecting => {}
        }

        debug!("Holding batch until the writer connection is back ({:?})", state);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Disposed),
            changed = states.changed() => changed.map_err(|_| Error::Disposed)?,
        }
    }
}

/// Per-caller copy of a batch failure
fn replicate(error: &Error) -> Error {
    match error {
        Error::Disposed => Error::Disposed,
        Error::NotInitialized => Error::NotInitialized,
        Error::Cancelled => Error::Cancelled,
        Error::ConnectionClosed => Error::ConnectionClosed,
        Error::Initialization(cause) => Error::Initialization(cause.clone()),
        other => Error::Connection(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Channel;
    use crate::backoff::Backoff;
    use crate::db::memory::{MemoryBroker, MemoryConnectionFactory};
    use crate::test_util::eventually;
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;

    struct Pair {
        factory: Arc<MemoryConnectionFactory>,
        channel: Channel,
        writer: Arc<ChannelWriter>,
    }

    async fn pair(options: impl FnOnce(TransportOptions) -> TransportOptions) -> Pair {
        let factory = MemoryConnectionFactory::new(MemoryBroker::new());
        let options = options(
            TransportOptions::new(factory.clone())
                .reconnect_backoff(Backoff::fixed(Duration::from_millis(10))),
        );

        let token = CancellationToken::new();
        let channel = Channel::new(&options).unwrap();
        channel.ensure_initialized(&token).await.unwrap();
        let writer = Arc::new(ChannelWriter::new(&options).unwrap());
        writer.initialize(&token).await.unwrap();

        Pair {
            factory,
            channel,
            writer,
        }
    }

    fn collect(channel: &Channel, topic: &str) -> (Arc<SyncMutex<Vec<String>>>, crate::SubscriptionHandle) {
        let received = Arc::new(SyncMutex::new(Vec::new()));
        let sink = received.clone();
        let handle = channel
            .subscribe(topic, move |payload: &str| sink.lock().push(payload.to_string()))
            .unwrap();
        (received, handle)
    }

    #[tokio::test]
    async fn test_send_reaches_subscriber() {
        let p = pair(|o| o).await;
        let (received, _handle) = collect(&p.channel, "test");

        p.writer
            .send("test", "foobar", &CancellationToken::new())
            .await
            .unwrap();

        eventually(|| received.lock().len() == 1).await;
        assert_eq!(*received.lock(), vec!["foobar"]);

        p.writer.dispose().await.unwrap();
        p.channel.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_json() {
        let p = pair(|o| o).await;
        let (received, _handle) = collect(&p.channel, "events");

        p.writer
            .send_json(
                "events",
                &serde_json::json!({"type": "created", "id": 7}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        eventually(|| received.lock().len() == 1).await;
        let value: serde_json::Value = serde_json::from_str(&received.lock()[0]).unwrap();
        assert_eq!(value["type"], "created");
        assert_eq!(value["id"], 7);

        p.writer.dispose().await.unwrap();
        p.channel.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_are_all_delivered() {
        let p = pair(|o| o.max_send_batch_size(16)).await;
        let (received, _handle) = collect(&p.channel, "test");

        let mut callers = Vec::new();
        for caller in 0..10 {
            let writer = p.writer.clone();
            callers.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                for i in 0..100 {
                    writer
                        .send("test", format!("{caller}-{i}"), &token)
                        .await
                        .unwrap();
                }
            }));
        }
        for caller in callers {
            caller.await.unwrap();
        }

        eventually(|| received.lock().len() == 1000).await;
        let mut unique = received.lock().clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 1000);

        p.writer.dispose().await.unwrap();
        p.channel.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_preserves_order_for_one_caller() {
        let p = pair(|o| o.max_send_batch_size(3)).await;
        let (received, _handle) = collect(&p.channel, "test");

        let token = CancellationToken::new();
        let sends = (0..10).map(|i| p.writer.send("test", i.to_string(), &token));
        for result in futures::future::join_all(sends).await {
            result.unwrap();
        }

        eventually(|| received.lock().len() == 10).await;
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(*received.lock(), expected);

        p.writer.dispose().await.unwrap();
        p.channel.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_messages() {
        let p = pair(|o| o.max_message_payload_size(64)).await;
        let token = CancellationToken::new();

        let result = p.writer.send("test", "x".repeat(64), &token).await;
        assert!(matches!(result, Err(Error::MessageTooLarge { max: 64, .. })));

        let envelope = MessageEnvelope::create("test", "x".repeat(64), 8000).unwrap();
        let result = p.writer.send_envelope(envelope, &token).await;
        assert!(matches!(result, Err(Error::MessageTooLarge { max: 64, .. })));

        p.writer.dispose().await.unwrap();
        p.channel.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_initialize_fails() {
        let factory = MemoryConnectionFactory::new(MemoryBroker::new());
        let writer = ChannelWriter::new(&TransportOptions::new(factory)).unwrap();

        let result = writer.send("test", "early", &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::NotInitialized)));

        writer.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_send() {
        let p = pair(|o| o).await;
        let token = CancellationToken::new();
        token.cancel();

        let result = p.writer.send("test", "never", &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        p.writer.dispose().await.unwrap();
        p.channel.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_dispose_fails() {
        let p = pair(|o| o).await;
        p.writer.dispose().await.unwrap();
        p.writer.dispose().await.unwrap();

        let token = CancellationToken::new();
        assert!(matches!(
            p.writer.send("test", "late", &token).await,
            Err(Error::Disposed)
        ));
        assert!(matches!(p.writer.initialize(&token).await, Err(Error::Disposed)));
        assert_eq!(p.writer.state(), ConnectionState::Disposed);

        p.channel.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_recovers_after_connection_loss() {
        crate::test_util::init_tracing();
        let p = pair(|o| o).await;
        let (received, _handle) = collect(&p.channel, "test");

        p.factory.fail_next(2);
        p.factory.kill_all();
        eventually(|| {
            p.factory.created() == 4
                && p.writer.state() == ConnectionState::Connected
                && p.channel.state() == ConnectionState::Connected
        })
        .await;

        p.writer
            .send("test", "after reconnect", &CancellationToken::new())
            .await
            .unwrap();

        eventually(|| received.lock().len() == 1).await;
        assert_eq!(*received.lock(), vec!["after reconnect"]);

        p.writer.dispose().await.unwrap();
        p.channel.dispose().await.unwrap();
    }

    struct SplitPair {
        writer_factory: Arc<MemoryConnectionFactory>,
        channel: Channel,
        writer: ChannelWriter,
    }

    // listener and writer on separate factories, so only the writer can be dropped
    async fn split_pair(backoff: Duration) -> SplitPair {
        let broker = MemoryBroker::new();
        let writer_factory = MemoryConnectionFactory::new(broker.clone());
        let token = CancellationToken::new();

        let channel =
            Channel::new(&TransportOptions::new(MemoryConnectionFactory::new(broker))).unwrap();
        channel.ensure_initialized(&token).await.unwrap();

        let writer = ChannelWriter::new(
            &TransportOptions::new(writer_factory.clone())
                .reconnect_backoff(Backoff::fixed(backoff)),
        )
        .unwrap();
        writer.initialize(&token).await.unwrap();

        SplitPair {
            writer_factory,
            channel,
            writer,
        }
    }

    #[tokio::test]
    async fn test_send_waits_for_reconnect_in_progress() {
        let p = split_pair(Duration::from_millis(50)).await;
        let (received, _handle) = collect(&p.channel, "test");
        let token = CancellationToken::new();

        let mut states = p.writer.subscribe_state();
        p.writer_factory.fail_next(4);
        p.writer_factory.kill_all();
        states
            .wait_for(|state| *state != ConnectionState::Connected)
            .await
            .unwrap();

        p.writer.send("test", "foobar", &token).await.unwrap();
        assert_eq!(p.writer.state(), ConnectionState::Connected);
        assert_eq!(p.writer_factory.created(), 2);

        eventually(|| received.lock().len() == 1).await;
        assert_eq!(*received.lock(), vec!["foobar"]);

        p.writer.dispose().await.unwrap();
        p.channel.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_held_send_honours_caller_cancellation() {
        let p = split_pair(Duration::from_millis(10)).await;
        let token = CancellationToken::new();

        p.writer_factory.fail_next(usize::MAX);
        p.writer_factory.kill_all();
        let mut states = p.writer.subscribe_state();
        states
            .wait_for(|state| *state != ConnectionState::Connected)
            .await
            .unwrap();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                token.cancel();
            })
        };
        let result = p.writer.send("test", "never", &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        canceller.await.unwrap();

        p.writer.dispose().await.unwrap();
        assert_eq!(p.writer.state(), ConnectionState::Disposed);
        p.channel.dispose().await.unwrap();
    }

    #[test]
    fn test_replicate_keeps_kind() {
        assert!(matches!(replicate(&Error::Disposed), Error::Disposed));
        assert!(matches!(
            replicate(&Error::ConnectionClosed),
            Error::ConnectionClosed
        ));
        assert!(matches!(
            replicate(&Error::Worker("boom".into())),
            Error::Connection(_)
        ));
    }
}
