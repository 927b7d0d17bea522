//! Subscribe side of the transport
//!
//! A [`Channel`] keeps one listening connection on the configured database
//! channel and fans every decoded envelope out to the observers of its topic.
//! Observers run synchronously on the receive path, in registration order, so
//! a slow observer delays the next notification; observers that need
//! isolation should hand the payload off to their own task.

use crate::config::TransportOptions;
use crate::connection::{ConnectHook, ConnectionState, DisconnectHook, ResilientConnection};
use crate::db::{Notification, SharedConnection};
use crate::message::MessageEnvelope;
use crate::observer::ObserverSet;
use crate::{Error, Result};
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Callback type for message delivery
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// One observer's interest in one topic
pub struct Subscription {
    topic: String,
    on_message: MessageCallback,
}

impl Subscription {
    /// Topic this subscription listens to
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Keeps a subscription alive; dropping it unsubscribes
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    shared: Weak<Shared>,
    subscription: Option<Arc<Subscription>>,
}

impl SubscriptionHandle {
    /// Topic of the underlying subscription
    pub fn topic(&self) -> &str {
        self.subscription
            .as_deref()
            .map(Subscription::topic)
            .unwrap_or_default()
    }

    /// Stop receiving messages
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let (Some(subscription), Some(shared)) = (self.subscription.take(), self.shared.upgrade()) {
            shared.unsubscribe(&subscription);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Topic-multiplexing listener on one database channel
pub struct Channel {
    shared: Arc<Shared>,
    connection: ResilientConnection,
}

struct Shared {
    channel_name: String,
    topics: DashMap<String, Arc<ObserverSet<Subscription>>>,
    disposed: AtomicBool,
}

impl Shared {
    fn unsubscribe(&self, subscription: &Arc<Subscription>) {
        let set = self
            .topics
            .get(&subscription.topic)
            .map(|set| Arc::clone(set.value()));
        if let Some(set) = set {
            set.remove(subscription);
        }

        // subscribe adds under the entry guard, so a set seen empty here stays empty
        if self
            .topics
            .remove_if(&subscription.topic, |_, set| set.is_empty())
            .is_some()
        {
            trace!("Dropped empty topic {}", subscription.topic);
        }
    }

    fn dispatch(&self, notification: Notification) {
        let Some((topic, payload)) = MessageEnvelope::parse(&notification.payload) else {
            trace!(
                "Ignoring notification on {} that is not an envelope",
                notification.channel
            );
            return;
        };

        let observers = self.topics.get(&topic).map(|set| set.items());
        let Some(observers) = observers else {
            return;
        };

        for subscription in observers.iter() {
            (subscription.on_message)(&payload);
        }
    }
}

impl Channel {
    /// Create the subscribe side; nothing connects until `ensure_initialized`.
    pub fn new(options: &TransportOptions) -> Result<Self> {
        options.validate()?;

        let shared = Arc::new(Shared {
            channel_name: options.channel_name.clone(),
            topics: DashMap::new(),
            disposed: AtomicBool::new(false),
        });

        let on_connect: ConnectHook = {
            let shared = shared.clone();
            Arc::new(move |connection: SharedConnection, _cancel: CancellationToken| {
                let shared = shared.clone();
                async move {
                    let dispatcher = shared.clone();
                    connection.set_notification_handler(Arc::new(move |notification: Notification| {
                        dispatcher.dispatch(notification)
                    }));
                    connection.listen(&shared.channel_name).await?;
                    info!("Listening on channel {}", shared.channel_name);
                    Ok(())
                }
                .boxed()
            })
        };

        let on_disconnect: DisconnectHook = {
            let channel_name = options.channel_name.clone();
            Arc::new(move |_cancel: CancellationToken| {
                debug!("Stopped listening on channel {}", channel_name);
                async { Ok(()) }.boxed()
            })
        };

        let connection = ResilientConnection::new(
            "channel",
            options.connection_factory.clone(),
            on_connect,
            on_disconnect,
            options.reconnect_backoff,
        );

        Ok(Self { shared, connection })
    }

    /// Bring up the listening connection. Safe to call repeatedly.
    pub async fn ensure_initialized(&self, cancel: &CancellationToken) -> Result<()> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        self.connection.initialize(cancel).await
    }

    /// Register `on_message` for every message published on `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<String>, on_message: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }

        let subscription = Arc::new(Subscription {
            topic: topic.into(),
            on_message: Arc::new(on_message),
        });

        self.shared
            .topics
            .entry(subscription.topic.clone())
            .or_default()
            .add(subscription.clone());
        debug!("Subscribed to topic {}", subscription.topic);

        Ok(SubscriptionHandle {
            shared: Arc::downgrade(&self.shared),
            subscription: Some(subscription),
        })
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared
            .topics
            .get(topic)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Number of topics with at least one live subscription
    pub fn topic_count(&self) -> usize {
        self.shared.topics.len()
    }

    /// Database channel this instance listens on
    pub fn channel_name(&self) -> &str {
        &self.shared.channel_name
    }

    /// Lifecycle state of the listening connection
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Watch lifecycle state changes of the listening connection
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    /// Close the listening connection and drop every subscription. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Channel {} shutting down...", self.shared.channel_name);
        self.connection.dispose().await?;
        self.shared.topics.clear();
        info!("Channel {} shutdown complete", self.shared.channel_name);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &ResilientConnection {
        &self.connection
    }
}
