//! # pg-pubsub-core
//!
//! Resilient pub/sub transport over PostgreSQL LISTEN/NOTIFY.
//!
//! This crate provides:
//! - Topic subscriptions multiplexed on one database channel and one listening connection
//! - Concurrent publishing with batched `pg_notify` statements
//! - Transparent reconnection after connection loss
//!
//! ## Features
//! - `postgres` - Enable the PostgreSQL backend on `sqlx` (default)
//! - `memory` - Enable the in-process backend used for tests and single-node setups (default)

pub mod backoff;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod initializer;
pub mod message;
pub mod observer;
pub mod pubsub;
pub mod signal;
pub mod subscriber;
pub mod worker;
pub mod writer;

pub use backoff::Backoff;
pub use config::TransportOptions;
pub use connection::{ConnectionState, ResilientConnection};
pub use error::{Error, Result};
pub use initializer::SingleFlightInitializer;
pub use message::MessageEnvelope;
pub use observer::ObserverSet;
pub use pubsub::PubSub;
pub use signal::AsyncSignal;
pub use subscriber::{Channel, SubscriptionHandle};
pub use worker::RetryingWorker;
pub use writer::ChannelWriter;
