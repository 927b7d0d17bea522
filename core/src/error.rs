//! Error types for pg-pubsub-core

use std::sync::Arc;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pg-pubsub-core
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encoded envelope does not fit into a single notification
    #[error("message too large: {size} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Operation invoked after the component was disposed
    #[error("component has been disposed")]
    Disposed,

    /// Operation requires a completed initialization
    #[error("component has not been initialized")]
    NotInitialized,

    /// Caller-requested or disposal-triggered cancellation
    #[error("operation was cancelled")]
    Cancelled,

    /// The connection dropped while an operation was using it
    #[error("connection closed")]
    ConnectionClosed,

    /// Backend-specific connectivity failure
    #[error("connection error: {0}")]
    Connection(String),

    /// The single initialization attempt failed; every caller sees the same cause
    #[error("initialization failed: {0}")]
    Initialization(#[source] Arc<Error>),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A background task panicked or could not be joined
    #[error("worker failure: {0}")]
    Worker(String),
}

impl Error {
    /// Whether this error represents cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Initialization(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    /// Whether retrying the operation on a fresh connection may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(_) | Error::ConnectionClosed | Error::Connection(_) => true,
            Error::Initialization(inner) => inner.is_transient(),
            _ => false,
        }
    }
}
