//! Background loop that runs a handler forever
//!
//! Each iteration invokes the handler to completion. A failed iteration (error
//! or panic) is logged and followed by a cancellable backoff sleep; a
//! successful one is followed immediately by the next. Only disposal stops
//! the loop.

use crate::backoff::Backoff;
use crate::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handler invoked once per iteration with the worker's cancellation token
pub type WorkerHandler = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Continuously running background task with failure isolation
pub struct RetryingWorker {
    name: Cow<'static, str>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl RetryingWorker {
    /// Spawn a worker with the default one-second retry window.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, handler: F) -> Self
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self::with_backoff(name, Backoff::default(), Arc::new(handler))
    }

    /// Spawn a worker with an explicit retry strategy.
    pub fn with_backoff(
        name: impl Into<Cow<'static, str>>,
        backoff: Backoff,
        handler: WorkerHandler,
    ) -> Self {
        let name = name.into();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(worker_loop(
            name.clone(),
            handler,
            backoff,
            shutdown.clone(),
        ));

        debug!("Worker {} started", name);

        Self {
            name,
            shutdown,
            handle: Mutex::new(Some(handle)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Worker name used in log output
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker has been asked to stop
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel the running iteration and wait for the loop to exit. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Worker(format!("worker {} panicked: {}", self.name, e)))?;
        }

        debug!("Worker {} stopped", self.name);
        Ok(())
    }
}

impl Drop for RetryingWorker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    name: Cow<'static, str>,
    handler: WorkerHandler,
    backoff: Backoff,
    shutdown: CancellationToken,
) {
    let mut failures: u32 = 0;

    while !shutdown.is_cancelled() {
        let iteration = AssertUnwindSafe(handler(shutdown.clone())).catch_unwind();

        let outcome = match iteration.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("handler panicked".to_string()),
        };

        if shutdown.is_cancelled() {
            break;
        }

        match outcome {
            Ok(()) => failures = 0,
            Err(e) => {
                let delay = backoff.next(failures);
                failures = failures.saturating_add(1);
                warn!("Worker {} iteration failed: {} (retrying in {:?})", name, e, delay);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    debug!("Worker {} loop exited", name);
}
