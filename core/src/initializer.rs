//! Run-once async initialization with follow-up dispatch
//!
//! State machine:
//! ```text
//! Idle ──initialize──► Initializing ──► Ready ──dispatch──► (handler re-run in background)
//!                            │
//!                            └────────► Failed
//! any state ──dispose──► Disposed
//! ```
//!
//! Every caller of [`SingleFlightInitializer::initialize`] observes the outcome
//! of the single handler run. Once ready, [`SingleFlightInitializer::dispatch`]
//! wakes a background worker that runs the handler again; dispatches that
//! arrive while a run is pending collapse into one, and a failed dispatched run
//! is retried after the worker's backoff.

use crate::backoff::Backoff;
use crate::signal::AsyncSignal;
use crate::worker::RetryingWorker;
use crate::{Error, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Handler shared by the initial run and every dispatched run
pub type InitHandler = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone, Debug)]
enum Outcome {
    Ready,
    Cancelled,
    Failed(Arc<Error>),
}

impl Outcome {
    fn into_result(self) -> Result<()> {
        match self {
            Outcome::Ready => Ok(()),
            Outcome::Cancelled => Err(Error::Cancelled),
            Outcome::Failed(e) => Err(Error::Initialization(e)),
        }
    }
}

enum State {
    Idle,
    Initializing(Shared<BoxFuture<'static, Outcome>>),
    Ready,
    Failed(Outcome),
    Disposed,
}

/// Guards an idempotent async setup action
pub struct SingleFlightInitializer {
    inner: Arc<Inner>,
}

struct Inner {
    name: Cow<'static, str>,
    handler: InitHandler,
    backoff: Backoff,
    state: Mutex<State>,
    signal: Arc<AsyncSignal>,
    worker: Mutex<Option<RetryingWorker>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SingleFlightInitializer {
    /// Wrap `handler`; dispatched re-runs retry with the default backoff.
    pub fn new<F>(name: impl Into<Cow<'static, str>>, handler: F) -> Self
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self::with_backoff(name, Backoff::default(), Arc::new(handler))
    }

    /// Wrap `handler` with an explicit retry strategy for dispatched runs.
    pub fn with_backoff(
        name: impl Into<Cow<'static, str>>,
        backoff: Backoff,
        handler: InitHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                handler,
                backoff,
                state: Mutex::new(State::Idle),
                signal: Arc::new(AsyncSignal::new()),
                worker: Mutex::new(None),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Run the handler unless it already ran, and wait for its outcome.
    ///
    /// Cancelling the token of the caller that started the run cancels the
    /// handler itself; any other caller's token only abandons its own wait.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let pending = {
            let mut state = self.inner.state.lock();
            match &*state {
                State::Disposed => return Err(Error::Disposed),
                State::Ready => return Ok(()),
                State::Failed(outcome) => return outcome.clone().into_result(),
                State::Initializing(pending) => pending.clone(),
                State::Idle => {
                    let pending = Inner::start(&self.inner, cancel.clone());
                    *state = State::Initializing(pending.clone());
                    pending
                }
            }
        };

        tokio::select! {
            outcome = pending => outcome.into_result(),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Re-run the handler in the background.
    ///
    /// A dispatch that arrives while the initial run is still in flight is
    /// held until that run succeeds, and dropped if the run fails.
    pub fn dispatch(&self) -> Result<()> {
        match &*self.inner.state.lock() {
            State::Disposed => Err(Error::Disposed),
            State::Ready | State::Initializing(_) => self.inner.signal.set(),
            State::Idle | State::Failed(_) => Err(Error::NotInitialized),
        }
    }

    /// Whether the initial run completed successfully
    pub fn is_initialized(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Ready)
    }

    /// Whether `dispose()` has been called
    pub fn is_disposed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Disposed)
    }

    /// Cancel in-flight runs and wait for them to unwind. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), State::Disposed);
        if matches!(previous, State::Disposed) {
            return Ok(());
        }

        self.inner.shutdown.cancel();

        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.dispose().await?;
        }
        self.inner.signal.dispose();

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        debug!("Initializer {} disposed", self.inner.name);
        Ok(())
    }
}

impl Drop for SingleFlightInitializer {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn start(this: &Arc<Self>, caller: CancellationToken) -> Shared<BoxFuture<'static, Outcome>> {
        let run = this.shutdown.child_token();
        let handler = this.handler.clone();
        let inner = this.clone();

        let handle = this.tasks.spawn(async move {
            let outcome = tokio::select! {
                res = handler(run.clone()) => match res {
                    Ok(()) => Outcome::Ready,
                    Err(e) if e.is_cancelled() => Outcome::Cancelled,
                    Err(e) => Outcome::Failed(Arc::new(e)),
                },
                _ = caller.cancelled() => {
                    run.cancel();
                    Outcome::Cancelled
                }
                _ = run.cancelled() => Outcome::Cancelled,
            };

            inner.complete(&outcome);
            outcome
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Outcome::Failed(Arc::new(Error::Worker(e.to_string()))))
        }
        .boxed()
        .shared()
    }

    fn complete(&self, outcome: &Outcome) {
        let mut state = self.state.lock();
        if !matches!(*state, State::Initializing(_)) {
            return;
        }

        match outcome {
            Outcome::Ready => {
                *self.worker.lock() = Some(self.spawn_dispatcher());
                *state = State::Ready;
                debug!("Initializer {} ready", self.name);
            }
            other => {
                warn!("Initializer {} did not complete: {:?}", self.name, other);
                *state = State::Failed(other.clone());
            }
        }
    }

    fn spawn_dispatcher(&self) -> RetryingWorker {
        let signal = self.signal.clone();
        let handler = self.handler.clone();

        RetryingWorker::with_backoff(
            format!("{}-dispatch", self.name),
            self.backoff,
            Arc::new(move |cancel: CancellationToken| {
                let signal = signal.clone();
                let handler = handler.clone();
                async move {
                    signal.wait(&cancel).await?;
                    if let Err(e) = handler(cancel.clone()).await {
                        // re-arm so the run is retried after the backoff
                        if !cancel.is_cancelled() {
                            let _ = signal.set();
                        }
                        return Err(e);
                    }
                    Ok(())
                }
                .boxed()
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting(runs: Arc<AtomicUsize>, delay: Duration) -> SingleFlightInitializer {
        SingleFlightInitializer::new("test", move |_cancel| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let init = Arc::new(counting(runs.clone(), Duration::from_millis(20)));
        let token = CancellationToken::new();

        let calls: Vec<_> = (0..10)
            .map(|_| {
                let init = init.clone();
                let token = token.clone();
                tokio::spawn(async move { init.initialize(&token).await })
            })
            .collect();

        for call in calls {
            call.await.unwrap().unwrap();
        }
        init.initialize(&token).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(init.is_initialized());
        init.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_is_observed_by_every_caller() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let init = SingleFlightInitializer::new("failing", move |_cancel| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Connection("refused".into()))
            }
            .boxed()
        });
        let token = CancellationToken::new();

        let first = init.initialize(&token).await.unwrap_err();
        let second = init.initialize(&token).await.unwrap_err();

        assert!(matches!(first, Error::Initialization(_)));
        assert!(second.is_transient());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(matches!(init.dispatch(), Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_cancelling_first_caller_cancels_all_waiters() {
        let init = Arc::new(SingleFlightInitializer::new("slow", |cancel| {
            async move {
                cancel.cancelled().await;
                Err(Error::Cancelled)
            }
            .boxed()
        }));
        let first_token = CancellationToken::new();
        let other_token = CancellationToken::new();

        let first = {
            let init = init.clone();
            let token = first_token.clone();
            tokio::spawn(async move { init.initialize(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let init = init.clone();
            let token = other_token.clone();
            tokio::spawn(async move { init.initialize(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        first_token.cancel();

        assert!(first.await.unwrap().unwrap_err().is_cancelled());
        assert!(second.await.unwrap().unwrap_err().is_cancelled());
        assert!(init.initialize(&other_token).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_dispatch_requires_initialization() {
        let runs = Arc::new(AtomicUsize::new(0));
        let init = counting(runs.clone(), Duration::ZERO);
        let token = CancellationToken::new();

        assert!(matches!(init.dispatch(), Err(Error::NotInitialized)));

        init.initialize(&token).await.unwrap();
        init.dispatch().unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while runs.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatched run should execute");

        init.dispose().await.unwrap();
        assert!(matches!(init.dispatch(), Err(Error::Disposed)));
        assert!(matches!(init.initialize(&token).await, Err(Error::Disposed)));
    }

    #[tokio::test]
    async fn test_dispatch_during_initialization_runs_after_ready() {
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let init = {
            let runs = runs.clone();
            let gate = gate.clone();
            Arc::new(SingleFlightInitializer::new("gated", move |_cancel| {
                let runs = runs.clone();
                let gate = gate.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                        gate.notified().await;
                    }
                    Ok(())
                }
                .boxed()
            }))
        };
        let token = CancellationToken::new();

        let first = {
            let init = init.clone();
            let token = token.clone();
            tokio::spawn(async move { init.initialize(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        init.dispatch().unwrap();
        gate.notify_one();
        first.await.unwrap().unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while runs.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("held dispatch should run once ready");

        init.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_held_during_failed_initialization_is_dropped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let init = {
            let runs = runs.clone();
            let gate = gate.clone();
            Arc::new(SingleFlightInitializer::new("doomed", move |_cancel| {
                let runs = runs.clone();
                let gate = gate.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Err(Error::Connection("refused".into()))
                }
                .boxed()
            }))
        };
        let token = CancellationToken::new();

        let first = {
            let init = init.clone();
            let token = token.clone();
            tokio::spawn(async move { init.initialize(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        init.dispatch().unwrap();
        gate.notify_one();
        assert!(first.await.unwrap().is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(matches!(init.dispatch(), Err(Error::NotInitialized)));

        init.dispose().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dispatch_is_retried() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let init = SingleFlightInitializer::new("flaky", move |_cancel| {
            let counter = counter.clone();
            async move {
                // initial run succeeds, first dispatched run fails
                match counter.fetch_add(1, Ordering::SeqCst) {
                    1 => Err(Error::Connection("flaky".into())),
                    _ => Ok(()),
                }
            }
            .boxed()
        });
        let token = CancellationToken::new();

        init.initialize(&token).await.unwrap();
        init.dispatch().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        init.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_cancels_in_flight_initialization() {
        let init = Arc::new(SingleFlightInitializer::new("hanging", |_cancel| {
            async move {
                futures::future::pending::<()>().await;
                Ok(())
            }
            .boxed()
        }));
        let token = CancellationToken::new();

        let pending = {
            let init = init.clone();
            let token = token.clone();
            tokio::spawn(async move { init.initialize(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        init.dispose().await.unwrap();
        assert!(pending.await.unwrap().unwrap_err().is_cancelled());
        assert!(init.is_disposed());
        init.dispose().await.unwrap();
    }
}
