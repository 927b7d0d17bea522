//! Auto-reset async signal
//!
//! A `set()` releases exactly one waiter. When nobody is waiting the signal
//! stays raised until the next `wait()` consumes it; repeated `set()` calls
//! collapse into one pending release.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Cancellable auto-reset event
#[derive(Debug, Default)]
pub struct AsyncSignal {
    state: Mutex<SignalState>,
}

#[derive(Debug, Default)]
struct SignalState {
    signaled: bool,
    disposed: bool,
    next_waiter: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

impl AsyncSignal {
    /// Create a new, unsignaled signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next `set()`.
    ///
    /// Completes immediately if a previous `set()` has not been consumed yet.
    /// Fails with [`Error::Cancelled`] when `cancel` fires or the signal is
    /// disposed while waiting.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (id, mut rx) = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(Error::Disposed);
            }
            if state.signaled {
                state.signaled = false;
                return Ok(());
            }

            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        tokio::select! {
            biased;
            released = &mut rx => released.map_err(|_| Error::Cancelled),
            _ = cancel.cancelled() => {
                let removed = {
                    let mut state = self.state.lock();
                    let before = state.waiters.len();
                    state.waiters.retain(|w| w.id != id);
                    before != state.waiters.len()
                };

                // set() already picked this waiter; hand the release on
                if !removed && rx.try_recv().is_ok() {
                    let _ = self.set();
                }
                Err(Error::Cancelled)
            }
        }
    }

    /// Release one pending waiter, or raise the signal if nobody waits.
    pub fn set(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(Error::Disposed);
        }

        while let Some(waiter) = state.waiters.pop_front() {
            // Receiver gone means the waiting future was dropped
            if waiter.tx.send(()).is_ok() {
                return Ok(());
            }
        }

        state.signaled = true;
        Ok(())
    }

    /// Whether a release is pending with nobody waiting for it
    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Cancel all pending waits and reject further use. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.signaled = false;
        // Dropping the senders wakes every waiter with a cancellation
        state.waiters.clear();
    }

    /// Whether `dispose()` has been called
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, assert_ready_err, assert_ready_ok, task};

    #[test]
    fn test_set_before_wait_completes_immediately() {
        let signal = AsyncSignal::new();
        let token = CancellationToken::new();

        signal.set().unwrap();
        let mut wait = task::spawn(signal.wait(&token));
        assert_ready_ok!(wait.poll());
        assert!(!signal.is_signaled());
    }

    #[test]
    fn test_multiple_sets_collapse() {
        let signal = AsyncSignal::new();
        let token = CancellationToken::new();

        signal.set().unwrap();
        signal.set().unwrap();
        signal.set().unwrap();

        let mut first = task::spawn(signal.wait(&token));
        assert_ready_ok!(first.poll());

        let mut second = task::spawn(signal.wait(&token));
        assert_pending!(second.poll());
    }

    #[test]
    fn test_set_releases_exactly_one_waiter() {
        let signal = AsyncSignal::new();
        let token = CancellationToken::new();

        let mut first = task::spawn(signal.wait(&token));
        let mut second = task::spawn(signal.wait(&token));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        signal.set().unwrap();

        let first_done = first.poll().is_ready();
        let second_done = second.poll().is_ready();
        assert!(first_done ^ second_done);
        assert!(!signal.is_signaled());
    }

    #[test]
    fn test_dispose_cancels_pending_waits() {
        let signal = AsyncSignal::new();
        let token = CancellationToken::new();

        let mut wait = task::spawn(signal.wait(&token));
        assert_pending!(wait.poll());

        signal.dispose();
        assert!(wait.is_woken());
        let err = assert_ready_err!(wait.poll());
        assert!(matches!(err, Error::Cancelled));

        assert!(matches!(signal.set(), Err(Error::Disposed)));
        let mut late = task::spawn(signal.wait(&token));
        assert!(matches!(assert_ready!(late.poll()), Err(Error::Disposed)));
    }

    #[test]
    fn test_already_cancelled_token_fails_fast() {
        let signal = AsyncSignal::new();
        let token = CancellationToken::new();
        token.cancel();

        signal.set().unwrap();
        let mut wait = task::spawn(signal.wait(&token));
        assert!(matches!(assert_ready!(wait.poll()), Err(Error::Cancelled)));
        // the pending release was not consumed
        assert!(signal.is_signaled());
    }

    #[test]
    fn test_cancellation_only_affects_its_own_waiter() {
        let signal = AsyncSignal::new();
        let cancelled = CancellationToken::new();
        let untouched = CancellationToken::new();

        let mut first = task::spawn(signal.wait(&cancelled));
        let mut second = task::spawn(signal.wait(&untouched));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        cancelled.cancel();
        assert!(matches!(assert_ready!(first.poll()), Err(Error::Cancelled)));
        assert_pending!(second.poll());

        signal.set().unwrap();
        assert_ready_ok!(second.poll());
    }

    #[tokio::test]
    async fn test_signal_wakes_spawned_waiter() {
        let signal = std::sync::Arc::new(AsyncSignal::new());
        let token = CancellationToken::new();

        let waiter = {
            let signal = signal.clone();
            let token = token.clone();
            tokio::spawn(async move { signal.wait(&token).await })
        };

        tokio::task::yield_now().await;
        signal.set().unwrap();

        let res = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
        assert!(res.is_ok());
    }
}
