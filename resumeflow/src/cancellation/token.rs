//! Cancellation token for cooperative cancellation.

use crate::errors::StepError;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::warn;

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn FnOnce(&StepError) + Send + Sync>;

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent: only the first cause is kept and callbacks run once.
pub struct CancellationToken {
    cancelled: AtomicBool,
    cause: RwLock<Option<StepError>>,
    callbacks: Mutex<Vec<CancelCallback>>,
    signal: watch::Sender<bool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            cancelled: AtomicBool::new(false),
            cause: RwLock::new(None),
            callbacks: Mutex::new(Vec::new()),
            signal,
        }
    }
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a cause.
    ///
    /// Returns true if this call performed the cancellation, false if the token
    /// was already cancelled. Panicking callbacks are logged and suppressed.
    pub fn cancel(&self, cause: StepError) -> bool {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.cause.write() = Some(cause.clone());
        self.signal.send_replace(true);

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            Self::invoke(callback, &cause);
        }
        true
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(&StepError) + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.lock();
        if let Some(cause) = self.cause() {
            drop(callbacks);
            Self::invoke(Box::new(callback), &cause);
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<StepError> {
        self.cause.read().clone()
    }

    /// Resolves once the token is cancelled, returning the cause.
    pub async fn cancelled(&self) -> StepError {
        let mut rx = self.signal.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
        self.cause()
            .unwrap_or_else(|| StepError::failed("cancelled without a cause"))
    }

    fn invoke(callback: CancelCallback, cause: &StepError) {
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(cause);
        })) {
            warn!("Cancellation callback panicked: {:?}", e);
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::InterruptCause;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn stop(user: &str) -> StepError {
        StepError::aborted(InterruptCause::UserStop {
            user: Some(user.to_string()),
        })
    }

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cause().is_none());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        assert!(token.cancel(stop("alice")));
        assert!(!token.cancel(stop("bob")));

        // First cause wins
        assert_eq!(token.cause(), Some(stop("alice")));
    }

    #[test]
    fn test_on_cancel_runs_once() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        token.on_cancel(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel(stop("a"));
        token.cancel(stop("b"));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_cancel_after_cancellation() {
        let token = CancellationToken::new();
        token.cancel(stop("a"));

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        token.on_cancel(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_panic_suppressed() {
        let token = CancellationToken::new();
        token.on_cancel(|_| panic!("Intentional panic"));

        token.cancel(stop("a"));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = Arc::new(CancellationToken::new());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel(stop("carol"));

        let cause = waiter.await.unwrap();
        assert_eq!(cause, stop("carol"));
    }
}
