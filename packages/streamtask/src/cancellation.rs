// Cooperative cancellation token
//
// The token only records state and notifies observers:
// - `cancel` flips a one-way flag, stores the reason and runs callbacks
// - `throw_if_cancelled` lets work bail out at its own safe points
// - `cancelled().await` lets async work select on cancellation
// Nothing here ever interrupts running work.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken as NotifyToken, WaitForCancellationFuture};
use tracing::debug;

type Callback = Box<dyn FnOnce(&str) + Send + 'static>;

/// Error returned by [`CancellationToken::throw_if_cancelled`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Operation cancelled: {reason}")]
pub struct Cancelled {
    pub reason: String,
}

struct Inner {
    cancelled: AtomicBool,
    state: Mutex<TokenState>,
    notify: NotifyToken,
}

struct TokenState {
    reason: Option<String>,
    callbacks: Vec<Callback>,
}

/// Cloneable cancellation signal. All clones observe the same state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(TokenState {
                    reason: None,
                    callbacks: Vec::new(),
                }),
                notify: NotifyToken::new(),
            }),
        }
    }

    /// Cancel the token. Returns `false` if it was already cancelled, in which
    /// case the original reason is kept and no callback runs again.
    ///
    /// Registered callbacks run synchronously on the calling thread, in
    /// registration order, after the internal lock has been released.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            self.inner.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut state.callbacks)
        };

        debug!(
            "Cancellation token fired ({} callbacks): {}",
            callbacks.len(),
            reason
        );

        for callback in callbacks {
            callback(&reason);
        }
        // Waiters wake only after every callback has run
        self.inner.notify.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Reason passed to the first successful `cancel`, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner.state.lock().reason.clone()
    }

    pub fn throw_if_cancelled(&self) -> Result<(), Cancelled> {
        if !self.is_cancelled() {
            return Ok(());
        }
        Err(Cancelled {
            reason: self.reason().unwrap_or_default(),
        })
    }

    /// Register a callback. If the token is already cancelled the callback is
    /// invoked immediately, before this method returns.
    pub fn on_cancelled<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let reason = {
            let mut state = self.inner.state.lock();
            match state.reason.clone() {
                Some(reason) => reason,
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&reason);
    }

    /// Future that resolves once the token has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.notify.cancelled()
    }

    /// Spawn a timer that cancels the token with `reason` once `after` has
    /// elapsed. The timer exits early if the token is cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn cancel_after(&self, after: Duration, reason: impl Into<String>) -> JoinHandle<()> {
        let token = self.clone();
        let reason = reason.into();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if token.cancel(reason) {
                        debug!("Deadline of {:?} elapsed, token cancelled", after);
                    }
                }
            }
        })
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
