//! External cancellation signal.
//!
//! A [`CancelToken`] fires once. Blocked waiters select on its closed
//! channel, and [`CancelToken::on_cancel`] callbacks let a promise turn the
//! cancellation into a rejection.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{trace, warn};

use crate::error::Error;
use crate::timer::{self, TimerHandle};

type Callback = Box<dyn FnOnce(Error) + Send + 'static>;

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    reason: OnceLock<Error>,
    state: Mutex<TokenState>,
    signal: Receiver<()>,
}

struct TokenState {
    sender: Option<Sender<()>>,
    // Keyed by registration id, which also keeps firing order.
    callbacks: BTreeMap<u64, Callback>,
    next_id: u64,
    deadline: Option<TimerHandle>,
    parent: Option<CancelRegistration>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, signal) = channel::bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                reason: OnceLock::new(),
                state: Mutex::new(TokenState {
                    sender: Some(sender),
                    callbacks: BTreeMap::new(),
                    next_id: 0,
                    deadline: None,
                    parent: None,
                }),
                signal,
            }),
        }
    }

    /// A token that cancels itself with [`Error::DeadlineExceeded`] once
    /// `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        token.arm_deadline(timeout);
        token
    }

    /// A token cancelled whenever `self` is, with the same reason. Cancelling
    /// the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let weak = Arc::downgrade(&child.inner);
        let registration = self.on_cancel(move |reason| {
            if let Some(inner) = weak.upgrade() {
                CancelToken { inner }.cancel_with(reason);
            }
        });
        child.inner.state.lock().parent = Some(registration);
        child
    }

    fn arm_deadline(&self, timeout: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = timer::after(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                CancelToken { inner }.cancel_with(Error::DeadlineExceeded);
            }
        });
        self.inner.state.lock().deadline = Some(handle);
    }

    pub fn cancel(&self) -> bool {
        self.cancel_with(Error::Cancelled)
    }

    /// Fires the token. Returns `false` if it had already fired.
    pub fn cancel_with(&self, reason: Error) -> bool {
        let mut state = self.inner.state.lock();
        if self.inner.reason.set(reason.clone()).is_err() {
            return false;
        }
        let sender = state.sender.take();
        let callbacks = std::mem::take(&mut state.callbacks);
        let deadline = state.deadline.take();
        drop(state);

        drop(sender);
        if let Some(deadline) = deadline {
            deadline.cancel();
        }
        trace!(reason = %reason, callbacks = callbacks.len(), "Cancel token fired");
        for (_, callback) in callbacks {
            let reason = reason.clone();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(reason))) {
                warn!(error = %Error::from_panic(payload), "Cancel callback panicked");
            }
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<Error> {
        self.inner.reason.get().cloned()
    }

    /// Runs `callback` once when the token fires, or right away on the
    /// calling thread if it already has.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if let Some(reason) = self.inner.reason.get() {
            let reason = reason.clone();
            drop(state);
            callback(reason);
            return CancelRegistration {
                token: Weak::new(),
                id: None,
            };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Box::new(callback));
        CancelRegistration {
            token: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Receiver that disconnects when the token fires.
    pub(crate) fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.inner.reason.get())
            .finish()
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(deadline) = state.deadline.take() {
            deadline.cancel();
        }
        if let Some(parent) = state.parent.take() {
            parent.stop();
        }
    }
}

/// Handle returned by [`CancelToken::on_cancel`].
///
/// Dropping it leaves the callback armed; call [`stop`](Self::stop) to
/// detach.
#[derive(Debug)]
pub struct CancelRegistration {
    token: Weak<TokenInner>,
    id: Option<u64>,
}

impl CancelRegistration {
    /// Detaches the callback. Returns `true` if it was still armed, which
    /// guarantees it will never run.
    pub fn stop(&self) -> bool {
        let (Some(id), Some(inner)) = (self.id, self.token.upgrade()) else {
            return false;
        };
        let removed = inner.state.lock().callbacks.remove(&id);
        removed.is_some()
    }
}
