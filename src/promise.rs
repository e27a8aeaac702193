//! The settlement core.
//!
//! A promise is a shared single-assignment cell. Its state word is read
//! lock-free; the mutex guards only the transition itself, the pending
//! handler chain and the lazily created wait signal. Handlers always run
//! after the mutex is released, so a handler may settle other promises or
//! register on this one without deadlocking.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::handler::{self, HandlerChain};

const PENDING: u8 = 0;
const FULFILLED: u8 = 1;
const REJECTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

impl State {
    fn from_u8(raw: u8) -> Self {
        match raw {
            FULFILLED => State::Fulfilled,
            REJECTED => State::Rejected,
            _ => State::Pending,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Pending => "pending",
            State::Fulfilled => "fulfilled",
            State::Rejected => "rejected",
        })
    }
}

pub(crate) struct Core<T> {
    state: AtomicU8,
    outcome: OnceLock<Result<T>>,
    waiters: Mutex<Waiters>,
}

#[derive(Default)]
struct Waiters {
    handlers: HandlerChain,
    // Dropping the sender is the broadcast: every cloned receiver disconnects.
    signal: Option<(Sender<()>, Receiver<()>)>,
}

impl<T> Core<T> {
    pub(crate) fn pending() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            outcome: OnceLock::new(),
            waiters: Mutex::new(Waiters::default()),
        }
    }

    fn settled(outcome: Result<T>) -> Self {
        let state = if outcome.is_ok() { FULFILLED } else { REJECTED };
        let cell = OnceLock::new();
        let _ = cell.set(outcome);
        Self {
            state: AtomicU8::new(state),
            outcome: cell,
            waiters: Mutex::new(Waiters::default()),
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The final outcome, once settled.
    pub(crate) fn outcome(&self) -> Option<&Result<T>> {
        if self.state.load(Ordering::SeqCst) == PENDING {
            return None;
        }
        self.outcome.get()
    }
}

impl<T: Send + Sync + 'static> Core<T> {
    /// Performs the one and only transition out of pending.
    ///
    /// Returns `false` without touching anything if the promise has already
    /// settled.
    pub(crate) fn settle(self: &Arc<Self>, outcome: Result<T>) -> bool {
        if self.state.load(Ordering::SeqCst) != PENDING {
            return false;
        }
        let mut waiters = self.waiters.lock();
        if self.state.load(Ordering::SeqCst) != PENDING {
            return false;
        }
        let next = if outcome.is_ok() { FULFILLED } else { REJECTED };
        if self.outcome.set(outcome).is_err() {
            return false;
        }
        self.state.store(next, Ordering::SeqCst);
        let handlers = waiters.handlers.take();
        let signal = waiters.signal.take();
        drop(waiters);

        trace!(state = %State::from_u8(next), handlers = handlers.len(), "Promise settled");
        drop(signal);
        // Handlers upgrade a weak reference, so the core rides along with a
        // chain that has to wait its turn.
        handler::drain(handlers, Arc::clone(self));
        true
    }
}

/// A single-assignment value that is fulfilled or rejected exactly once.
///
/// Cloning a `Promise` clones the handle, not the value: every clone
/// observes the same settlement.
pub struct Promise<T> {
    pub(crate) core: Arc<Core<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Promise<T> {
    /// Lock-free read of the current state.
    pub fn state(&self) -> State {
        self.core.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    fn from_core(core: Core<T>) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    /// An already fulfilled promise.
    pub fn resolved(value: T) -> Self {
        Self::from_core(Core::settled(Ok(value)))
    }

    /// An already rejected promise.
    pub fn rejected(err: Error) -> Self {
        Self::from_core(Core::settled(Err(err)))
    }

    /// Launches `executor` on the dispatcher.
    ///
    /// The executor settles the promise through the [`Producer`] it is
    /// handed. A panic inside the executor rejects the promise with
    /// [`Error::Panicked`].
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::Promise;
    ///
    /// let promise = Promise::new(|producer| {
    ///     producer.resolve(21 * 2);
    /// });
    /// assert_eq!(promise.wait().unwrap(), 42);
    /// ```
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Producer<T>) + Send + 'static,
    {
        let (producer, promise) = Producer::new();
        dispatch::dispatch(Box::new(move || run_executor(producer, executor)));
        promise
    }

    /// Like [`Promise::new`], but `token` firing before the executor
    /// settles rejects the promise with the token's reason.
    pub fn with_cancel<F>(token: &CancelToken, executor: F) -> Self
    where
        F: FnOnce(Producer<T>) + Send + 'static,
    {
        let (producer, promise) = Producer::new();
        let token = token.clone();
        dispatch::dispatch(Box::new(move || {
            if let Some(reason) = token.reason() {
                producer.reject(reason);
                return;
            }
            // Weak, so the registration does not count as a live producer.
            let core = Arc::downgrade(&producer.inner.core);
            let registration = token.on_cancel(move |reason| {
                if let Some(core) = core.upgrade() {
                    core.settle(Err(reason));
                }
            });
            // Settlement is the single-use guard: whichever side gets there
            // first wins, and the loser's registration is detached.
            producer.promise().attach(move |_| {
                registration.stop();
            });
            run_executor(producer, executor);
        }));
        promise
    }

    /// Registers a raw handler on this promise's chain.
    ///
    /// This is the privileged attachment used by continuations and
    /// combinators: no dependent promise is created. If the promise has
    /// already settled, `handler` runs right away on the calling thread;
    /// otherwise it is appended to the chain and runs once, in registration
    /// order, after settlement.
    pub(crate) fn attach<F>(&self, handler: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        if let Some(outcome) = self.core.outcome() {
            handler(outcome);
            return;
        }
        let mut waiters = self.core.waiters.lock();
        if let Some(outcome) = self.core.outcome() {
            drop(waiters);
            handler(outcome);
            return;
        }
        // Weak, so a pending promise's chain does not keep the promise alive.
        let core = Arc::downgrade(&self.core);
        waiters.handlers.push(Box::new(move || {
            if let Some(core) = core.upgrade() {
                if let Some(outcome) = core.outcome() {
                    handler(outcome);
                }
            }
        }));
    }

    /// Number of handlers waiting on a pending promise.
    pub fn pending_handlers(&self) -> usize {
        self.core.waiters.lock().handlers.len()
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// The outcome if the promise has settled, without blocking.
    pub fn peek(&self) -> Option<Result<T>> {
        self.core.outcome().cloned()
    }

    /// Blocks until the promise settles.
    pub fn wait(&self) -> Result<T> {
        self.wait_on(&channel::never::<()>(), || Error::Cancelled)
    }

    /// Blocks until the promise settles or `token` fires.
    ///
    /// Cancellation only detaches this waiter: the promise itself is left
    /// untouched and may still settle later.
    pub fn wait_with(&self, token: &CancelToken) -> Result<T> {
        self.wait_on(token.signal(), || token.reason().unwrap_or(Error::Cancelled))
    }

    /// Blocks for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        self.wait_on(&channel::after(timeout), || {
            Error::Timeout("wait timed out".to_string())
        })
    }

    fn wait_on<M, E>(&self, interrupt: &Receiver<M>, interrupted: E) -> Result<T>
    where
        E: FnOnce() -> Error,
    {
        if let Some(outcome) = self.core.outcome() {
            return outcome.clone();
        }
        let signal = {
            let mut waiters = self.core.waiters.lock();
            if let Some(outcome) = self.core.outcome() {
                return outcome.clone();
            }
            let (_, receiver) = waiters.signal.get_or_insert_with(|| channel::bounded(0));
            receiver.clone()
        };

        let settled = channel::select! {
            recv(signal) -> _ => true,
            recv(interrupt) -> _ => false,
        };
        if !settled {
            return Err(interrupted());
        }
        // The signal only closes after the outcome has been stored.
        self.core
            .outcome()
            .cloned()
            .unwrap_or(Err(Error::ProducerDropped))
    }
}

/// Runs a synchronous fallible function on the dispatcher and exposes its
/// result as a promise.
pub fn promisify<T, F>(f: F) -> Promise<T>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    Promise::new(move |producer| {
        producer.settle(f());
    })
}

fn run_executor<T, F>(producer: Producer<T>, executor: F)
where
    T: Send + Sync + 'static,
    F: FnOnce(Producer<T>) + Send + 'static,
{
    let guard = producer.clone();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || executor(producer))) {
        let err = Error::from_panic(payload);
        trace!(error = %err, "Executor panicked");
        guard.reject(err);
    }
}

/// The settling side of a promise.
///
/// Clones share one promise. When the last clone is dropped while the
/// promise is still pending, the promise rejects with
/// [`Error::ProducerDropped`], so nobody waits on a value that can no longer
/// arrive.
pub struct Producer<T: Send + Sync + 'static> {
    inner: Arc<ProducerInner<T>>,
}

struct ProducerInner<T: Send + Sync + 'static> {
    core: Arc<Core<T>>,
}

impl<T: Send + Sync + 'static> Producer<T> {
    /// A pending promise together with the producer that settles it. No
    /// work is dispatched.
    pub fn new() -> (Self, Promise<T>) {
        let promise = Promise::from_core(Core::pending());
        let producer = Producer {
            inner: Arc::new(ProducerInner {
                core: Arc::clone(&promise.core),
            }),
        };
        (producer, promise)
    }

    /// Fulfills the promise. Returns whether this call settled it; calls
    /// after the first settlement are ignored.
    pub fn resolve(&self, value: T) -> bool {
        self.inner.core.settle(Ok(value))
    }

    /// Rejects the promise. Returns whether this call settled it.
    pub fn reject(&self, err: Error) -> bool {
        self.inner.core.settle(Err(err))
    }

    pub fn settle(&self, outcome: Result<T>) -> bool {
        self.inner.core.settle(outcome)
    }

    pub fn is_settled(&self) -> bool {
        self.inner.core.state() != State::Pending
    }

    pub fn promise(&self) -> Promise<T> {
        Promise {
            core: Arc::clone(&self.inner.core),
        }
    }
}

impl<T: Send + Sync + 'static> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("state", &self.inner.core.state())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Drop for ProducerInner<T> {
    /// If this is an unresolved producer, reject so waiters wake up.
    fn drop(&mut self) {
        if self.core.settle(Err(Error::ProducerDropped)) {
            trace!("Producer dropped while pending");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_settle_is_exactly_once() {
        let (producer, promise) = Producer::new();
        assert_eq!(promise.state(), State::Pending);
        assert!(producer.resolve(1));
        assert!(!producer.resolve(2));
        assert!(!producer.reject(Error::msg("late")));
        assert_eq!(promise.state(), State::Fulfilled);
        assert_eq!(promise.peek().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_handlers_run_fifo_after_settlement() {
        let (producer, promise) = Producer::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            promise.attach(move |_| order.lock().push(name));
        }
        assert_eq!(promise.pending_handlers(), 3);
        assert!(order.lock().is_empty());
        producer.resolve(0);
        assert_eq!(*order.lock(), vec!["A", "B", "C"]);
        assert_eq!(promise.pending_handlers(), 0);
    }

    #[test]
    fn test_late_handler_runs_inline_on_caller() {
        let promise = Promise::resolved(5);
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        promise.attach(move |outcome| {
            tx.send((thread::current().id(), outcome.as_ref().ok().copied()))
                .unwrap();
        });
        assert_eq!(rx.try_recv().unwrap(), (caller, Some(5)));
        assert_eq!(promise.pending_handlers(), 0);
    }

    #[test]
    fn test_handler_may_register_on_same_promise() {
        let (producer, promise) = Producer::<u8>::new();
        let (tx, rx) = mpsc::channel();
        let again = promise.clone();
        promise.attach(move |_| {
            again.attach(move |outcome| tx.send(outcome.is_ok()).unwrap());
        });
        producer.resolve(1);
        assert!(rx.try_recv().unwrap());
    }

    #[test]
    fn test_dropped_producer_rejects() {
        let (producer, promise) = Producer::<String>::new();
        let clone = producer.clone();
        drop(producer);
        assert!(promise.is_pending());
        drop(clone);
        assert!(matches!(promise.wait(), Err(Error::ProducerDropped)));
    }

    #[test]
    fn test_with_cancel_rejects_when_executor_drops_producer() {
        let token = CancelToken::new();
        let promise = Promise::<i32>::with_cancel(&token, |_producer| {});
        assert!(matches!(
            promise.wait_timeout(Duration::from_secs(5)),
            Err(Error::ProducerDropped)
        ));
        assert!(token.cancel());
        assert!(matches!(promise.peek(), Some(Err(Error::ProducerDropped))));
    }

    #[test]
    fn test_wait_blocks_until_settled() {
        let (producer, promise) = Producer::new();
        let waiter = {
            let promise = promise.clone();
            thread::spawn(move || promise.wait())
        };
        thread::sleep(Duration::from_millis(20));
        producer.resolve("done");
        assert_eq!(waiter.join().unwrap().unwrap(), "done");
    }

    #[test]
    fn test_cancelled_wait_leaves_promise_pending() {
        let (producer, promise) = Producer::<i32>::new();
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(promise.wait_with(&token), Err(Error::Cancelled)));
        assert!(promise.is_pending());
        producer.resolve(3);
        assert_eq!(promise.wait().unwrap(), 3);
    }

    #[test]
    fn test_wait_timeout_on_pending() {
        let (_producer, promise) = Producer::<i32>::new();
        let err = promise.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::Pending.to_string(), "pending");
        assert_eq!(State::Fulfilled.to_string(), "fulfilled");
        assert_eq!(State::Rejected.to_string(), "rejected");
    }
}
