//! Continuations: `then`, `catch`, `finally`, `map` and `tap`.
//!
//! Each call creates a dependent promise and attaches one raw handler to the
//! source, synchronously on the calling thread. Calls issued in program order
//! therefore land on the chain in that order and run FIFO once the source
//! settles. A callback that panics rejects the dependent promise.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::promise::{Core, Promise};

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Transforms the fulfilled value; rejections pass through unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::Promise;
    ///
    /// let doubled = Promise::resolved(4).then(|v| Ok(v * 2));
    /// assert_eq!(doubled.wait().unwrap(), 8);
    /// ```
    pub fn then<F>(&self, on_fulfilled: F) -> Promise<T>
    where
        F: FnOnce(T) -> Result<T> + Send + 'static,
    {
        self.continue_with(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value.clone()),
            Err(err) => Err(err.clone()),
        })
    }

    /// Handles both branches. `on_rejected` may recover by returning `Ok`.
    pub fn then_or<F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<T>
    where
        F: FnOnce(T) -> Result<T> + Send + 'static,
        R: FnOnce(Error) -> Result<T> + Send + 'static,
    {
        self.continue_with(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value.clone()),
            Err(err) => on_rejected(err.clone()),
        })
    }

    /// Handles the rejected branch; fulfilled values pass through unchanged.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T>
    where
        R: FnOnce(Error) -> Result<T> + Send + 'static,
    {
        self.continue_with(move |outcome| match outcome {
            Ok(value) => Ok(value.clone()),
            Err(err) => on_rejected(err.clone()),
        })
    }

    /// Runs `on_finally` whatever the outcome, then forwards the original
    /// outcome. If `on_finally` panics, the panic wins over the original
    /// outcome, including an original rejection.
    pub fn finally<F>(&self, on_finally: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.continue_with(move |outcome| {
            on_finally();
            outcome.clone()
        })
    }

    /// Observes the outcome without changing it.
    pub fn tap<F>(&self, on_tap: F) -> Promise<T>
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        self.continue_with(move |outcome| {
            on_tap(outcome);
            outcome.clone()
        })
    }

    /// Type-changing transform. An `Err` from `mapper` rejects the mapped
    /// promise; a source rejection is forwarded without calling `mapper`.
    pub fn map<U, F>(&self, mapper: F) -> Promise<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.continue_with(move |outcome| match outcome {
            Ok(value) => mapper(value.clone()),
            Err(err) => Err(err.clone()),
        })
    }

    fn continue_with<U, F>(&self, step: F) -> Promise<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&Result<T>) -> Result<U> + Send + 'static,
    {
        let dependent = Arc::new(Core::<U>::pending());
        let target = Arc::clone(&dependent);
        self.attach(move |outcome| {
            let next = panic::catch_unwind(AssertUnwindSafe(|| step(outcome)))
                .unwrap_or_else(|payload| Err(Error::from_panic(payload)));
            target.settle(next);
        });
        Promise { core: dependent }
    }
}

/// Free-function form of [`Promise::map`].
pub fn map<T, U, F>(promise: &Promise<T>, mapper: F) -> Promise<U>
where
    T: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: FnOnce(T) -> Result<U> + Send + 'static,
{
    promise.map(mapper)
}
