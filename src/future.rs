//! Awaiting a promise from async code.
use parking_lot::Mutex;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::error::Result;
use crate::promise::Promise;

/// Future returned by `promise.into_future()`; resolves to the promise's
/// outcome.
///
/// # Examples
///
/// ```
/// use promise_chain::Promise;
/// use futures::executor::block_on;
///
/// let promise = Promise::new(|producer| {
///     producer.resolve("Hi".to_string());
/// });
/// assert_eq!(block_on(async { promise.await }).unwrap(), "Hi");
/// ```
#[derive(Debug)]
pub struct PromiseFuture<T> {
    promise: Promise<T>,
    waker: Option<Arc<Mutex<Option<Waker>>>>,
}

impl<T: Clone + Send + Sync + 'static> Future for PromiseFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.promise.core.outcome() {
            return Poll::Ready(outcome.clone());
        }
        match &this.waker {
            Some(slot) => {
                *slot.lock() = Some(cx.waker().clone());
            }
            None => {
                let slot = Arc::new(Mutex::new(Some(cx.waker().clone())));
                let wake = Arc::clone(&slot);
                this.promise.attach(move |_| {
                    if let Some(waker) = wake.lock().take() {
                        waker.wake();
                    }
                });
                this.waker = Some(slot);
            }
        }
        // Settlement may have raced the waker update above.
        match this.promise.core.outcome() {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => Poll::Pending,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Promise<T> {
    type Output = Result<T>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        PromiseFuture {
            promise: self,
            waker: None,
        }
    }
}
