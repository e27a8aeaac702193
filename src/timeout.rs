//! Timer-driven promises: `delay` and `Promise::timeout`.
use std::time::Duration;
use tracing::trace;

use crate::error::Error;
use crate::promise::{Producer, Promise};
use crate::timer;

const DEFAULT_TIMEOUT_MESSAGE: &str = "promise timeout";

/// A promise fulfilled with `()` after `duration`.
pub fn delay(duration: Duration) -> Promise<()> {
    let (producer, promise) = Producer::new();
    // The handle is not needed: the timer owns the producer until it fires.
    let _ = timer::after(duration, move || {
        producer.resolve(());
    });
    promise
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Races this promise against a timer.
    ///
    /// If `duration` elapses first, the returned promise rejects with
    /// [`Error::Timeout`] carrying `message` (or `"promise timeout"` when
    /// `message` is empty). Otherwise it settles like `self` and the timer
    /// is disarmed.
    pub fn timeout(&self, duration: Duration, message: &str) -> Promise<T> {
        let message = if message.is_empty() {
            DEFAULT_TIMEOUT_MESSAGE
        } else {
            message
        }
        .to_string();

        let (producer, raced) = Producer::new();
        let on_expiry = producer.clone();
        let timer = timer::after(duration, move || {
            if on_expiry.reject(Error::Timeout(message)) {
                trace!(?duration, "Promise timed out");
            }
        });
        self.attach(move |outcome| {
            timer.cancel();
            producer.settle(outcome.clone());
        });
        raced
    }
}
