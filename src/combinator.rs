//! Combining many promises into one.
//!
//! Every combinator attaches one raw handler directly to each input's chain;
//! no per-input dependent promise is created. The handlers may fire
//! concurrently from different threads, so the terminal settlement is gated
//! by an atomic pending counter and a compare-and-set `done` flag.

use parking_lot::Mutex;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::error::{AggregateError, Error};
use crate::promise::{Producer, Promise, State};

/// Outcome of one input of [`all_settled`].
#[derive(Debug, Clone)]
pub enum SettledResult<T> {
    Fulfilled(T),
    Rejected(Error),
}

impl<T> SettledResult<T> {
    pub fn status(&self) -> State {
        match self {
            SettledResult::Fulfilled(_) => State::Fulfilled,
            SettledResult::Rejected(_) => State::Rejected,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            SettledResult::Fulfilled(value) => Some(value),
            SettledResult::Rejected(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&Error> {
        match self {
            SettledResult::Fulfilled(_) => None,
            SettledResult::Rejected(reason) => Some(reason),
        }
    }
}

struct Gate {
    pending: AtomicUsize,
    done: AtomicBool,
}

impl Gate {
    fn new(pending: usize) -> Self {
        Self {
            pending: AtomicUsize::new(pending),
            done: AtomicBool::new(false),
        }
    }

    /// True for exactly one caller.
    fn close(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_closed(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// True for the caller that brings the counter to zero.
    fn count_down(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

fn empty_slots<T>(len: usize) -> Mutex<Vec<Option<T>>> {
    Mutex::new((0..len).map(|_| None).collect())
}

/// Fulfills with every value in input order once all inputs fulfill;
/// rejects with the first rejection observed.
///
/// # Examples
///
/// ```
/// use promise_chain::{all, Promise};
///
/// let values = all([Promise::resolved(1), Promise::resolved(2)]).wait().unwrap();
/// assert_eq!(values, vec![1, 2]);
/// ```
pub fn all<T, I>(promises: I) -> Promise<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::resolved(Vec::new());
    }
    trace!(inputs = promises.len(), "all: attaching");

    let (producer, combined) = Producer::new();
    let gate = Arc::new(Gate::new(promises.len()));
    let results = Arc::new(empty_slots::<T>(promises.len()));

    for (index, promise) in promises.iter().enumerate() {
        let producer = producer.clone();
        let gate = Arc::clone(&gate);
        let results = Arc::clone(&results);
        promise.attach(move |outcome| match outcome {
            Ok(value) => {
                if gate.is_closed() {
                    return;
                }
                results.lock()[index] = Some(value.clone());
                if gate.count_down() && gate.close() {
                    let values = mem::take(&mut *results.lock());
                    producer.resolve(values.into_iter().flatten().collect());
                }
            }
            Err(err) => {
                if gate.close() {
                    producer.reject(err.clone());
                }
            }
        });
    }
    combined
}

/// Fulfills with the first fulfilled input. Rejects with an aggregate error
/// holding every reason, in input order, when all inputs reject.
pub fn any<T, I>(promises: I) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::rejected(Error::Aggregate(AggregateError::empty("no promises")));
    }
    trace!(inputs = promises.len(), "any: attaching");

    let (producer, combined) = Producer::new();
    let gate = Arc::new(Gate::new(promises.len()));
    let reasons = Arc::new(empty_slots::<Error>(promises.len()));

    for (index, promise) in promises.iter().enumerate() {
        let producer = producer.clone();
        let gate = Arc::clone(&gate);
        let reasons = Arc::clone(&reasons);
        promise.attach(move |outcome| match outcome {
            Ok(value) => {
                if gate.close() {
                    producer.resolve(value.clone());
                }
            }
            Err(err) => {
                reasons.lock()[index] = Some(err.clone());
                // The counter only tracks rejections, so zero means every
                // input rejected.
                if gate.count_down() && gate.close() {
                    let reasons = mem::take(&mut *reasons.lock());
                    producer.reject(Error::Aggregate(AggregateError::all_rejected(
                        reasons.into_iter().flatten().collect(),
                    )));
                }
            }
        });
    }
    combined
}

/// Settles like whichever input settles first, fulfilled or rejected.
///
/// An empty input has nothing to race and rejects immediately.
pub fn race<T, I>(promises: I) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::rejected(Error::Aggregate(AggregateError::empty(
            "no promises to race",
        )));
    }
    trace!(inputs = promises.len(), "race: attaching");

    let (producer, combined) = Producer::new();
    let gate = Arc::new(Gate::new(promises.len()));
    for promise in &promises {
        let producer = producer.clone();
        let gate = Arc::clone(&gate);
        promise.attach(move |outcome| {
            if gate.close() {
                producer.settle(outcome.clone());
            }
        });
    }
    combined
}

/// Waits for every input and reports each outcome in input order. Never
/// rejects.
pub fn all_settled<T, I>(promises: I) -> Promise<Vec<SettledResult<T>>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::resolved(Vec::new());
    }
    trace!(inputs = promises.len(), "all_settled: attaching");

    let (producer, combined) = Producer::new();
    let gate = Arc::new(Gate::new(promises.len()));
    let results = Arc::new(empty_slots::<SettledResult<T>>(promises.len()));

    for (index, promise) in promises.iter().enumerate() {
        let producer = producer.clone();
        let gate = Arc::clone(&gate);
        let results = Arc::clone(&results);
        promise.attach(move |outcome| {
            let settled = match outcome {
                Ok(value) => SettledResult::Fulfilled(value.clone()),
                Err(err) => SettledResult::Rejected(err.clone()),
            };
            results.lock()[index] = Some(settled);
            if gate.count_down() && gate.close() {
                let results = mem::take(&mut *results.lock());
                producer.resolve(results.into_iter().flatten().collect());
            }
        });
    }
    combined
}
