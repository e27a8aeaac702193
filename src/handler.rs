//! Pending-handler chains and the process-wide chain pool.
//!
//! A chain is an append-at-tail sequence of boxed continuations. Its backing
//! slots come from a shared free list so a promise that collects handlers
//! while pending does not allocate storage for them in the steady state.
//! Every slot is consumed or dropped before the storage is handed back, so a
//! pooled chain never retains a captured closure.
//!
//! Chains drained while another chain is already running on the same thread
//! are queued and run by the outermost drain, so a long run of dependent
//! promises settles in a loop instead of one nested call per link.

use crossbeam::queue::ArrayQueue;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::{trace, warn};

use crate::config::handler_pool_config;
use crate::dispatch::Task;
use crate::error::Error;

static POOL: OnceLock<ChainPool> = OnceLock::new();

thread_local! {
    // `Some` while this thread is inside `drain`.
    static DEFERRED: RefCell<Option<VecDeque<Task>>> = const { RefCell::new(None) };
}

struct ChainPool {
    free: ArrayQueue<Vec<Task>>,
    max_retained_slots: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn pool() -> &'static ChainPool {
    POOL.get_or_init(|| {
        let config = handler_pool_config();
        ChainPool {
            free: ArrayQueue::new(config.capacity.max(1)),
            max_retained_slots: config.max_retained_slots,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    })
}

/// Snapshot of the chain pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerPoolStats {
    /// Cleared chains currently waiting for reuse.
    pub pooled: usize,
    pub hits: u64,
    pub misses: u64,
}

pub fn handler_pool_stats() -> HandlerPoolStats {
    let pool = pool();
    HandlerPoolStats {
        pooled: pool.free.len(),
        hits: pool.hits.load(Ordering::Relaxed),
        misses: pool.misses.load(Ordering::Relaxed),
    }
}

/// Continuations registered on a pending promise, in registration order.
#[derive(Default)]
pub(crate) struct HandlerChain {
    slots: Option<Vec<Task>>,
}

impl HandlerChain {
    /// Appends at the tail, borrowing storage from the pool on first use.
    pub(crate) fn push(&mut self, task: Task) {
        self.slots.get_or_insert_with(acquire).push(task);
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.as_ref().map_or(0, Vec::len)
    }

    /// Detaches the whole chain, leaving this one empty.
    pub(crate) fn take(&mut self) -> HandlerChain {
        HandlerChain {
            slots: self.slots.take(),
        }
    }

    /// Invokes every handler in FIFO order, then recycles the storage.
    ///
    /// Must be called without holding the owning promise's lock. A panicking
    /// handler is logged and does not stop the remaining ones.
    pub(crate) fn run(mut self) {
        let Some(mut slots) = self.slots.take() else {
            return;
        };
        trace!(handlers = slots.len(), "Running handler chain");
        for task in slots.drain(..) {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                let err = Error::from_panic(payload);
                warn!(error = %err, "Promise handler panicked");
            }
        }
        release(slots);
    }
}

/// Runs `chain`, keeping `owner` alive until it has finished.
///
/// When called from inside a handler, the chain is queued behind the one
/// currently running and `owner` moves with it. Each chain still runs in its
/// own registration order.
pub(crate) fn drain<K: Send + 'static>(chain: HandlerChain, owner: K) {
    let outermost = DEFERRED.with(|deferred| {
        let mut deferred = deferred.borrow_mut();
        match deferred.as_mut() {
            Some(queue) => {
                queue.push_back(Box::new(move || {
                    chain.run();
                    drop(owner);
                }));
                None
            }
            None => {
                *deferred = Some(VecDeque::new());
                Some((chain, owner))
            }
        }
    });
    let Some((chain, owner)) = outermost else {
        return;
    };

    let _reset = DrainGuard;
    chain.run();
    drop(owner);
    while let Some(next) = DEFERRED.with(|deferred| deferred.borrow_mut().as_mut()?.pop_front()) {
        next();
    }
}

struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let _ = DEFERRED.try_with(|deferred| deferred.borrow_mut().take());
    }
}

impl Drop for HandlerChain {
    fn drop(&mut self) {
        if let Some(mut slots) = self.slots.take() {
            // Handlers of a promise that died while pending are never run.
            slots.clear();
            release(slots);
        }
    }
}

fn acquire() -> Vec<Task> {
    let pool = pool();
    match pool.free.pop() {
        Some(slots) => {
            pool.hits.fetch_add(1, Ordering::Relaxed);
            slots
        }
        None => {
            pool.misses.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(4)
        }
    }
}

fn release(slots: Vec<Task>) {
    debug_assert!(slots.is_empty());
    let pool = pool();
    if slots.capacity() > pool.max_retained_slots {
        return;
    }
    // A full pool simply frees the storage.
    let _ = pool.free.push(slots);
}
