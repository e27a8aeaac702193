//! One-shot timers backed by a single lazily started timer thread.
//!
//! The thread only keeps a deadline heap; expired callbacks are handed to the
//! dispatcher so user code never runs on (or stalls) the timer thread.
//! Cancelling a timer drops its callback right away; the heap is purged of
//! cancelled entries once they make up more than half of it.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, trace};

use crate::dispatch::{self, Task};

static TIMER: OnceLock<TimerService> = OnceLock::new();

/// Below this many cancelled entries the heap is left alone.
const PURGE_THRESHOLD: usize = 64;

struct TimerService {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    running: bool,
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    // Entries still in the heap whose slot was emptied by `cancel`.
    cancelled: usize,
}

impl TimerState {
    fn note_cancelled(&mut self) {
        self.cancelled += 1;
        if self.cancelled >= PURGE_THRESHOLD && self.cancelled * 2 > self.heap.len() {
            let before = self.heap.len();
            self.heap.retain(|Reverse(entry)| entry.slot.task.lock().is_some());
            trace!(removed = before - self.heap.len(), "Purged cancelled timers");
            self.cancelled = 0;
        }
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    slot: Arc<TimerSlot>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct TimerSlot {
    task: Mutex<Option<Task>>,
    // Only heap-backed timers are counted when cancelled.
    queued: bool,
}

/// Handle to a scheduled callback.
pub struct TimerHandle {
    slot: Arc<TimerSlot>,
}

impl TimerHandle {
    /// Disarms the timer. Returns `false` if it already fired or was
    /// cancelled before.
    pub fn cancel(&self) -> bool {
        if self.slot.task.lock().take().is_none() {
            return false;
        }
        if self.slot.queued {
            service().state.lock().note_cancelled();
        }
        true
    }

    pub fn is_armed(&self) -> bool {
        self.slot.task.lock().is_some()
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.is_armed())
            .finish()
    }
}

fn service() -> &'static TimerService {
    TIMER.get_or_init(|| {
        let spawned = thread::Builder::new()
            .name("promise-timer".to_string())
            .spawn(|| timer_loop(service()));
        if let Err(err) = &spawned {
            error!(error = %err, "Failed to start timer thread, timers fall back to dispatched sleeps");
        }
        TimerService {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
            running: spawned.is_ok(),
        }
    })
}

/// Runs `task` through the dispatcher once `delay` has elapsed.
pub fn after<F>(delay: Duration, task: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let service = service();
    let slot = Arc::new(TimerSlot {
        task: Mutex::new(Some(Box::new(task))),
        queued: service.running,
    });
    let handle = TimerHandle {
        slot: Arc::clone(&slot),
    };
    if !service.running {
        dispatch::dispatch(Box::new(move || {
            thread::sleep(delay);
            if let Some(task) = slot.task.lock().take() {
                task();
            }
        }));
        return handle;
    }

    let now = Instant::now();
    // Absurdly long delays are clamped to a year instead of overflowing.
    let deadline = now
        .checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60));
    let mut state = service.state.lock();
    let seq = state.next_seq;
    state.next_seq += 1;
    let is_earliest = state
        .heap
        .peek()
        .map_or(true, |Reverse(head)| deadline < head.deadline);
    state.heap.push(Reverse(Entry {
        deadline,
        seq,
        slot,
    }));
    drop(state);
    if is_earliest {
        service.wakeup.notify_one();
    }
    trace!(?delay, seq, "Timer armed");
    handle
}

fn timer_loop(service: &'static TimerService) {
    let mut due: Vec<Task> = Vec::new();
    let mut state = service.state.lock();
    loop {
        collect_due(&mut state, Instant::now(), &mut due);
        if !due.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for task in due.drain(..) {
                    dispatch::dispatch(task);
                }
            });
            continue;
        }
        match state.heap.peek() {
            Some(Reverse(head)) => {
                let deadline = head.deadline;
                service.wakeup.wait_until(&mut state, deadline);
            }
            None => service.wakeup.wait(&mut state),
        }
    }
}

fn collect_due(state: &mut TimerState, now: Instant, due: &mut Vec<Task>) {
    while let Some(Reverse(head)) = state.heap.peek() {
        if head.deadline > now {
            break;
        }
        if let Some(Reverse(entry)) = state.heap.pop() {
            match entry.slot.task.lock().take() {
                Some(task) => due.push(task),
                None => state.cancelled = state.cancelled.saturating_sub(1),
            }
        }
    }
}
