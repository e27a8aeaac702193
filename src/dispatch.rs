//! Dispatch policy: who runs executors and timer callbacks.
//!
//! The core never spawns anything itself. Every unit of work goes through the
//! process-wide [`Dispatch`] implementation, which defaults to one OS thread
//! per unit and can be replaced once, at startup, with [`set_dispatcher`].
//! Replacing it does not affect units that were already handed off.

use crossbeam::channel::{self, Receiver, Sender};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// A zero-argument unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

static DISPATCHER: OnceLock<Arc<dyn Dispatch>> = OnceLock::new();

/// Runs units of work asynchronously.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, task: Task);
}

impl<F> Dispatch for F
where
    F: Fn(Task) + Send + Sync + 'static,
{
    fn dispatch(&self, task: Task) {
        self(task)
    }
}

/// Installs the process-wide dispatcher.
///
/// Only the first installation wins. Once a promise has been created the
/// default policy is already in place and this returns
/// [`Error::DispatcherAlreadySet`].
pub fn set_dispatcher<D: Dispatch>(dispatcher: D) -> Result<()> {
    set_dispatcher_arc(Arc::new(dispatcher))
}

pub fn set_dispatcher_arc(dispatcher: Arc<dyn Dispatch>) -> Result<()> {
    DISPATCHER
        .set(dispatcher)
        .map_err(|_| Error::DispatcherAlreadySet)?;
    debug!("Process-wide dispatcher installed");
    Ok(())
}

/// The installed dispatcher, materializing the default on first use.
pub fn dispatcher() -> &'static Arc<dyn Dispatch> {
    DISPATCHER.get_or_init(|| Arc::new(ThreadPerTask::default()))
}

pub(crate) fn dispatch(task: Task) {
    dispatcher().dispatch(task)
}

/// Runs `task` behind a panic barrier so a user fault never unwinds into the
/// dispatcher's own thread.
pub(crate) fn run_contained(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let err = Error::from_panic(payload);
        warn!(error = %err, "Dispatched unit of work panicked");
    }
}

/// Default policy: spawn a fresh thread per unit.
#[derive(Debug, Clone)]
pub struct ThreadPerTask {
    name: String,
}

impl ThreadPerTask {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadPerTask {
    fn default() -> Self {
        Self::named("promise-task")
    }
}

impl Dispatch for ThreadPerTask {
    fn dispatch(&self, task: Task) {
        let result = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_contained(task));
        // A failed spawn drops the task, and with it any producer it owned,
        // so the promise it would have settled rejects instead of hanging.
        if let Err(err) = result {
            error!(error = %err, "Failed to spawn dispatch thread, unit of work dropped");
        }
    }
}

/// Bounded worker pool fed by a crossbeam queue.
///
/// `dispatch` blocks when the queue is full. Dropping the pool closes the
/// queue and joins the workers after they drain what is left.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolBuilder {
    workers: usize,
    queue_capacity: usize,
    thread_name: String,
}

impl WorkerPoolBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<WorkerPool> {
        if self.workers == 0 {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }
        let (sender, receiver) = channel::bounded::<Task>(self.queue_capacity.max(1));
        let mut workers = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let receiver: Receiver<Task> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.thread_name, index))
                .spawn(move || {
                    for task in receiver.iter() {
                        run_contained(task);
                    }
                })?;
            workers.push(handle);
        }
        debug!(workers = self.workers, capacity = self.queue_capacity, "Worker pool started");
        Ok(WorkerPool {
            sender: Some(sender),
            workers,
        })
    }
}

impl WorkerPool {
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            workers: 4,
            queue_capacity: 1024,
            thread_name: "promise-worker".to_string(),
        }
    }

    pub fn new(workers: usize, queue_capacity: usize) -> Result<Self> {
        Self::builder()
            .workers(workers)
            .queue_capacity(queue_capacity)
            .build()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Dispatch for WorkerPool {
    fn dispatch(&self, task: Task) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        if let Err(channel::SendError(task)) = sender.send(task) {
            warn!("Worker pool queue closed, running unit inline");
            run_contained(task);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            let _ = worker.join();
        }
    }
}
