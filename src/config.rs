//! Process-wide configuration.
//!
//! Settings are read once at startup, either from defaults, from a serialized
//! document, or from `PROMISE_*` environment variables, and then installed
//! with [`Config::install`]. Installation is one-shot: promises created
//! earlier keep the dispatcher they were launched on.

use serde::{Deserialize, Serialize};
use std::env;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::dispatch::{self, ThreadPerTask, WorkerPool};
use crate::error::{Error, Result};

static HANDLER_POOL_CONFIG: OnceLock<HandlerPoolConfig> = OnceLock::new();

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub handler_pool: HandlerPoolConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// One OS thread per unit of work.
    ThreadPerTask,
    /// A fixed set of workers fed by a bounded queue.
    WorkerPool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub policy: DispatchPolicy,
    /// Worker count, only meaningful for [`DispatchPolicy::WorkerPool`].
    pub workers: usize,
    /// Queued units before `dispatch` blocks the caller.
    pub queue_capacity: usize,
    pub thread_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            policy: DispatchPolicy::ThreadPerTask,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 1024,
            thread_name: "promise-task".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerPoolConfig {
    /// Number of cleared handler chains kept for reuse.
    pub capacity: usize,
    /// Chains that grew beyond this many slots are freed instead of pooled.
    pub max_retained_slots: usize,
}

impl Default for HandlerPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_retained_slots: 64,
        }
    }
}

impl Config {
    /// Defaults with `PROMISE_*` environment overrides applied.
    pub fn from_environment() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(policy) = env::var("PROMISE_DISPATCH_POLICY") {
            let parsed = match policy.as_str() {
                "thread_per_task" | "thread" => Some(DispatchPolicy::ThreadPerTask),
                "worker_pool" | "pool" => Some(DispatchPolicy::WorkerPool),
                other => {
                    warn!(policy = other, "Ignoring unknown dispatch policy override");
                    None
                }
            };
            if let Some(policy) = parsed {
                self.dispatch.policy = policy;
                info!("Dispatch policy override: {:?}", policy);
            }
        }

        if let Ok(workers) = env::var("PROMISE_DISPATCH_WORKERS") {
            if let Ok(workers) = workers.parse::<usize>() {
                self.dispatch.workers = workers;
                info!("Dispatch workers override: {}", workers);
            }
        }

        if let Ok(capacity) = env::var("PROMISE_DISPATCH_QUEUE_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<usize>() {
                self.dispatch.queue_capacity = capacity;
                info!("Dispatch queue capacity override: {}", capacity);
            }
        }

        if let Ok(capacity) = env::var("PROMISE_HANDLER_POOL_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<usize>() {
                self.handler_pool.capacity = capacity;
                info!("Handler pool capacity override: {}", capacity);
            }
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.policy == DispatchPolicy::WorkerPool {
            if self.dispatch.workers == 0 {
                return Err(Error::Config("worker pool needs at least one worker".into()));
            }
            if self.dispatch.queue_capacity == 0 {
                return Err(Error::Config("worker pool queue capacity must be positive".into()));
            }
        }
        if self.dispatch.thread_name.is_empty() {
            return Err(Error::Config("thread name must not be empty".into()));
        }
        Ok(())
    }

    /// Installs the handler pool settings and the configured dispatcher.
    ///
    /// Fails with [`Error::DispatcherAlreadySet`] once any dispatcher is in
    /// place, including the default one materialized by an earlier promise.
    pub fn install(self) -> Result<()> {
        self.validate()?;
        if HANDLER_POOL_CONFIG.set(self.handler_pool.clone()).is_err() {
            debug!("Handler pool already configured, keeping existing settings");
        }
        match self.dispatch.policy {
            DispatchPolicy::ThreadPerTask => {
                dispatch::set_dispatcher(ThreadPerTask::named(self.dispatch.thread_name))?
            }
            DispatchPolicy::WorkerPool => {
                let pool = WorkerPool::builder()
                    .workers(self.dispatch.workers)
                    .queue_capacity(self.dispatch.queue_capacity)
                    .thread_name(self.dispatch.thread_name)
                    .build()?;
                dispatch::set_dispatcher_arc(Arc::new(pool))?
            }
        }
        debug!(config = ?self.handler_pool, "Promise configuration installed");
        Ok(())
    }
}

pub(crate) fn handler_pool_config() -> &'static HandlerPoolConfig {
    HANDLER_POOL_CONFIG.get_or_init(HandlerPoolConfig::default)
}
