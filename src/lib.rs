//! Single-assignment promises for threaded Rust.
//!
//! A [`Promise`] is settled exactly once, fulfilled with a value or rejected
//! with an [`Error`]. Consumers attach continuations before or after that
//! happens ([`Promise::then`], [`Promise::catch`], [`Promise::finally`]),
//! combine promises ([`all`], [`any`], [`race`], [`all_settled`]) and block
//! on the result with [`Promise::wait`] or `.await` it from async code.
//!
//! Executors run on a pluggable, process-wide [`Dispatch`] policy that
//! defaults to one thread per unit of work.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{all, Promise};
//!
//! let greeting = Promise::new(|producer| {
//!     producer.resolve("Hello Promise".to_string());
//! });
//! let shout = greeting.then(|s| Ok(s.to_uppercase()));
//! assert_eq!(shout.wait().unwrap(), "HELLO PROMISE");
//!
//! let sum: i32 = all([Promise::resolved(1), Promise::resolved(2)])
//!     .wait()
//!     .unwrap()
//!     .into_iter()
//!     .sum();
//! assert_eq!(sum, 3);
//! ```

pub mod cancel;
pub mod chain;
pub mod combinator;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod future;
pub mod handler;
pub mod promise;
pub mod timeout;
pub mod timer;

pub use cancel::{CancelRegistration, CancelToken};
pub use chain::map;
pub use combinator::{all, all_settled, any, race, SettledResult};
pub use config::{Config, DispatchConfig, DispatchPolicy, HandlerPoolConfig};
pub use dispatch::{dispatcher, set_dispatcher, Dispatch, Task, ThreadPerTask, WorkerPool};
pub use error::{AggregateError, Error, Result};
pub use future::PromiseFuture;
pub use handler::{handler_pool_stats, HandlerPoolStats};
pub use promise::{promisify, Producer, Promise, State};
pub use timeout::delay;
