use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a promise was rejected, or why an operation on the crate failed.
///
/// Errors are cheap to clone: one rejection is observed by every waiter and
/// every continuation attached to the promise.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Source(Arc<dyn std::error::Error + Send + Sync + 'static>),
    #[error("panic: {0}")]
    Panicked(String),
    #[error("{0}")]
    Timeout(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("aggregate error: {0}")]
    Aggregate(AggregateError),
    #[error("producer dropped without settling the promise")]
    ProducerDropped,
    #[error("a dispatcher has already been installed")]
    DispatcherAlreadySet,
    #[error("failed to spawn thread: {0}")]
    Spawn(Arc<std::io::Error>),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Domain rejection carrying a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Rejected(message.into())
    }

    /// Wraps an application error.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Source(Arc::new(err))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// True for both explicit cancellation and an expired deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panicked(_))
    }

    /// Converts a caught panic payload into a rejection.
    ///
    /// A payload that already is an [`Error`] (`std::panic::panic_any(err)`)
    /// is passed through untouched.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Error>() {
            Ok(err) => return *err,
            Err(payload) => payload,
        };
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            Error::Panicked((*message).to_string())
        } else if let Some(message) = payload.downcast_ref::<String>() {
            Error::Panicked(message.clone())
        } else {
            Error::Panicked("unknown panic payload".to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Spawn(Arc::new(err))
    }
}

/// Synthesized when no input of a combinator produced a usable outcome.
#[derive(Debug, Clone)]
pub struct AggregateError {
    message: &'static str,
    errors: Vec<Error>,
}

impl AggregateError {
    pub(crate) fn empty(message: &'static str) -> Self {
        Self {
            message,
            errors: Vec::new(),
        }
    }

    pub(crate) fn all_rejected(errors: Vec<Error>) -> Self {
        Self {
            message: "all promises rejected",
            errors,
        }
    }

    /// Individual rejections, in input order.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}
