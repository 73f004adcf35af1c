use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::receiver::Receiver;

/// Errors returned by [`Server::serve`] and [`Server::shutdown`].
#[derive(Debug, Error)]
pub enum ServeError {
    /// The server completed a clean shutdown.
    ///
    /// `serve` always returns an error; this one is the expected terminal
    /// value and callers treat it as success. `shutdown` returns it once
    /// every in-flight worker has finished.
    #[error("server closed")]
    Closed,

    /// The deadline passed to [`Server::shutdown`] fired before all
    /// in-flight workers finished.
    ///
    /// The receiver cancellation signal has been raised: every in-flight
    /// receiver invocation observes its context as cancelled. Workers that
    /// ignore the signal are abandoned.
    #[error("shutdown deadline expired")]
    DeadlineExceeded,

    /// The backend fetch failed in a way the server cannot recover from.
    ///
    /// `serve` terminates with this error; the caller must reconstruct the
    /// server to resume consumption.
    #[error("backend failure: {0}")]
    Backend(#[from] std::io::Error),

    /// The server was constructed with an invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::sched::ConfigError),
}

/// Serves messages from a backend to a receiver.
#[async_trait]
pub trait Server: Send + Sync {
    /// Blocks fetching messages from the backend and dispatching each to
    /// `receiver` on a bounded worker pool, until [`shutdown`](Self::shutdown)
    /// is called.
    ///
    /// Returns [`ServeError::Closed`] after a shutdown completes; any other
    /// error is a fatal backend condition.
    async fn serve(&self, receiver: Arc<dyn Receiver>) -> Result<(), ServeError>;

    /// Gracefully shuts the server down, letting in-flight messages finish.
    ///
    /// Intake stops immediately; the call then waits for the worker pool to
    /// drain and returns [`ServeError::Closed`]. If `deadline` is cancelled
    /// before the pool is quiescent, the remaining workers receive the
    /// receiver cancellation signal and
    /// [`ServeError::DeadlineExceeded`] is returned.
    async fn shutdown(&self, deadline: CancellationToken) -> Result<(), ServeError>;
}
