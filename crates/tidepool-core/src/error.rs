//! Error types surfaced by the pool.

use std::sync::Arc;

use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// An opaque, shareable cause produced by a connection factory, transport or
/// keep-alive probe.
///
/// Causes are reference-counted because a single factory failure may complete
/// many queued lease requests, each of which receives a clone of the error.
pub type ConnectionCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned to lease callers.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The pool is shutting down or already shut down; no new leases are
    /// granted and queued requests are drained with this error.
    #[error("pool is shut down")]
    Shutdown,

    /// The caller cancelled the lease request while it was queued or before
    /// the lease was delivered.
    #[error("lease request was cancelled")]
    RequestCancelled,

    /// Connection establishment failed and no alternative capacity or
    /// creation path exists to satisfy the request.
    #[error("connection establishment failed")]
    ConnectFailed(#[source] ConnectionCause),

    /// The hard connection limit is reached and the request could not be
    /// queued. Only produced when queueing is bounded; the default pool
    /// queues without bound and lets requests wait instead.
    #[error("pool capacity exhausted")]
    CapacityExhausted,

    /// `run()` was invoked on a pool whose event loop is already running.
    #[error("pool is already running")]
    AlreadyRunning,
}

impl PoolError {
    /// Wrap a factory or transport error as a `ConnectFailed` cause.
    pub fn connect_failed<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ConnectFailed(Arc::new(cause))
    }
}

/// Errors produced by configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The hard connection limit must be at least one.
    #[error("hard connection limit must be greater than zero")]
    ZeroHardLimit,

    /// The soft limit may not exceed the hard limit.
    #[error("soft connection limit {soft} exceeds hard limit {hard}")]
    SoftAboveHard {
        /// Configured soft limit.
        soft: usize,
        /// Configured hard limit.
        hard: usize,
    },

    /// The minimum connection count may not exceed the hard limit.
    #[error("minimum connection count {min} exceeds hard limit {hard}")]
    MinimumAboveHard {
        /// Configured minimum.
        min: usize,
        /// Configured hard limit.
        hard: usize,
    },

    /// A manager needs at least one executor to shard over.
    #[error("at least one executor is required")]
    NoExecutors,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("connection refused")]
    struct Refused;

    #[test]
    fn connect_failed_preserves_cause() {
        let err = PoolError::connect_failed(Refused);
        let source = std::error::Error::source(&err).expect("cause attached");
        assert_eq!(source.to_string(), "connection refused");
    }

    #[test]
    fn errors_are_cloneable() {
        let err = PoolError::connect_failed(Refused);
        let cloned = err.clone();
        assert!(matches!(cloned, PoolError::ConnectFailed(_)));
    }

    #[test]
    fn display_messages() {
        assert_eq!(PoolError::Shutdown.to_string(), "pool is shut down");
        assert_eq!(
            PoolError::RequestCancelled.to_string(),
            "lease request was cancelled"
        );
    }
}
