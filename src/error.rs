//! Contains the `PoolError` and `Result` types that `host-pool` uses.

use std::fmt;

use thiserror::Error;

/// The result type for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, PoolError>;

/// An error returned by the pool to its caller.
///
/// Only [`PoolError::Closed`] and [`PoolError::Timeout`] are ever returned
/// from [`crate::Pool::borrow`]; [`PoolError::Open`] is surfaced only to
/// [`crate::PoolListener`] implementations and `tracing`, since a failed
/// connection attempt does not abort the pool (host-level logic decides
/// what to do about a host that can't open connections).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool is shutting down or has shut down. Upstream should treat
    /// this as "host down, try another host".
    #[error("connection pool for {address} is closed")]
    Closed {
        /// The host the pool was serving.
        address: String,
    },

    /// No stream slot became available within the caller's deadline.
    #[error("timed out waiting for a connection to {address}")]
    Timeout {
        /// The host the caller was waiting on.
        address: String,
    },

    /// A connection attempt failed fatally (auth failure, protocol-version
    /// mismatch, cluster-name mismatch, or a transport error). The pool
    /// rolls back its `open` count and keeps running; this variant exists so
    /// that a [`PoolListener`](crate::PoolListener) or log consumer can see
    /// *why* the pool failed to reach `core`.
    #[error("failed to open connection to {address}: {source}")]
    Open {
        /// The host the connection attempt targeted.
        address: String,
        /// The underlying failure from the connection factory.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

/// A minimal string-backed error, used by tests and by callers that don't
/// want to define their own error type for connection-factory failures.
#[derive(Debug)]
pub struct StringError(pub String);

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StringError {}
