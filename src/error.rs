//! Error types for counter storage and limiter construction.
//!
//! Admission rejection is not an error: it is a [`Decision::Denied`](crate::Decision)
//! rendered into a response. Storage errors never reach the algorithms (the counter store
//! fails open), so the only error a caller has to handle up front is [`BuildError`].
use std::time::Duration;

/// Boxed backend error carried by [`StorageError::Backend`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a [`Storage`](crate::rate_limit::store::Storage) backend.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// The backend could not be reached (connection refused, timeout, ...).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The backend returned an error of its own.
    #[error("storage backend error: {0}")]
    Backend(#[source] BoxError),
    /// A stored record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StorageError {
    /// Wrap an arbitrary backend error.
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        StorageError::Backend(err.into())
    }
}

/// Errors produced while building a limiter.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The window must be at least one second long.
    #[error("window must be at least one second (got {0:?})")]
    WindowTooShort(Duration),
    /// Window arithmetic is done on 32-bit second timestamps.
    #[error("window must fit in u32 seconds (got {0:?})")]
    WindowTooLong(Duration),
    /// A whole-second window was expected.
    #[error("window must be a whole number of seconds (got {0:?})")]
    FractionalWindow(Duration),
}
