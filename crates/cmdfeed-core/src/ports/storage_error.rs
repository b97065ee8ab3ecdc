//! StorageError - outcome of a single backend call.
//!
//! Backend clients report expected conditions as explicit variants so the
//! collections can match on them (flush tolerates `NotFound`, initialization
//! retries `Throttled`) instead of inspecting opaque errors.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("item not found")]
    NotFound,

    #[error("item already exists")]
    Conflict,

    /// Version (etag / pop receipt) precondition did not match.
    #[error("precondition failed")]
    PreconditionFailed,

    #[error("request rate too large")]
    Throttled { retry_after: Option<Duration> },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Fatal(String),
}

impl StorageError {
    /// Throttling and unavailability are worth waiting out.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Throttled { .. } | StorageError::Unavailable(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StorageError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}
