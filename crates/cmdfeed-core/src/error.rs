use std::time::Duration;

use thiserror::Error;

use crate::domain::{CommandId, SubjectType};

/// Errors surfaced by physical collections, command queues and the factory.
///
/// Backend specific failures are translated into these variants before they
/// leave a collection.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An operator pulled this shard out of rotation.
    #[error("queue {moniker}.{subject_type} is disabled by flight")]
    QueueDisabled {
        moniker: String,
        subject_type: SubjectType,
    },

    /// The receipt was issued by a different queue. Always a caller bug.
    #[error("invalid lease receipt: {0}")]
    InvalidLeaseReceipt(String),

    /// Optimistic concurrency precondition failed.
    #[error("version conflict for command {command_id}")]
    VersionConflict { command_id: CommandId },

    #[error("throttled by {moniker}")]
    Throttled {
        moniker: String,
        retry_after: Option<Duration>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The caller's cancellation token fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,

    #[error("codec error: {0}")]
    Codec(#[from] crate::ports::CodecError),

    /// Anything unclassified (transport failures and the like).
    #[error("storage error on {moniker}: {message}")]
    Storage { moniker: String, message: String },
}

impl QueueError {
    /// Expected under normal contention; callers usually re-pop and move on.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            QueueError::VersionConflict { .. } | QueueError::Throttled { .. }
        )
    }
}
