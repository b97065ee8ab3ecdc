//! Queue module: physical collections, per-backend command queues, the
//! logical queue that spreads an address over shards, and the factory that
//! assembles and caches them.

mod cache;
mod cloud_collection;
mod cloud_queue;
mod document_collection;
mod document_queue;
mod factory;
mod logical;
mod pop_blocker;
mod retry;
mod weighted;

pub use cache::{LogicalQueueCache, QueueKey};
pub use cloud_collection::CloudQueueCollection;
pub use cloud_queue::{CLOUD_COMMAND_TYPES, CloudCommandQueue, cloud_queue_name};
pub use document_collection::{CollectionOptions, DocumentQueueCollection, FlushOutcome};
pub use document_queue::DocumentCommandQueue;
pub use factory::{CommandQueueFactory, CommandQueueFactoryBuilder};
pub use logical::{LogicalCommandQueue, LogicalQueueMember};
pub use pop_blocker::PopBlocker;
pub use retry::{RetryPolicy, retry_transient};
pub use weighted::choose_weighted;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::domain::{LeaseReceipt, PrivacyCommand, PrivacyCommandType, QueuePriority};
use crate::error::QueueError;
use crate::observability::AgentQueueStatistics;
use crate::ports::StorageError;

/// Which parts of a leased command a replace writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceOperations {
    /// Write the command body.
    pub content: bool,
    /// Move the lease expiry to the command's `next_visible_time`.
    pub lease_extension: bool,
}

impl ReplaceOperations {
    pub const CONTENT: ReplaceOperations = ReplaceOperations {
        content: true,
        lease_extension: false,
    };

    pub const LEASE_EXTENSION: ReplaceOperations = ReplaceOperations {
        content: false,
        lease_extension: true,
    };

    pub const ALL: ReplaceOperations = ReplaceOperations {
        content: true,
        lease_extension: true,
    };
}

/// Commands leased by one pop, plus the per-item or per-member failures that
/// did not stop it.
#[derive(Debug, Default)]
pub struct CommandQueuePopResult {
    pub commands: Vec<PrivacyCommand>,
    pub errors: Vec<QueueError>,
}

impl CommandQueuePopResult {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Uniform queue contract, implemented by each backend adapter and by the
/// logical queue that composes them.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    async fn enqueue(&self, command: PrivacyCommand) -> Result<(), QueueError>;

    /// Create-or-replace without a version precondition.
    async fn upsert(&self, command: PrivacyCommand) -> Result<(), QueueError>;

    /// Lease up to `max_count` visible commands. `lease_duration` overrides the
    /// queue's default lease.
    async fn pop(
        &self,
        max_count: usize,
        lease_duration: Option<Duration>,
    ) -> Result<CommandQueuePopResult, QueueError>;

    /// Write `command` back under the lease held by `receipt`; returns the
    /// receipt for the new version.
    async fn replace(
        &self,
        receipt: &LeaseReceipt,
        command: PrivacyCommand,
        operations: ReplaceOperations,
    ) -> Result<LeaseReceipt, QueueError>;

    /// Complete a leased command. Already gone counts as done.
    async fn delete(&self, receipt: &LeaseReceipt) -> Result<(), QueueError>;

    async fn query(&self, receipt: &LeaseReceipt) -> Result<Option<PrivacyCommand>, QueueError>;

    /// Remove every command created at or before `max_created_time`.
    async fn flush_agent_queue(
        &self,
        max_created_time: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<(), QueueError>;

    async fn queue_statistics(
        &self,
        detailed: bool,
        token: &CancellationToken,
    ) -> Result<Vec<AgentQueueStatistics>, QueueError>;

    /// Was `receipt` issued by this queue?
    fn supports_lease_receipt(&self, receipt: &LeaseReceipt) -> bool;

    fn supports_flush_by_date(&self) -> bool;

    fn priority(&self) -> QueuePriority;

    fn accepts_command_type(&self, _command_type: PrivacyCommandType) -> bool {
        true
    }

    /// A recent pop came back empty; probing again now would be wasted.
    fn is_pop_blocked(&self) -> bool {
        false
    }
}

/// Fail with `InvalidLeaseReceipt` unless `queue` issued `receipt`.
pub fn ensure_lease_receipt(
    queue: &dyn CommandQueue,
    receipt: &LeaseReceipt,
) -> Result<(), QueueError> {
    if queue.supports_lease_receipt(receipt) {
        Ok(())
    } else {
        Err(QueueError::InvalidLeaseReceipt(format!(
            "receipt for command {} from {} ({}) does not belong to this queue",
            receipt.command_id(),
            receipt.moniker(),
            receipt.storage_kind()
        )))
    }
}

/// Translate a backend failure on `moniker`. `what` names the item involved.
pub(crate) fn storage_failure(moniker: &str, what: impl Into<String>, err: StorageError) -> QueueError {
    match err {
        StorageError::NotFound => QueueError::NotFound(what.into()),
        StorageError::Conflict => QueueError::Conflict(what.into()),
        StorageError::Throttled { retry_after } => QueueError::Throttled {
            moniker: moniker.to_string(),
            retry_after,
        },
        StorageError::BadRequest(message) => QueueError::InvalidArgument(message),
        StorageError::PreconditionFailed => QueueError::Storage {
            moniker: moniker.to_string(),
            message: format!("precondition failed for {}", what.into()),
        },
        StorageError::Unavailable(message) | StorageError::Fatal(message) => QueueError::Storage {
            moniker: moniker.to_string(),
            message,
        },
    }
}

/// Whole seconds from `now` until `expires`, at least one.
pub(crate) fn time_to_live_secs(now: DateTime<Utc>, expires: DateTime<Utc>) -> i64 {
    let millis = (expires - now).num_milliseconds();
    let secs = millis.div_euclid(1000) + i64::from(millis.rem_euclid(1000) != 0);
    secs.max(1)
}

/// Sleep for `duration` unless `token` fires first. Returns true when cancelled.
pub(crate) async fn cancellable_sleep(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
pub(crate) mod testing;
