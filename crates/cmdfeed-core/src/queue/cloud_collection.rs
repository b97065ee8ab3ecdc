//! CloudQueueCollection: one cloud queue storage account.
//!
//! An account holds many small queues, one per (subject, command type, asset
//! group). Queues are created on first write; a queue that does not exist yet
//! simply pops empty.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use super::document_collection::CollectionOptions;
use super::pop_blocker::PopBlocker;
use super::retry::retry_transient;
use super::storage_failure;
use crate::domain::{CommandId, QueuePriority, SubjectType};
use crate::error::QueueError;
use crate::ports::{Clock, CloudQueueClient, QueueFeatureFlags, QueueMessage, StorageError};

/// Messages a single receive may return.
pub const MAX_MESSAGES_PER_ROUND: usize = 32;

/// Receives issued by one pop.
pub const MAX_POP_ROUNDS: usize = 4;

pub struct CloudQueueCollection {
    client: Arc<dyn CloudQueueClient>,
    flags: Arc<dyn QueueFeatureFlags>,
    pop_blocker: PopBlocker,
    options: CollectionOptions,
    known_queues: RwLock<HashSet<String>>,
}

impl CloudQueueCollection {
    pub fn new(
        client: Arc<dyn CloudQueueClient>,
        flags: Arc<dyn QueueFeatureFlags>,
        clock: Arc<dyn Clock>,
        options: CollectionOptions,
    ) -> Self {
        Self {
            pop_blocker: PopBlocker::new(options.pop_blocker_ttl, clock),
            client,
            flags,
            options,
            known_queues: RwLock::new(HashSet::new()),
        }
    }

    /// The storage account name.
    pub fn moniker(&self) -> &str {
        self.client.account_name()
    }

    pub fn weight(&self) -> u32 {
        1
    }

    pub fn priority(&self) -> QueuePriority {
        QueuePriority::Low
    }

    pub fn is_pop_blocked(&self, queue: &str) -> bool {
        self.pop_blocker.is_blocked(queue)
    }

    fn ensure_not_disabled(&self, subject_type: SubjectType) -> Result<(), QueueError> {
        if self.flags.is_disabled(self.moniker(), subject_type) {
            debug!(moniker = self.moniker(), %subject_type, "shard disabled");
            return Err(QueueError::QueueDisabled {
                moniker: self.moniker().to_string(),
                subject_type,
            });
        }
        Ok(())
    }

    fn failure(&self, what: impl Into<String>, err: StorageError) -> QueueError {
        storage_failure(self.moniker(), what, err)
    }

    fn is_known(&self, queue: &str) -> bool {
        self.known_queues
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(queue)
    }

    fn remember(&self, queue: &str) {
        self.known_queues
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(queue.to_string());
    }

    /// Create `queue` if it does not exist. Idempotent.
    pub async fn initialize_queue(&self, queue: &str) -> Result<(), QueueError> {
        retry_transient(&self.options.retry, "create_queue", || {
            self.client.create_queue_if_absent(queue)
        })
        .await
        .map_err(|e| self.failure(format!("queue {queue}"), e))?;
        self.remember(queue);
        info!(moniker = self.moniker(), queue, "cloud queue initialized");
        Ok(())
    }

    /// Re-create every queue this collection has written to.
    pub async fn initialize(&self) -> Result<(), QueueError> {
        let queues: Vec<String> = self
            .known_queues
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        for queue in queues {
            self.initialize_queue(&queue).await?;
        }
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, QueueError> {
        if self.is_known(queue) {
            return Ok(true);
        }
        let exists = self
            .client
            .queue_exists(queue)
            .await
            .map_err(|e| self.failure(format!("queue {queue}"), e))?;
        if exists {
            self.remember(queue);
        }
        Ok(exists)
    }

    pub async fn insert(
        &self,
        queue: &str,
        subject_type: SubjectType,
        body: String,
        time_to_live: Duration,
    ) -> Result<(), QueueError> {
        self.ensure_not_disabled(subject_type)?;
        if !self.is_known(queue) {
            self.initialize_queue(queue).await?;
        }
        self.client
            .add_message(queue, body, time_to_live)
            .await
            .map_err(|e| self.failure(format!("queue {queue}"), e))
    }

    /// Receive up to `max_count` messages in rounds of at most
    /// `MAX_MESSAGES_PER_ROUND`, stopping early on a short round.
    pub async fn pop(
        &self,
        queue: &str,
        subject_type: SubjectType,
        max_count: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.ensure_not_disabled(subject_type)?;
        if max_count == 0 || self.pop_blocker.is_blocked(queue) {
            return Ok(Vec::new());
        }
        if !self.queue_exists(queue).await? {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        for round in 1..=MAX_POP_ROUNDS {
            let remaining = max_count - messages.len();
            if remaining == 0 {
                break;
            }
            let request = remaining.min(MAX_MESSAGES_PER_ROUND);
            let batch = self
                .client
                .get_messages(queue, request, visibility)
                .await
                .map_err(|e| self.failure(format!("queue {queue}"), e))?;
            let received = batch.len();
            messages.extend(batch);
            debug!(moniker = self.moniker(), queue, round, received, "cloud receive");
            if received < MAX_MESSAGES_PER_ROUND {
                break;
            }
        }

        if messages.is_empty() {
            self.pop_blocker.block(queue);
        }
        Ok(messages)
    }

    /// Update a received message. A stale or unknown pop receipt is a version
    /// conflict.
    #[allow(clippy::too_many_arguments)]
    pub async fn replace(
        &self,
        queue: &str,
        subject_type: SubjectType,
        command_id: CommandId,
        message_id: &str,
        pop_receipt: &str,
        body: Option<String>,
        visibility: Duration,
    ) -> Result<String, QueueError> {
        self.ensure_not_disabled(subject_type)?;
        match self
            .client
            .update_message(queue, message_id, pop_receipt, body, visibility)
            .await
        {
            Ok(receipt) => Ok(receipt),
            Err(StorageError::PreconditionFailed | StorageError::NotFound) => {
                Err(QueueError::VersionConflict { command_id })
            }
            Err(e) => Err(self.failure(format!("command {command_id}"), e)),
        }
    }

    pub async fn delete(
        &self,
        queue: &str,
        subject_type: SubjectType,
        command_id: CommandId,
        message_id: &str,
        pop_receipt: &str,
    ) -> Result<(), QueueError> {
        self.ensure_not_disabled(subject_type)?;
        match self.client.delete_message(queue, message_id, pop_receipt).await {
            Ok(()) => Ok(()),
            Err(StorageError::PreconditionFailed) => Err(QueueError::VersionConflict { command_id }),
            Err(e) => Err(self.failure(format!("command {command_id}"), e)),
        }
    }

    /// Approximate depth, or `None` while the queue does not exist.
    pub async fn message_count(
        &self,
        queue: &str,
        subject_type: SubjectType,
    ) -> Result<Option<u64>, QueueError> {
        self.ensure_not_disabled(subject_type)?;
        if !self.queue_exists(queue).await? {
            return Ok(None);
        }
        self.client
            .approximate_message_count(queue)
            .await
            .map(Some)
            .map_err(|e| self.failure(format!("queue {queue}"), e))
    }
}

impl std::fmt::Debug for CloudQueueCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudQueueCollection")
            .field("moniker", &self.moniker())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::CloudOperation;
    use crate::queue::testing::{Fixture, SUBJECT};

    const MINUTE: Duration = Duration::from_secs(60);
    const DAY: Duration = Duration::from_secs(86_400);

    #[tokio::test]
    async fn missing_queue_pops_empty_without_receiving() {
        let fx = Fixture::new();
        let (client, collection) = fx.cloud("acct1");

        assert!(collection.pop("cq-q", SUBJECT, 10, MINUTE).await.unwrap().is_empty());
        assert_eq!(client.calls(CloudOperation::Get).await, 0);
        assert_eq!(collection.message_count("cq-q", SUBJECT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn insert_creates_queue_on_first_write() {
        let fx = Fixture::new();
        let (client, collection) = fx.cloud("acct1");
        collection.insert("cq-q", SUBJECT, "a".into(), DAY).await.unwrap();
        collection.insert("cq-q", SUBJECT, "b".into(), DAY).await.unwrap();

        assert_eq!(client.calls(CloudOperation::CreateQueue).await, 1);
        assert_eq!(collection.message_count("cq-q", SUBJECT).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn pop_reads_in_bounded_rounds() {
        let fx = Fixture::new();
        let (client, collection) = fx.cloud("acct1");
        for i in 0..200 {
            collection.insert("cq-q", SUBJECT, format!("m{i}"), DAY).await.unwrap();
        }

        let popped = collection.pop("cq-q", SUBJECT, 500, MINUTE).await.unwrap();
        assert_eq!(popped.len(), MAX_POP_ROUNDS * MAX_MESSAGES_PER_ROUND);
        assert_eq!(client.calls(CloudOperation::Get).await, MAX_POP_ROUNDS as u64);
    }

    #[tokio::test]
    async fn short_round_ends_pop() {
        let fx = Fixture::new();
        let (client, collection) = fx.cloud("acct1");
        for i in 0..40 {
            collection.insert("cq-q", SUBJECT, format!("m{i}"), DAY).await.unwrap();
        }

        let popped = collection.pop("cq-q", SUBJECT, 100, MINUTE).await.unwrap();
        assert_eq!(popped.len(), 40);
        assert_eq!(client.calls(CloudOperation::Get).await, 2);
    }

    #[tokio::test]
    async fn stale_receipt_is_a_version_conflict() {
        let fx = Fixture::new();
        let (_, collection) = fx.cloud("acct1");
        collection.insert("cq-q", SUBJECT, "a".into(), DAY).await.unwrap();
        let msg = collection.pop("cq-q", SUBJECT, 1, MINUTE).await.unwrap().remove(0);
        let id = CommandId::generate();

        collection
            .replace("cq-q", SUBJECT, id, &msg.message_id, &msg.pop_receipt, None, MINUTE)
            .await
            .unwrap();
        assert!(matches!(
            collection
                .replace("cq-q", SUBJECT, id, &msg.message_id, &msg.pop_receipt, None, MINUTE)
                .await,
            Err(QueueError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn disabled_account_makes_no_calls() {
        let fx = Fixture::new();
        let (client, collection) = fx.cloud("acct1");
        fx.flags.disable("acct1", SUBJECT);

        assert!(matches!(
            collection.insert("cq-q", SUBJECT, "a".into(), DAY).await,
            Err(QueueError::QueueDisabled { .. })
        ));
        assert!(matches!(
            collection.pop("cq-q", SUBJECT, 1, MINUTE).await,
            Err(QueueError::QueueDisabled { .. })
        ));
        assert_eq!(client.total_calls().await, 0);
    }
}
