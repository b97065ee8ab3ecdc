//! DocumentCommandQueue: one agent queue (agent, asset group) on one
//! document database collection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::document_collection::DocumentQueueCollection;
use super::{
    CommandQueue, CommandQueuePopResult, ReplaceOperations, ensure_lease_receipt,
    time_to_live_secs,
};
use crate::domain::{
    AgentId, AssetGroupId, LeaseReceipt, PrivacyCommand, QueuePriority, QueueStorageKind,
    partition_key,
};
use crate::error::QueueError;
use crate::observability::AgentQueueStatistics;
use crate::ports::{Clock, CommandCodec, CommandDocument, VersionedDocument};

pub struct DocumentCommandQueue {
    collection: Arc<DocumentQueueCollection>,
    codec: Arc<dyn CommandCodec>,
    clock: Arc<dyn Clock>,
    agent_id: AgentId,
    asset_group_id: AssetGroupId,
    partition_key: String,
    default_lease: Duration,
}

impl DocumentCommandQueue {
    /// `default_lease` is the agent's override if it has one, else the
    /// configured default.
    pub fn new(
        collection: Arc<DocumentQueueCollection>,
        codec: Arc<dyn CommandCodec>,
        clock: Arc<dyn Clock>,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        default_lease: Duration,
    ) -> Self {
        Self {
            partition_key: partition_key(&agent_id, &asset_group_id),
            collection,
            codec,
            clock,
            agent_id,
            asset_group_id,
            default_lease,
        }
    }

    pub fn moniker(&self) -> &str {
        self.collection.moniker()
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    fn check_address(&self, command: &PrivacyCommand) -> Result<(), QueueError> {
        if command.agent_id != self.agent_id
            || command.asset_group_id != self.asset_group_id
            || command.subject_type != self.collection.subject_type()
        {
            return Err(QueueError::InvalidArgument(format!(
                "command {} is not addressed to queue {}",
                command.command_id, self.partition_key
            )));
        }
        Ok(())
    }

    fn to_document(&self, command: &PrivacyCommand) -> Result<CommandDocument, QueueError> {
        let mut document = self.codec.to_document(command)?;
        document.pk = self.partition_key.clone();
        document.ttl = Some(time_to_live_secs(
            self.clock.now(),
            command.absolute_expiration_time,
        ));
        Ok(document)
    }

    fn with_receipt(&self, versioned: &VersionedDocument) -> Result<PrivacyCommand, QueueError> {
        let command = self.codec.from_document(&versioned.document)?;
        let receipt = LeaseReceipt::for_command(
            self.moniker(),
            versioned.etag.clone(),
            &command,
            QueueStorageKind::DocumentDb,
        );
        Ok(command.with_lease_receipt(receipt))
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[async_trait]
impl CommandQueue for DocumentCommandQueue {
    async fn enqueue(&self, command: PrivacyCommand) -> Result<(), QueueError> {
        self.check_address(&command)?;
        let document = self.to_document(&command)?;
        self.collection.insert(document).await?;
        debug!(moniker = self.moniker(), command_id = %command.command_id, "enqueued");
        Ok(())
    }

    async fn upsert(&self, command: PrivacyCommand) -> Result<(), QueueError> {
        self.check_address(&command)?;
        let document = self.to_document(&command)?;
        self.collection.upsert(&self.partition_key, document).await?;
        Ok(())
    }

    async fn pop(
        &self,
        max_count: usize,
        lease_duration: Option<Duration>,
    ) -> Result<CommandQueuePopResult, QueueError> {
        let lease = lease_duration.unwrap_or(self.default_lease);
        let leased = self
            .collection
            .pop(lease, &self.partition_key, max_count)
            .await?;

        let mut result = CommandQueuePopResult::default();
        for versioned in &leased {
            match self.with_receipt(versioned) {
                Ok(command) => result.commands.push(command),
                Err(err) => result.errors.push(err),
            }
        }
        Ok(result)
    }

    async fn replace(
        &self,
        receipt: &LeaseReceipt,
        command: PrivacyCommand,
        _operations: ReplaceOperations,
    ) -> Result<LeaseReceipt, QueueError> {
        ensure_lease_receipt(self, receipt)?;
        if command.command_id != receipt.command_id() {
            return Err(QueueError::InvalidArgument(format!(
                "receipt is for command {}, not {}",
                receipt.command_id(),
                command.command_id
            )));
        }
        let document = self.to_document(&command)?;
        let etag = self.collection.replace(document, receipt.token()).await?;
        Ok(LeaseReceipt::for_command(
            self.moniker(),
            etag,
            &command,
            QueueStorageKind::DocumentDb,
        ))
    }

    async fn delete(&self, receipt: &LeaseReceipt) -> Result<(), QueueError> {
        ensure_lease_receipt(self, receipt)?;
        match self
            .collection
            .delete(&self.partition_key, receipt.command_id())
            .await
        {
            Ok(()) | Err(QueueError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn query(&self, receipt: &LeaseReceipt) -> Result<Option<PrivacyCommand>, QueueError> {
        ensure_lease_receipt(self, receipt)?;
        let found = self
            .collection
            .query(&self.partition_key, receipt.command_id())
            .await?;
        found.as_ref().map(|v| self.with_receipt(v)).transpose()
    }

    async fn flush_agent_queue(
        &self,
        max_created_time: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.collection
            .flush(&self.partition_key, max_created_time, token)
            .await?;
        Ok(())
    }

    async fn queue_statistics(
        &self,
        detailed: bool,
        token: &CancellationToken,
    ) -> Result<Vec<AgentQueueStatistics>, QueueError> {
        let stats = self
            .collection
            .statistics(&self.partition_key, detailed, token)
            .await?;

        let mut view = AgentQueueStatistics::new(
            self.moniker(),
            self.collection.subject_type(),
            self.agent_id,
            self.asset_group_id,
            start_of_day(self.clock.now()),
        );
        view.pending_command_count = stats.pending;
        view.unleased_command_count = Some(stats.unleased);
        view.oldest_pending_command_time = stats.oldest_pending;
        view.earliest_lease_available_time = stats.earliest_lease_available;
        view.per_command_type = stats.per_command_type;
        Ok(vec![view])
    }

    fn supports_lease_receipt(&self, receipt: &LeaseReceipt) -> bool {
        receipt.moniker() == self.moniker()
            && receipt.agent_id() == self.agent_id
            && receipt.asset_group_id() == self.asset_group_id
            && receipt.subject_type() == self.collection.subject_type()
    }

    fn supports_flush_by_date(&self) -> bool {
        true
    }

    fn priority(&self) -> QueuePriority {
        self.collection.priority()
    }

    fn is_pop_blocked(&self) -> bool {
        self.collection.is_pop_blocked(&self.partition_key)
    }
}

impl std::fmt::Debug for DocumentCommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCommandQueue")
            .field("moniker", &self.moniker())
            .field("partition_key", &self.partition_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PrivacyCommandType, SubjectType};
    use crate::impls::{JsonCommandCodec, StoreOperation};
    use crate::queue::testing::Fixture;
    use std::collections::HashSet;

    const LEASE: Duration = Duration::from_secs(300);

    struct Setup {
        fx: Fixture,
        queue: DocumentCommandQueue,
        agent: AgentId,
        group: AssetGroupId,
    }

    async fn setup() -> Setup {
        let fx = Fixture::new();
        let collection = fx.ready_collection("db1", 1).await;
        let agent = AgentId::generate();
        let group = AssetGroupId::generate();
        let queue = DocumentCommandQueue::new(
            collection,
            Arc::new(JsonCommandCodec),
            fx.clock(),
            agent,
            group,
            LEASE,
        );
        Setup { fx, queue, agent, group }
    }

    impl Setup {
        fn command(&self) -> PrivacyCommand {
            self.fx.command(PrivacyCommandType::Delete, self.agent, self.group)
        }
    }

    #[tokio::test]
    async fn popped_commands_carry_receipts() {
        let s = setup().await;
        let command = s.command();
        s.queue.enqueue(command.clone()).await.unwrap();

        let popped = s.queue.pop(10, None).await.unwrap();
        assert_eq!(popped.commands.len(), 1);
        let leased = &popped.commands[0];
        let receipt = leased.lease_receipt.as_ref().unwrap();

        assert_eq!(leased.command_id, command.command_id);
        assert_eq!(receipt.moniker(), "db1");
        assert_eq!(receipt.storage_kind(), QueueStorageKind::DocumentDb);
        assert_eq!(leased.next_visible_time, s.fx.clock.now() + chrono::Duration::seconds(300));
        assert!(s.queue.supports_lease_receipt(receipt));
    }

    #[tokio::test]
    async fn concurrent_pops_never_share_a_command() {
        let s = setup().await;
        for _ in 0..20 {
            s.queue.enqueue(s.command()).await.unwrap();
        }

        let (a, b) = tokio::join!(s.queue.pop(15, None), s.queue.pop(15, None));
        let a = a.unwrap().commands;
        let b = b.unwrap().commands;
        assert_eq!(a.len() + b.len(), 20);
        let ids: HashSet<_> = a.iter().chain(&b).map(|c| c.command_id).collect();
        assert_eq!(ids.len(), 20);
    }

    #[tokio::test]
    async fn expired_lease_makes_command_poppable_again() {
        let s = setup().await;
        s.queue.enqueue(s.command()).await.unwrap();
        assert_eq!(s.queue.pop(1, Some(Duration::from_secs(30))).await.unwrap().commands.len(), 1);

        // Second pop is empty and blocks the partition for a minute; the
        // lease has lapsed by the time the block does.
        assert!(s.queue.pop(1, None).await.unwrap().is_empty());
        s.fx.clock.advance(Duration::from_secs(61));
        assert_eq!(s.queue.pop(1, None).await.unwrap().commands.len(), 1);
    }

    #[tokio::test]
    async fn replace_returns_new_receipt_and_retires_old_one() {
        let s = setup().await;
        s.queue.enqueue(s.command()).await.unwrap();
        let mut leased = s.queue.pop(1, None).await.unwrap().commands.remove(0);
        let old = leased.lease_receipt.take().unwrap();

        leased.next_visible_time = s.fx.clock.now() + chrono::Duration::minutes(30);
        let new = s.queue.replace(&old, leased.clone(), ReplaceOperations::ALL).await.unwrap();
        assert_ne!(new.token(), old.token());

        let err = s.queue.replace(&old, leased.clone(), ReplaceOperations::ALL).await.unwrap_err();
        assert!(matches!(err, QueueError::VersionConflict { .. }));
        assert!(err.is_expected());

        s.queue.replace(&new, leased, ReplaceOperations::ALL).await.unwrap();
    }

    #[tokio::test]
    async fn only_one_of_two_racing_replaces_wins() {
        let s = setup().await;
        s.queue.enqueue(s.command()).await.unwrap();
        let mut leased = s.queue.pop(1, None).await.unwrap().commands.remove(0);
        let receipt = leased.lease_receipt.take().unwrap();

        let (a, b) = tokio::join!(
            s.queue.replace(&receipt, leased.clone(), ReplaceOperations::ALL),
            s.queue.replace(&receipt, leased.clone(), ReplaceOperations::ALL)
        );
        let wins = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn foreign_receipt_is_rejected_everywhere() {
        let s = setup().await;
        let other_agent = s.fx.command(PrivacyCommandType::Delete, AgentId::generate(), s.group);
        let foreign = LeaseReceipt::for_command("db1", "\"1\"", &other_agent, QueueStorageKind::DocumentDb);
        let other_moniker = LeaseReceipt::for_command("db2", "\"1\"", &s.command(), QueueStorageKind::DocumentDb);

        for receipt in [&foreign, &other_moniker] {
            assert!(!s.queue.supports_lease_receipt(receipt));
            assert!(matches!(s.queue.delete(receipt).await, Err(QueueError::InvalidLeaseReceipt(_))));
            assert!(matches!(s.queue.query(receipt).await, Err(QueueError::InvalidLeaseReceipt(_))));
            assert!(matches!(
                s.queue.replace(receipt, s.command(), ReplaceOperations::ALL).await,
                Err(QueueError::InvalidLeaseReceipt(_))
            ));
        }
        assert_eq!(s.fx.store.calls(StoreOperation::Delete).await, 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let s = setup().await;
        s.queue.enqueue(s.command()).await.unwrap();
        let leased = s.queue.pop(1, None).await.unwrap().commands.remove(0);
        let receipt = leased.lease_receipt.unwrap();

        s.queue.delete(&receipt).await.unwrap();
        s.queue.delete(&receipt).await.unwrap();
        assert_eq!(s.queue.query(&receipt).await.unwrap(), None);
    }

    #[tokio::test]
    async fn query_attaches_current_receipt() {
        let s = setup().await;
        s.queue.enqueue(s.command()).await.unwrap();
        let leased = s.queue.pop(1, None).await.unwrap().commands.remove(0);
        let receipt = leased.lease_receipt.unwrap();

        let found = s.queue.query(&receipt).await.unwrap().unwrap();
        assert_eq!(found.lease_receipt.as_ref().map(|r| r.token()), Some(receipt.token()));
    }

    #[tokio::test]
    async fn documents_are_stamped_with_partition_and_ttl() {
        let s = setup().await;
        let command = s.command();
        let document = s.queue.to_document(&command).unwrap();
        assert_eq!(document.pk, s.queue.partition_key());
        assert_eq!(document.ttl, Some(30 * 86_400));
    }

    #[tokio::test]
    async fn misaddressed_command_is_rejected() {
        let s = setup().await;
        let mut command = s.command();
        command.subject_type = SubjectType::Device;
        assert!(matches!(s.queue.enqueue(command).await, Err(QueueError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn statistics_describe_the_agent_queue() {
        let s = setup().await;
        s.queue.enqueue(s.command()).await.unwrap();
        s.queue.enqueue(s.command()).await.unwrap();
        s.queue.pop(1, None).await.unwrap();

        let stats = s.queue.queue_statistics(true, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.len(), 1);
        let view = &stats[0];
        assert_eq!(view.moniker, "db1");
        assert_eq!(view.agent_id, s.agent);
        assert_eq!(view.pending_command_count, 2);
        assert_eq!(view.unleased_command_count, Some(1));
        assert_eq!(view.per_command_type.get(&PrivacyCommandType::Delete), Some(&2));
        assert_eq!(view.query_date, start_of_day(s.fx.clock.now()));
    }

    #[tokio::test]
    async fn flush_removes_agent_commands() {
        let s = setup().await;
        for _ in 0..3 {
            s.queue.enqueue(s.command()).await.unwrap();
        }
        s.queue
            .flush_agent_queue(s.fx.clock.now(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(s.queue.pop(10, None).await.unwrap().is_empty());
    }
}
