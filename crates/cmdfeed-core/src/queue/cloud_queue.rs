//! CloudCommandQueue: one (agent, asset group, command type) queue in a
//! cloud queue storage account.
//!
//! Only age-out commands live on this tier. The account cannot query or flush
//! a single message, so those operations report `NotSupported`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cloud_collection::CloudQueueCollection;
use super::{
    CommandQueue, CommandQueuePopResult, ReplaceOperations, ensure_lease_receipt,
    time_to_live_secs,
};
use crate::domain::{
    AgentId, AssetGroupId, LeaseReceipt, PrivacyCommand, PrivacyCommandType, QueuePriority,
    QueueStorageKind, SubjectType,
};
use crate::error::QueueError;
use crate::observability::AgentQueueStatistics;
use crate::ports::{Clock, CommandCodec, QueueMessage};

/// Command types the cloud tier can hold.
pub const CLOUD_COMMAND_TYPES: [PrivacyCommandType; 1] = [PrivacyCommandType::AgeOut];

/// Queue name for an address: `cq-{subject}-{command type}-{asset group}`,
/// lower-cased to satisfy the account's naming rules.
pub fn cloud_queue_name(
    subject_type: SubjectType,
    command_type: PrivacyCommandType,
    asset_group_id: &AssetGroupId,
) -> String {
    format!(
        "cq-{}-{}-{}",
        subject_type.code(),
        command_type.code(),
        asset_group_id
    )
    .to_ascii_lowercase()
}

/// Lease token of a cloud message: message id plus pop receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MessageToken {
    #[serde(rename = "mi")]
    message_id: String,
    #[serde(rename = "pr")]
    pop_receipt: String,
}

impl MessageToken {
    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn decode(token: &str) -> Result<Self, QueueError> {
        serde_json::from_str(token)
            .map_err(|e| QueueError::InvalidLeaseReceipt(format!("malformed message token: {e}")))
    }
}

/// Whole seconds until `next_visible`, rounded down; zero once it has passed.
fn visibility_timeout(now: DateTime<Utc>, next_visible: DateTime<Utc>) -> Duration {
    let secs = (next_visible - now).num_seconds();
    Duration::from_secs(secs.max(0) as u64)
}

pub struct CloudCommandQueue {
    collection: Arc<CloudQueueCollection>,
    codec: Arc<dyn CommandCodec>,
    clock: Arc<dyn Clock>,
    agent_id: AgentId,
    asset_group_id: AssetGroupId,
    subject_type: SubjectType,
    command_type: PrivacyCommandType,
    queue_name: String,
    default_lease: Duration,
}

impl CloudCommandQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collection: Arc<CloudQueueCollection>,
        codec: Arc<dyn CommandCodec>,
        clock: Arc<dyn Clock>,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        subject_type: SubjectType,
        command_type: PrivacyCommandType,
        default_lease: Duration,
    ) -> Result<Self, QueueError> {
        if !CLOUD_COMMAND_TYPES.contains(&command_type) {
            return Err(QueueError::InvalidArgument(format!(
                "cloud queues only hold {CLOUD_COMMAND_TYPES:?}, not {command_type}"
            )));
        }
        Ok(Self {
            queue_name: cloud_queue_name(subject_type, command_type, &asset_group_id),
            collection,
            codec,
            clock,
            agent_id,
            asset_group_id,
            subject_type,
            command_type,
            default_lease,
        })
    }

    pub fn moniker(&self) -> &str {
        self.collection.moniker()
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn check_address(&self, command: &PrivacyCommand) -> Result<(), QueueError> {
        if command.agent_id != self.agent_id
            || command.asset_group_id != self.asset_group_id
            || command.subject_type != self.subject_type
            || command.command_type != self.command_type
        {
            return Err(QueueError::InvalidArgument(format!(
                "command {} is not addressed to queue {}",
                command.command_id, self.queue_name
            )));
        }
        Ok(())
    }

    fn to_message(&self, command: &PrivacyCommand) -> Result<String, QueueError> {
        let document = self.codec.to_document(command)?;
        Ok(self.codec.to_message(&document)?)
    }

    fn from_message(&self, message: &QueueMessage) -> Result<PrivacyCommand, QueueError> {
        let document = self.codec.from_message(&message.body)?;
        let mut command = self.codec.from_document(&document)?;
        command.next_visible_time = message.next_visible_time;
        let token = MessageToken {
            message_id: message.message_id.clone(),
            pop_receipt: message.pop_receipt.clone(),
        };
        let receipt = LeaseReceipt::for_command(
            self.moniker(),
            token.encode(),
            &command,
            QueueStorageKind::CloudQueue,
        );
        Ok(command.with_lease_receipt(receipt))
    }
}

#[async_trait]
impl CommandQueue for CloudCommandQueue {
    async fn enqueue(&self, command: PrivacyCommand) -> Result<(), QueueError> {
        self.check_address(&command)?;
        let body = self.to_message(&command)?;
        let ttl = time_to_live_secs(self.clock.now(), command.absolute_expiration_time);
        self.collection
            .insert(
                &self.queue_name,
                self.subject_type,
                body,
                Duration::from_secs(ttl as u64),
            )
            .await?;
        debug!(moniker = self.moniker(), queue = %self.queue_name, command_id = %command.command_id, "enqueued");
        Ok(())
    }

    /// Replace the leased message when the command carries a receipt from
    /// this queue, otherwise (or when that lease is gone) add a new message.
    async fn upsert(&self, command: PrivacyCommand) -> Result<(), QueueError> {
        let receipt = command
            .lease_receipt
            .clone()
            .filter(|r| self.supports_lease_receipt(r));
        let Some(receipt) = receipt else {
            return self.enqueue(command).await;
        };
        if MessageToken::decode(receipt.token()).is_err() {
            return self.enqueue(command).await;
        }

        match self
            .replace(&receipt, command.clone(), ReplaceOperations::CONTENT)
            .await
        {
            Ok(_) => Ok(()),
            Err(QueueError::VersionConflict { .. }) => {
                debug!(command_id = %command.command_id, "lease gone, re-enqueueing");
                self.enqueue(command).await
            }
            Err(err) => Err(err),
        }
    }

    async fn pop(
        &self,
        max_count: usize,
        lease_duration: Option<Duration>,
    ) -> Result<CommandQueuePopResult, QueueError> {
        let visibility = lease_duration.unwrap_or(self.default_lease);
        let messages = self
            .collection
            .pop(&self.queue_name, self.subject_type, max_count, visibility)
            .await?;

        let mut result = CommandQueuePopResult::default();
        for message in &messages {
            match self.from_message(message) {
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
        operations: ReplaceOperations,
    ) -> Result<LeaseReceipt, QueueError> {
        ensure_lease_receipt(self, receipt)?;
        let token = MessageToken::decode(receipt.token())?;
        let body = if operations.content {
            Some(self.to_message(&command)?)
        } else {
            None
        };
        // The account always wants a visibility; without a lease extension
        // it is recomputed from the command as-is.
        let visibility = visibility_timeout(self.clock.now(), command.next_visible_time);

        let pop_receipt = self
            .collection
            .replace(
                &self.queue_name,
                self.subject_type,
                receipt.command_id(),
                &token.message_id,
                &token.pop_receipt,
                body,
                visibility,
            )
            .await?;

        let token = MessageToken {
            message_id: token.message_id,
            pop_receipt,
        };
        Ok(LeaseReceipt::for_command(
            self.moniker(),
            token.encode(),
            &command,
            QueueStorageKind::CloudQueue,
        ))
    }

    async fn delete(&self, receipt: &LeaseReceipt) -> Result<(), QueueError> {
        ensure_lease_receipt(self, receipt)?;
        let token = MessageToken::decode(receipt.token())?;
        match self
            .collection
            .delete(
                &self.queue_name,
                self.subject_type,
                receipt.command_id(),
                &token.message_id,
                &token.pop_receipt,
            )
            .await
        {
            Ok(()) | Err(QueueError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn query(&self, receipt: &LeaseReceipt) -> Result<Option<PrivacyCommand>, QueueError> {
        ensure_lease_receipt(self, receipt)?;
        Err(QueueError::NotSupported(format!(
            "query on {} cloud queue {}",
            self.command_type, self.queue_name
        )))
    }

    async fn flush_agent_queue(
        &self,
        max_created_time: DateTime<Utc>,
        _token: &CancellationToken,
    ) -> Result<(), QueueError> {
        Err(QueueError::NotSupported(format!(
            "flush by date ({max_created_time}) on cloud queue {}",
            self.queue_name
        )))
    }

    async fn queue_statistics(
        &self,
        _detailed: bool,
        token: &CancellationToken,
    ) -> Result<Vec<AgentQueueStatistics>, QueueError> {
        if token.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        let Some(count) = self
            .collection
            .message_count(&self.queue_name, self.subject_type)
            .await?
        else {
            return Ok(Vec::new());
        };

        let mut view = AgentQueueStatistics::new(
            self.moniker(),
            self.subject_type,
            self.agent_id,
            self.asset_group_id,
            self.clock.now(),
        );
        view.command_type = Some(self.command_type);
        view.pending_command_count = count;
        Ok(vec![view])
    }

    fn supports_lease_receipt(&self, receipt: &LeaseReceipt) -> bool {
        receipt.storage_kind() == QueueStorageKind::CloudQueue
            && receipt.moniker() == self.moniker()
            && receipt.agent_id() == self.agent_id
            && receipt.asset_group_id() == self.asset_group_id
            && receipt.subject_type() == self.subject_type
            && receipt.command_type() == self.command_type
    }

    fn supports_flush_by_date(&self) -> bool {
        false
    }

    fn priority(&self) -> QueuePriority {
        self.collection.priority()
    }

    fn accepts_command_type(&self, command_type: PrivacyCommandType) -> bool {
        command_type == self.command_type
    }

    fn is_pop_blocked(&self) -> bool {
        self.collection.is_pop_blocked(&self.queue_name)
    }
}

impl std::fmt::Debug for CloudCommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCommandQueue")
            .field("moniker", &self.moniker())
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{CloudOperation, InMemoryCloudQueue, JsonCommandCodec};
    use crate::queue::testing::{Fixture, SUBJECT};
    use chrono::TimeZone;
    use rstest::rstest;
    use std::str::FromStr;

    struct Setup {
        fx: Fixture,
        client: Arc<InMemoryCloudQueue>,
        queue: CloudCommandQueue,
        agent: AgentId,
        group: AssetGroupId,
    }

    fn setup() -> Setup {
        let fx = Fixture::new();
        let (client, collection) = fx.cloud("acct1");
        let agent = AgentId::generate();
        let group = AssetGroupId::generate();
        let queue = CloudCommandQueue::new(
            collection,
            Arc::new(JsonCommandCodec),
            fx.clock(),
            agent,
            group,
            SUBJECT,
            PrivacyCommandType::AgeOut,
            Duration::from_secs(900),
        )
        .unwrap();
        Setup { fx, client, queue, agent, group }
    }

    impl Setup {
        fn command(&self) -> PrivacyCommand {
            self.fx.command(PrivacyCommandType::AgeOut, self.agent, self.group)
        }
    }

    #[test]
    fn queue_name_is_lower_cased_codes() {
        let group = AssetGroupId::from_str("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
        assert_eq!(
            cloud_queue_name(SubjectType::Msa, PrivacyCommandType::AgeOut, &group),
            format!("cq-{}-4-01arz3ndektsv4rrffq69g5fav", SubjectType::Msa.code())
        );
    }

    #[rstest]
    #[case::exact(90, 90)]
    #[case::past(-10, 0)]
    fn visibility_is_whole_seconds(#[case] secs: i64, #[case] expected: u64) {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = now + chrono::Duration::seconds(secs) + chrono::Duration::milliseconds(700);
        assert_eq!(visibility_timeout(now, next), Duration::from_secs(expected));
    }

    #[test]
    fn only_age_out_is_supported() {
        let fx = Fixture::new();
        let (_, collection) = fx.cloud("acct1");
        let result = CloudCommandQueue::new(
            collection,
            Arc::new(JsonCommandCodec),
            fx.clock(),
            AgentId::generate(),
            AssetGroupId::generate(),
            SUBJECT,
            PrivacyCommandType::Delete,
            Duration::from_secs(900),
        );
        assert!(matches!(result, Err(QueueError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn pop_uses_default_lease_and_cloud_receipts() {
        let s = setup();
        let command = s.command();
        s.queue.enqueue(command.clone()).await.unwrap();

        let popped = s.queue.pop(10, None).await.unwrap();
        assert_eq!(popped.commands.len(), 1);
        let leased = &popped.commands[0];
        let receipt = leased.lease_receipt.as_ref().unwrap();

        assert_eq!(leased.command_id, command.command_id);
        assert_eq!(leased.next_visible_time, s.fx.clock.now() + chrono::Duration::seconds(900));
        assert_eq!(receipt.storage_kind(), QueueStorageKind::CloudQueue);
        assert_eq!(receipt.moniker(), "acct1");
        assert!(s.queue.supports_lease_receipt(receipt));
    }

    #[tokio::test]
    async fn replace_then_delete_with_fresh_receipt() {
        let s = setup();
        s.queue.enqueue(s.command()).await.unwrap();
        let mut leased = s.queue.pop(1, None).await.unwrap().commands.remove(0);
        let old = leased.lease_receipt.take().unwrap();

        leased.body = serde_json::json!({"progress": 50});
        let new = s.queue.replace(&old, leased.clone(), ReplaceOperations::ALL).await.unwrap();
        assert_ne!(new.token(), old.token());

        assert!(matches!(s.queue.delete(&old).await, Err(QueueError::VersionConflict { .. })));
        s.queue.delete(&new).await.unwrap();
        assert_eq!(s.client.message_count(s.queue.queue_name()).await, 0);
        // Already gone counts as done.
        s.queue.delete(&new).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_falls_back_to_enqueue_when_lease_is_gone() {
        let s = setup();
        s.queue.enqueue(s.command()).await.unwrap();
        let leased = s.queue.pop(1, None).await.unwrap().commands.remove(0);
        let receipt = leased.lease_receipt.clone().unwrap();
        s.queue.delete(&receipt).await.unwrap();

        s.queue.upsert(leased).await.unwrap();
        assert_eq!(s.client.message_count(s.queue.queue_name()).await, 1);
        assert_eq!(s.client.calls(CloudOperation::Update).await, 1);
        assert_eq!(s.client.calls(CloudOperation::Add).await, 2);
    }

    #[tokio::test]
    async fn upsert_without_receipt_enqueues() {
        let s = setup();
        s.queue.upsert(s.command()).await.unwrap();
        assert_eq!(s.client.calls(CloudOperation::Update).await, 0);
        assert_eq!(s.client.message_count(s.queue.queue_name()).await, 1);
    }

    #[tokio::test]
    async fn query_and_flush_are_not_supported() {
        let s = setup();
        s.queue.enqueue(s.command()).await.unwrap();
        let receipt = s.queue.pop(1, None).await.unwrap().commands.remove(0).lease_receipt.unwrap();

        assert!(!s.queue.supports_flush_by_date());
        assert!(matches!(s.queue.query(&receipt).await, Err(QueueError::NotSupported(_))));
        assert!(matches!(
            s.queue.flush_agent_queue(s.fx.clock.now(), &CancellationToken::new()).await,
            Err(QueueError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn document_receipt_is_not_accepted() {
        let s = setup();
        let command = s.command();
        let receipt = LeaseReceipt::for_command("acct1", "{}", &command, QueueStorageKind::DocumentDb);
        assert!(!s.queue.supports_lease_receipt(&receipt));
        assert!(matches!(s.queue.delete(&receipt).await, Err(QueueError::InvalidLeaseReceipt(_))));
    }

    #[tokio::test]
    async fn statistics_only_for_existing_queue() {
        let s = setup();
        let token = CancellationToken::new();
        assert!(s.queue.queue_statistics(false, &token).await.unwrap().is_empty());

        s.queue.enqueue(s.command()).await.unwrap();
        let stats = s.queue.queue_statistics(false, &token).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].pending_command_count, 1);
        assert_eq!(stats[0].command_type, Some(PrivacyCommandType::AgeOut));
    }
}
