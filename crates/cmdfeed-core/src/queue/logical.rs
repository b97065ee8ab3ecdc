//! LogicalCommandQueue: every physical shard serving one
//! (agent, asset group, subject type, storage kind) address, behind the
//! same `CommandQueue` contract.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::weighted::choose_weighted;
use super::{CommandQueue, CommandQueuePopResult, ReplaceOperations};
use crate::domain::{
    AgentId, AssetGroupId, LeaseReceipt, PrivacyCommand, PrivacyCommandType, QueuePriority,
    QueueStorageKind, SubjectType,
};
use crate::error::QueueError;
use crate::observability::AgentQueueStatistics;

/// One shard of a logical queue.
#[derive(Clone)]
pub struct LogicalQueueMember {
    pub queue: Arc<dyn CommandQueue>,
    pub weight: u32,
    pub moniker: String,
}

impl LogicalQueueMember {
    pub fn new(queue: Arc<dyn CommandQueue>, weight: u32, moniker: impl Into<String>) -> Self {
        Self {
            queue,
            weight,
            moniker: moniker.into(),
        }
    }
}

impl std::fmt::Debug for LogicalQueueMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalQueueMember")
            .field("moniker", &self.moniker)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

pub struct LogicalCommandQueue {
    agent_id: AgentId,
    asset_group_id: AssetGroupId,
    subject_type: SubjectType,
    storage_kind: QueueStorageKind,
    members: Vec<LogicalQueueMember>,
    rng: Mutex<StdRng>,
}

impl LogicalCommandQueue {
    pub fn new(
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        subject_type: SubjectType,
        storage_kind: QueueStorageKind,
        members: Vec<LogicalQueueMember>,
    ) -> Self {
        Self::with_rng(
            agent_id,
            asset_group_id,
            subject_type,
            storage_kind,
            members,
            StdRng::from_entropy(),
        )
    }

    /// Same as `new` with a caller-provided random source.
    pub fn with_rng(
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        subject_type: SubjectType,
        storage_kind: QueueStorageKind,
        members: Vec<LogicalQueueMember>,
        rng: StdRng,
    ) -> Self {
        Self {
            agent_id,
            asset_group_id,
            subject_type,
            storage_kind,
            members,
            rng: Mutex::new(rng),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn asset_group_id(&self) -> AssetGroupId {
        self.asset_group_id
    }

    pub fn subject_type(&self) -> SubjectType {
        self.subject_type
    }

    pub fn storage_kind(&self) -> QueueStorageKind {
        self.storage_kind
    }

    pub fn members(&self) -> &[LogicalQueueMember] {
        &self.members
    }

    /// Place `command` on the shard named `moniker`, bypassing the weights.
    pub async fn enqueue_to(&self, moniker: &str, command: PrivacyCommand) -> Result<(), QueueError> {
        let member = self
            .members
            .iter()
            .find(|m| m.moniker == moniker && m.queue.accepts_command_type(command.command_type))
            .ok_or_else(|| {
                QueueError::NotFound(format!(
                    "no {} member '{moniker}' accepts {}",
                    self.storage_kind, command.command_type
                ))
            })?;
        member.queue.enqueue(command).await
    }

    fn choose_writer(&self, command_type: PrivacyCommandType) -> Result<&LogicalQueueMember, QueueError> {
        let candidates: Vec<&LogicalQueueMember> = self
            .members
            .iter()
            .filter(|m| m.queue.accepts_command_type(command_type))
            .collect();
        let weights: Vec<u32> = candidates.iter().map(|m| m.weight).collect();

        let index = {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            choose_weighted(&weights, &mut *rng)
        };
        index.map(|i| candidates[i]).ok_or_else(|| {
            QueueError::NotSupported(format!(
                "no {} member accepts {command_type}",
                self.storage_kind
            ))
        })
    }

    fn probe_order(&self) -> Vec<&LogicalQueueMember> {
        let mut order: Vec<&LogicalQueueMember> = self.members.iter().collect();
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        order.shuffle(&mut *rng);
        order
    }

    fn owner_of(&self, receipt: &LeaseReceipt) -> Result<&LogicalQueueMember, QueueError> {
        self.members
            .iter()
            .find(|m| m.moniker == receipt.moniker() && m.queue.supports_lease_receipt(receipt))
            .ok_or_else(|| {
                QueueError::InvalidLeaseReceipt(format!(
                    "no member of {}/{}/{} issued the receipt for command {} from {}",
                    self.agent_id,
                    self.asset_group_id,
                    self.subject_type,
                    receipt.command_id(),
                    receipt.moniker()
                ))
            })
    }
}

#[async_trait]
impl CommandQueue for LogicalCommandQueue {
    async fn enqueue(&self, command: PrivacyCommand) -> Result<(), QueueError> {
        let member = self.choose_writer(command.command_type)?;
        debug!(moniker = %member.moniker, command_id = %command.command_id, "placing command");
        member.queue.enqueue(command).await
    }

    async fn upsert(&self, command: PrivacyCommand) -> Result<(), QueueError> {
        let member = self.choose_writer(command.command_type)?;
        member.queue.upsert(command).await
    }

    async fn pop(
        &self,
        max_count: usize,
        lease_duration: Option<Duration>,
    ) -> Result<CommandQueuePopResult, QueueError> {
        let mut errors = Vec::new();
        for member in self.probe_order() {
            if member.queue.is_pop_blocked() {
                debug!(moniker = %member.moniker, "skipping pop-blocked member");
                continue;
            }
            match member.queue.pop(max_count, lease_duration).await {
                Ok(mut result) => {
                    errors.append(&mut result.errors);
                    if !result.commands.is_empty() {
                        return Ok(CommandQueuePopResult {
                            commands: result.commands,
                            errors,
                        });
                    }
                }
                Err(err) => {
                    if err.is_expected() {
                        debug!(moniker = %member.moniker, error = %err, "member pop failed");
                    } else {
                        warn!(moniker = %member.moniker, error = %err, "member pop failed");
                    }
                    errors.push(err);
                }
            }
        }
        Ok(CommandQueuePopResult {
            commands: Vec::new(),
            errors,
        })
    }

    async fn replace(
        &self,
        receipt: &LeaseReceipt,
        command: PrivacyCommand,
        operations: ReplaceOperations,
    ) -> Result<LeaseReceipt, QueueError> {
        self.owner_of(receipt)?
            .queue
            .replace(receipt, command, operations)
            .await
    }

    async fn delete(&self, receipt: &LeaseReceipt) -> Result<(), QueueError> {
        self.owner_of(receipt)?.queue.delete(receipt).await
    }

    async fn query(&self, receipt: &LeaseReceipt) -> Result<Option<PrivacyCommand>, QueueError> {
        self.owner_of(receipt)?.queue.query(receipt).await
    }

    /// Flush every member that can flush by date. Keeps going past a failed
    /// member and reports the first failure.
    async fn flush_agent_queue(
        &self,
        max_created_time: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<(), QueueError> {
        let mut first_error = None;
        for member in self.members.iter().filter(|m| m.queue.supports_flush_by_date()) {
            if token.is_cancelled() {
                break;
            }
            if let Err(err) = member.queue.flush_agent_queue(max_created_time, token).await {
                warn!(moniker = %member.moniker, error = %err, "member flush failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Fan out to every member at once. Disabled members are left out.
    async fn queue_statistics(
        &self,
        detailed: bool,
        token: &CancellationToken,
    ) -> Result<Vec<AgentQueueStatistics>, QueueError> {
        let results = join_all(
            self.members
                .iter()
                .map(|m| m.queue.queue_statistics(detailed, token)),
        )
        .await;

        let mut merged = Vec::new();
        for (member, result) in self.members.iter().zip(results) {
            match result {
                Ok(stats) => merged.extend(stats),
                Err(QueueError::QueueDisabled { .. }) => {
                    debug!(moniker = %member.moniker, "skipping disabled member statistics");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(merged)
    }

    fn supports_lease_receipt(&self, receipt: &LeaseReceipt) -> bool {
        self.members
            .iter()
            .any(|m| m.moniker == receipt.moniker() && m.queue.supports_lease_receipt(receipt))
    }

    fn supports_flush_by_date(&self) -> bool {
        self.members.iter().any(|m| m.queue.supports_flush_by_date())
    }

    fn priority(&self) -> QueuePriority {
        self.storage_kind.priority()
    }

    fn accepts_command_type(&self, command_type: PrivacyCommandType) -> bool {
        self.members
            .iter()
            .any(|m| m.queue.accepts_command_type(command_type))
    }

    fn is_pop_blocked(&self) -> bool {
        self.members.iter().all(|m| m.queue.is_pop_blocked())
    }
}

impl std::fmt::Debug for LogicalCommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalCommandQueue")
            .field("agent_id", &self.agent_id)
            .field("asset_group_id", &self.asset_group_id)
            .field("subject_type", &self.subject_type)
            .field("storage_kind", &self.storage_kind)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryDocumentStore, JsonCommandCodec, StoreOperation};
    use crate::ports::Clock;
    use crate::queue::DocumentCommandQueue;
    use crate::queue::testing::{Fixture, SUBJECT};

    const LEASE: Duration = Duration::from_secs(300);

    struct Shard {
        store: Arc<InMemoryDocumentStore>,
        moniker: &'static str,
    }

    impl Shard {
        async fn count(&self) -> usize {
            self.store.document_count(SUBJECT.collection_id()).await
        }
    }

    struct Setup {
        fx: Fixture,
        agent: AgentId,
        group: AssetGroupId,
        shards: Vec<Shard>,
        queue: LogicalCommandQueue,
    }

    /// One logical document queue over shards with their own stores.
    async fn setup(weights: &[(&'static str, u32)], seed: u64) -> Setup {
        let fx = Fixture::new();
        let agent = AgentId::generate();
        let group = AssetGroupId::generate();
        let mut shards = Vec::new();
        let mut members = Vec::new();
        for &(moniker, weight) in weights {
            let store = Arc::new(InMemoryDocumentStore::new(fx.clock()));
            let collection = fx.collection_with_client(moniker, weight, store.clone());
            collection.initialize().await.unwrap();
            let queue = DocumentCommandQueue::new(
                collection,
                Arc::new(JsonCommandCodec),
                fx.clock(),
                agent,
                group,
                LEASE,
            );
            members.push(LogicalQueueMember::new(Arc::new(queue), weight, moniker));
            shards.push(Shard { store, moniker });
        }
        let queue = LogicalCommandQueue::with_rng(
            agent,
            group,
            SUBJECT,
            QueueStorageKind::DocumentDb,
            members,
            StdRng::seed_from_u64(seed),
        );
        Setup { fx, agent, group, shards, queue }
    }

    impl Setup {
        fn command(&self) -> PrivacyCommand {
            self.fx.command(PrivacyCommandType::Delete, self.agent, self.group)
        }
    }

    #[tokio::test]
    async fn writes_follow_member_weights() {
        let s = setup(&[("db1", 3), ("db2", 1)], 42).await;
        let total = 4000;
        for _ in 0..total {
            s.queue.enqueue(s.command()).await.unwrap();
        }

        let heavy = s.shards[0].count().await as f64 / total as f64;
        let light = s.shards[1].count().await as f64 / total as f64;
        assert!((heavy - 0.75).abs() < 0.03, "heavy share {heavy}");
        assert!((light - 0.25).abs() < 0.03, "light share {light}");
    }

    #[tokio::test]
    async fn zero_weight_member_receives_no_writes() {
        let s = setup(&[("db1", 1), ("db2", 0)], 1).await;
        for _ in 0..50 {
            s.queue.enqueue(s.command()).await.unwrap();
        }
        assert_eq!(s.shards[1].count().await, 0);
    }

    #[tokio::test]
    async fn enqueue_to_names_the_shard() {
        let s = setup(&[("db1", 1), ("db2", 1)], 3).await;
        s.queue.enqueue_to("db2", s.command()).await.unwrap();
        assert_eq!(s.shards[0].count().await, 0);
        assert_eq!(s.shards[1].count().await, 1);

        assert!(matches!(
            s.queue.enqueue_to("db9", s.command()).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn receipts_route_back_to_the_issuing_shard() {
        let s = setup(&[("db1", 1), ("db2", 1)], 5).await;
        s.queue.enqueue_to("db2", s.command()).await.unwrap();

        let popped = s.queue.pop(10, None).await.unwrap();
        assert_eq!(popped.commands.len(), 1);
        let receipt = popped.commands[0].lease_receipt.clone().unwrap();
        assert_eq!(receipt.moniker(), s.shards[1].moniker);
        assert!(s.queue.supports_lease_receipt(&receipt));

        let queried = s.queue.query(&receipt).await.unwrap().unwrap();
        assert_eq!(queried.command_id, receipt.command_id());
        s.queue.delete(&receipt).await.unwrap();
        assert_eq!(s.shards[1].count().await, 0);
    }

    #[tokio::test]
    async fn foreign_receipt_matches_no_member() {
        let s = setup(&[("db1", 1)], 5).await;
        let receipt = LeaseReceipt::for_command(
            "elsewhere",
            "\"etag\"",
            &s.command(),
            QueueStorageKind::DocumentDb,
        );
        assert!(!s.queue.supports_lease_receipt(&receipt));
        assert!(matches!(
            s.queue.delete(&receipt).await,
            Err(QueueError::InvalidLeaseReceipt(_))
        ));
    }

    #[tokio::test]
    async fn pop_skips_blocked_members() {
        let s = setup(&[("db1", 1), ("db2", 1)], 9).await;

        // Both shards empty: every member gets probed once and blocks.
        assert!(s.queue.pop(5, None).await.unwrap().is_empty());
        assert!(s.queue.is_pop_blocked());

        s.queue.enqueue_to("db1", s.command()).await.unwrap();
        assert!(s.queue.pop(5, None).await.unwrap().is_empty());
        for shard in &s.shards {
            assert_eq!(shard.store.calls(StoreOperation::Pop).await, 1);
        }

        s.fx.clock.advance(Duration::from_secs(61));
        let popped = s.queue.pop(5, None).await.unwrap();
        assert_eq!(popped.commands.len(), 1);
    }

    #[tokio::test]
    async fn member_failures_do_not_stop_probing() {
        let s = setup(&[("db1", 1), ("db2", 1)], 11).await;
        s.queue.enqueue_to("db2", s.command()).await.unwrap();
        s.fx.flags.disable("db1", SUBJECT);

        let popped = s.queue.pop(5, None).await.unwrap();
        assert_eq!(popped.commands.len(), 1);
        // db1 is only probed when the shuffle puts it first.
        assert!(popped.errors.len() <= 1);
        assert!(popped
            .errors
            .iter()
            .all(|e| matches!(e, QueueError::QueueDisabled { .. })));
    }

    #[tokio::test]
    async fn flush_and_statistics_cover_every_member() {
        let s = setup(&[("db1", 1), ("db2", 1)], 13).await;
        s.queue.enqueue_to("db1", s.command()).await.unwrap();
        s.queue.enqueue_to("db2", s.command()).await.unwrap();
        let token = CancellationToken::new();

        let stats = s.queue.queue_statistics(false, &token).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|v| v.pending_command_count == 1));

        s.queue
            .flush_agent_queue(s.fx.clock.now(), &token)
            .await
            .unwrap();
        for shard in &s.shards {
            assert_eq!(shard.count().await, 0);
        }

        let stats = s.queue.queue_statistics(false, &token).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|v| v.pending_command_count == 0));
    }

    #[tokio::test]
    async fn statistics_leave_out_disabled_members() {
        let s = setup(&[("db1", 1), ("db2", 1)], 17).await;
        s.fx.flags.disable("db2", SUBJECT);

        let stats = s.queue.queue_statistics(false, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].moniker, "db1");
    }
}
