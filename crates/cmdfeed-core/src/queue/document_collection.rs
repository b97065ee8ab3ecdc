//! DocumentQueueCollection: one subject type's collection in one document
//! database.
//!
//! Every call first checks the shard's feature flag, then talks to the
//! backend through `DocumentStoreClient`. Backend errors are translated to
//! `QueueError` here and never travel further up.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pop_blocker::PopBlocker;
use super::retry::{RetryPolicy, retry_transient};
use super::{cancellable_sleep, storage_failure};
use crate::config::{FlushSettings, QueueConfig};
use crate::domain::{CommandId, QueuePriority, SubjectType};
use crate::error::QueueError;
use crate::observability::{PartitionKeyRangeStatistics, PartitionKeyStat, approximate_documents_count};
use crate::ports::clock::{checked_after, checked_before};
use crate::ports::{
    Clock, CommandDocument, DocumentStoreClient, PartitionQueueStats, PopRequest,
    QueueFeatureFlags, StorageError, VersionedDocument,
};

/// Tuning shared by the physical collections.
#[derive(Debug, Clone)]
pub struct CollectionOptions {
    pub retry: RetryPolicy,
    pub flush: FlushSettings,
    pub pop_blocker_ttl: Duration,
    pub max_command_lifespan: Duration,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl CollectionOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            retry: config.retry.policy(),
            flush: config.flush.clone(),
            pop_blocker_ttl: config.pop_blocker_ttl(),
            max_command_lifespan: config.max_command_lifespan(),
        }
    }
}

/// How a flush ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    pub batches: u32,
    pub deleted: u64,
    /// Stopped by the caller's token before the partition was drained.
    pub cancelled: bool,
}

pub struct DocumentQueueCollection {
    moniker: String,
    weight: u32,
    subject_type: SubjectType,
    client: Arc<dyn DocumentStoreClient>,
    flags: Arc<dyn QueueFeatureFlags>,
    clock: Arc<dyn Clock>,
    pop_blocker: PopBlocker,
    options: CollectionOptions,
    partition_ranges: RwLock<Vec<PartitionKeyRangeStatistics>>,
}

impl DocumentQueueCollection {
    pub fn new(
        moniker: impl Into<String>,
        weight: u32,
        subject_type: SubjectType,
        client: Arc<dyn DocumentStoreClient>,
        flags: Arc<dyn QueueFeatureFlags>,
        clock: Arc<dyn Clock>,
        options: CollectionOptions,
    ) -> Self {
        let pop_blocker = PopBlocker::new(options.pop_blocker_ttl, clock.clone());
        Self {
            moniker: moniker.into(),
            weight,
            subject_type,
            client,
            flags,
            clock,
            pop_blocker,
            options,
            partition_ranges: RwLock::new(Vec::new()),
        }
    }

    pub fn moniker(&self) -> &str {
        &self.moniker
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn subject_type(&self) -> SubjectType {
        self.subject_type
    }

    pub fn collection_id(&self) -> &'static str {
        self.subject_type.collection_id()
    }

    pub fn priority(&self) -> QueuePriority {
        QueuePriority::High
    }

    pub fn is_pop_blocked(&self, partition_key: &str) -> bool {
        self.pop_blocker.is_blocked(partition_key)
    }

    fn ensure_not_disabled(&self) -> Result<(), QueueError> {
        if self.flags.is_disabled(&self.moniker, self.subject_type) {
            debug!(moniker = %self.moniker, subject_type = %self.subject_type, "shard disabled");
            return Err(QueueError::QueueDisabled {
                moniker: self.moniker.clone(),
                subject_type: self.subject_type,
            });
        }
        Ok(())
    }

    fn failure(&self, what: impl Into<String>, err: StorageError) -> QueueError {
        storage_failure(&self.moniker, what, err)
    }

    /// Create the collection and install its procedures. Idempotent.
    pub async fn initialize(&self) -> Result<(), QueueError> {
        let collection_id = self.collection_id();
        retry_transient(&self.options.retry, "create_collection", || {
            self.client.create_collection_if_absent(collection_id, true)
        })
        .await
        .map_err(|e| self.failure(collection_id, e))?;

        retry_transient(&self.options.retry, "install_procedures", || {
            self.client.install_procedures(collection_id)
        })
        .await
        .map_err(|e| self.failure(collection_id, e))?;

        info!(moniker = %self.moniker, collection_id, "collection initialized");
        Ok(())
    }

    pub async fn insert(&self, document: CommandDocument) -> Result<String, QueueError> {
        self.ensure_not_disabled()?;
        let id = document.id;
        self.client
            .create(self.collection_id(), document)
            .await
            .map_err(|e| self.failure(format!("command {id}"), e))
    }

    pub async fn upsert(
        &self,
        partition_key: &str,
        mut document: CommandDocument,
    ) -> Result<String, QueueError> {
        self.ensure_not_disabled()?;
        document.pk = partition_key.to_string();
        let id = document.id;
        self.client
            .upsert(self.collection_id(), document)
            .await
            .map_err(|e| self.failure(format!("command {id}"), e))
    }

    /// Lease up to `max_count` visible commands of one partition.
    pub async fn pop(
        &self,
        lease_duration: Duration,
        partition_key: &str,
        max_count: usize,
    ) -> Result<Vec<VersionedDocument>, QueueError> {
        self.ensure_not_disabled()?;
        if max_count == 0 || self.pop_blocker.is_blocked(partition_key) {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let lease_until = checked_after(now, lease_duration).ok_or_else(|| {
            QueueError::InvalidArgument(format!("lease duration {lease_duration:?} is out of range"))
        })?;
        let request = PopRequest {
            partition_key: partition_key.to_string(),
            max_count,
            now,
            lease_until,
            min_created_time: checked_before(now, self.options.max_command_lifespan)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };
        let leased = self
            .client
            .pop_leased(self.collection_id(), request)
            .await
            .map_err(|e| self.failure(format!("partition {partition_key}"), e))?;

        if leased.is_empty() {
            debug!(moniker = %self.moniker, partition_key, "empty pop, blocking partition");
            self.pop_blocker.block(partition_key);
        }
        Ok(leased)
    }

    /// Replace a document if its stored version is still `expected_version`.
    pub async fn replace(
        &self,
        document: CommandDocument,
        expected_version: &str,
    ) -> Result<String, QueueError> {
        self.ensure_not_disabled()?;
        if expected_version.is_empty() {
            return Err(QueueError::InvalidArgument(
                "replace requires a version precondition".to_string(),
            ));
        }
        let command_id = document.id;
        match self
            .client
            .replace(self.collection_id(), document, expected_version)
            .await
        {
            Ok(etag) => Ok(etag),
            Err(StorageError::PreconditionFailed) => {
                debug!(moniker = %self.moniker, %command_id, "replace lost version race");
                Err(QueueError::VersionConflict { command_id })
            }
            Err(e) => Err(self.failure(format!("command {command_id}"), e)),
        }
    }

    pub async fn delete(&self, partition_key: &str, command_id: CommandId) -> Result<(), QueueError> {
        self.ensure_not_disabled()?;
        self.client
            .delete(self.collection_id(), partition_key, &command_id.to_string(), None)
            .await
            .map_err(|e| self.failure(format!("command {command_id}"), e))
    }

    pub async fn query(
        &self,
        partition_key: &str,
        command_id: CommandId,
    ) -> Result<Option<VersionedDocument>, QueueError> {
        self.ensure_not_disabled()?;
        self.client
            .read(self.collection_id(), partition_key, &command_id.to_string())
            .await
            .map_err(|e| self.failure(format!("command {command_id}"), e))
    }

    /// Delete every command in the partition created at or before
    /// `max_created_time`, one server-side batch at a time.
    ///
    /// Cancellation is checked before each batch and during every pause; an
    /// interrupted flush leaves the partition consistent and can be rerun.
    pub async fn flush(
        &self,
        partition_key: &str,
        max_created_time: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<FlushOutcome, QueueError> {
        self.ensure_not_disabled()?;

        let flush = &self.options.flush;
        let retry = &self.options.retry;
        let mut outcome = FlushOutcome::default();
        let mut throttled = 0u32;

        loop {
            if token.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let batch = self
                .client
                .flush_batch(
                    self.collection_id(),
                    partition_key,
                    max_created_time,
                    flush.batch_size,
                )
                .await;

            match batch {
                Ok(result) => {
                    throttled = 0;
                    outcome.batches += 1;
                    outcome.deleted += result.items_deleted;
                    if result.items_matched == 0 {
                        break;
                    }
                }
                Err(StorageError::NotFound) => {
                    // Commands completed mid-flush; only the token ends the pause loop.
                    debug!(moniker = %self.moniker, partition_key, "flush batch hit a completed command");
                    if cancellable_sleep(token, flush.not_found_pause()).await {
                        outcome.cancelled = true;
                        break;
                    }
                    continue;
                }
                Err(err @ StorageError::Throttled { .. }) => {
                    throttled += 1;
                    if !retry.has_attempts_left(throttled) {
                        warn!(moniker = %self.moniker, partition_key, attempts = throttled, "flush throttled, giving up");
                        return Err(self.failure(format!("partition {partition_key}"), err));
                    }
                    let backoff = retry.jittered_step(retry.next_delay(throttled));
                    let wait = err.retry_after().map_or(backoff, |hint| hint.max(backoff));
                    debug!(moniker = %self.moniker, partition_key, wait_ms = wait.as_millis() as u64, "flush throttled");
                    if cancellable_sleep(token, wait).await {
                        outcome.cancelled = true;
                        break;
                    }
                    continue;
                }
                Err(err) => return Err(self.failure(format!("partition {partition_key}"), err)),
            }

            if cancellable_sleep(token, flush.pause()).await {
                outcome.cancelled = true;
                break;
            }
        }

        info!(
            moniker = %self.moniker,
            partition_key,
            batches = outcome.batches,
            deleted = outcome.deleted,
            cancelled = outcome.cancelled,
            "flush finished"
        );
        Ok(outcome)
    }

    pub async fn statistics(
        &self,
        partition_key: &str,
        detailed: bool,
        token: &CancellationToken,
    ) -> Result<PartitionQueueStats, QueueError> {
        if token.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        self.ensure_not_disabled()?;
        let now = self.clock.now();
        tokio::select! {
            _ = token.cancelled() => Err(QueueError::Cancelled),
            stats = self.client.queue_stats(self.collection_id(), partition_key, detailed, now) => {
                stats.map_err(|e| self.failure(format!("partition {partition_key}"), e))
            }
        }
    }

    /// Re-read sampled partition key range sizes from the backend.
    pub async fn refresh_partition_key_range_statistics(&self) -> Result<(), QueueError> {
        let ranges = self
            .client
            .partition_key_ranges(self.collection_id())
            .await
            .map_err(|e| self.failure(self.collection_id(), e))?;
        debug!(moniker = %self.moniker, collection_id = self.collection_id(), ranges = ranges.len(), "partition key range statistics updated");
        let mut current = self.partition_ranges.write().unwrap_or_else(|p| p.into_inner());
        *current = ranges;
        Ok(())
    }

    pub fn partition_key_range_statistics(&self) -> Vec<PartitionKeyRangeStatistics> {
        self.partition_ranges
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Sampled size of one partition key, if the last refresh saw it.
    pub fn partition_key_stat(&self, partition_key: &str) -> Option<PartitionKeyStat> {
        let ranges = self.partition_ranges.read().unwrap_or_else(|p| p.into_inner());
        ranges
            .iter()
            .flat_map(|r| r.partition_key_stats.iter())
            .find(|s| s.partition_key == partition_key)
            .cloned()
    }

    /// Worst-case queue depth of a partition too small to be sampled.
    pub fn approximate_documents_count(&self) -> u64 {
        let ranges = self.partition_ranges.read().unwrap_or_else(|p| p.into_inner());
        approximate_documents_count(&ranges)
    }
}

impl std::fmt::Debug for DocumentQueueCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentQueueCollection")
            .field("moniker", &self.moniker)
            .field("subject_type", &self.subject_type)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}
