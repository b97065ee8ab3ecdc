//! DocumentStoreClient port - 分割コレクションを持つドキュメント DB
//!
//! One client per database. A database holds one collection per subject type
//! and every collection is partitioned by `partition_key(agent, asset_group)`.
//! The multi-document operations (`pop_leased`, `queue_stats`, `flush_batch`)
//! run server side inside a single partition, so each call is atomic with
//! respect to the documents it touches.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::codec::CommandDocument;
use super::storage_error::StorageError;
use crate::domain::PrivacyCommandType;
use crate::observability::PartitionKeyRangeStatistics;

/// A stored document and its current version token.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub document: CommandDocument,
    pub etag: String,
}

/// Lease the next visible documents of one partition.
#[derive(Debug, Clone)]
pub struct PopRequest {
    pub partition_key: String,
    pub max_count: usize,
    pub now: DateTime<Utc>,

    /// New `next_visible_time` for every leased document.
    pub lease_until: DateTime<Utc>,

    /// Documents created before this are ignored.
    pub min_created_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushBatchResult {
    pub items_deleted: u64,

    /// Documents that matched the filter before deletion, this batch included.
    /// Zero means the partition is drained.
    pub items_matched: u64,
}

/// Counters for one partition.
///
/// The timestamps and per-type breakdown are only filled in detailed mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionQueueStats {
    pub pending: u64,
    pub unleased: u64,
    pub oldest_pending: Option<DateTime<Utc>>,
    pub earliest_lease_available: Option<DateTime<Utc>>,
    pub per_command_type: BTreeMap<PrivacyCommandType, u64>,
}

#[async_trait]
pub trait DocumentStoreClient: Send + Sync {
    /// Create the collection if it does not exist yet.
    async fn create_collection_if_absent(
        &self,
        collection_id: &str,
        default_ttl_enabled: bool,
    ) -> Result<(), StorageError>;

    /// Install or refresh the server-side procedures a collection needs.
    async fn install_procedures(&self, collection_id: &str) -> Result<(), StorageError>;

    /// Insert a new document. Fails with `Conflict` when the id exists.
    async fn create(
        &self,
        collection_id: &str,
        document: CommandDocument,
    ) -> Result<String, StorageError>;

    async fn upsert(
        &self,
        collection_id: &str,
        document: CommandDocument,
    ) -> Result<String, StorageError>;

    async fn read(
        &self,
        collection_id: &str,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<VersionedDocument>, StorageError>;

    /// Replace a document if its version still equals `if_match`.
    /// Returns the new version.
    async fn replace(
        &self,
        collection_id: &str,
        document: CommandDocument,
        if_match: &str,
    ) -> Result<String, StorageError>;

    async fn delete(
        &self,
        collection_id: &str,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Atomically lease up to `max_count` visible documents.
    async fn pop_leased(
        &self,
        collection_id: &str,
        request: PopRequest,
    ) -> Result<Vec<VersionedDocument>, StorageError>;

    async fn queue_stats(
        &self,
        collection_id: &str,
        partition_key: &str,
        detailed: bool,
        now: DateTime<Utc>,
    ) -> Result<PartitionQueueStats, StorageError>;

    /// Delete up to `max_to_delete` documents created at or before
    /// `max_created_time`.
    async fn flush_batch(
        &self,
        collection_id: &str,
        partition_key: &str,
        max_created_time: DateTime<Utc>,
        max_to_delete: usize,
    ) -> Result<FlushBatchResult, StorageError>;

    /// Sampled size statistics for every partition key range.
    async fn partition_key_ranges(
        &self,
        collection_id: &str,
    ) -> Result<Vec<PartitionKeyRangeStatistics>, StorageError>;
}
