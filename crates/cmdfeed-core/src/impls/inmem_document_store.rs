//! InMemoryDocumentStore - 開発・テスト用のドキュメント DB
//!
//! Implements the document store contract with real etag and lease semantics
//! so the queue layer can be exercised without a database:
//! - every write mints a fresh etag; `replace` / `delete` honour `if_match`
//! - `pop_leased` is atomic under the state lock
//! - documents with a `ttl` disappear once it elapses on the injected clock
//!
//! Each operation is counted, and failures can be queued per operation with
//! `fail_next`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::observability::{PartitionKeyRangeStatistics, PartitionKeyStat};
use crate::ports::{
    Clock, CommandDocument, DocumentStoreClient, FlushBatchResult, PartitionQueueStats,
    PopRequest, StorageError, VersionedDocument,
};

/// Backend calls, for counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    CreateCollection,
    InstallProcedures,
    Create,
    Upsert,
    Read,
    Replace,
    Delete,
    Pop,
    Stats,
    Flush,
    PartitionRanges,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    document: CommandDocument,
    etag: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredDocument {
    fn is_alive(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn versioned(&self) -> VersionedDocument {
        VersionedDocument {
            document: self.document.clone(),
            etag: self.etag.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Collection {
    /// (partition key, id) -> document
    documents: HashMap<(String, String), StoredDocument>,
    procedures_installed: bool,
}

impl Collection {
    fn partition<'a>(
        &'a self,
        partition_key: &'a str,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = (&'a (String, String), &'a StoredDocument)> + 'a {
        self.documents
            .iter()
            .filter(move |((pk, _), doc)| pk == partition_key && doc.is_alive(now))
    }
}

#[derive(Debug, Default)]
struct State {
    collections: HashMap<String, Collection>,
    next_etag: u64,
    calls: HashMap<StoreOperation, u64>,
    faults: HashMap<StoreOperation, VecDeque<StorageError>>,
}

impl State {
    fn enter(&mut self, op: StoreOperation) -> Result<(), StorageError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn mint_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("\"{:08x}\"", self.next_etag)
    }

    fn collection_mut(&mut self, collection_id: &str) -> Result<&mut Collection, StorageError> {
        self.collections
            .get_mut(collection_id)
            .ok_or(StorageError::NotFound)
    }

    fn collection(&self, collection_id: &str) -> Result<&Collection, StorageError> {
        self.collections.get(collection_id).ok_or(StorageError::NotFound)
    }
}

pub struct InMemoryDocumentStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl InMemoryDocumentStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    /// Number of times `op` has been called, failed calls included.
    pub async fn calls(&self, op: StoreOperation) -> u64 {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn total_calls(&self) -> u64 {
        self.state.lock().await.calls.values().sum()
    }

    /// Make the next call of `op` fail with `error`. Calls queue up.
    pub async fn fail_next(&self, op: StoreOperation, error: StorageError) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Live documents in a collection.
    pub async fn document_count(&self, collection_id: &str) -> usize {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .collections
            .get(collection_id)
            .map(|c| c.documents.values().filter(|d| d.is_alive(now)).count())
            .unwrap_or(0)
    }

    pub async fn has_collection(&self, collection_id: &str) -> bool {
        self.state.lock().await.collections.contains_key(collection_id)
    }

    fn expiry(&self, document: &CommandDocument) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        document
            .ttl
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
    }
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore").finish_non_exhaustive()
    }
}

fn document_key(document: &CommandDocument) -> (String, String) {
    (document.pk.clone(), document.id.to_string())
}

#[async_trait]
impl DocumentStoreClient for InMemoryDocumentStore {
    async fn create_collection_if_absent(
        &self,
        collection_id: &str,
        _default_ttl_enabled: bool,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::CreateCollection)?;
        state.collections.entry(collection_id.to_string()).or_default();
        Ok(())
    }

    async fn install_procedures(&self, collection_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::InstallProcedures)?;
        state.collection_mut(collection_id)?.procedures_installed = true;
        Ok(())
    }

    async fn create(
        &self,
        collection_id: &str,
        document: CommandDocument,
    ) -> Result<String, StorageError> {
        let now = self.clock.now();
        let expires_at = self.expiry(&document);
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::Create)?;
        let etag = state.mint_etag();
        let collection = state.collection_mut(collection_id)?;
        let key = document_key(&document);
        if collection.documents.get(&key).is_some_and(|d| d.is_alive(now)) {
            return Err(StorageError::Conflict);
        }
        collection.documents.insert(
            key,
            StoredDocument {
                document,
                etag: etag.clone(),
                expires_at,
            },
        );
        Ok(etag)
    }

    async fn upsert(
        &self,
        collection_id: &str,
        document: CommandDocument,
    ) -> Result<String, StorageError> {
        let expires_at = self.expiry(&document);
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::Upsert)?;
        let etag = state.mint_etag();
        let collection = state.collection_mut(collection_id)?;
        collection.documents.insert(
            document_key(&document),
            StoredDocument {
                document,
                etag: etag.clone(),
                expires_at,
            },
        );
        Ok(etag)
    }

    async fn read(
        &self,
        collection_id: &str,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<VersionedDocument>, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::Read)?;
        let collection = state.collection(collection_id)?;
        Ok(collection
            .documents
            .get(&(partition_key.to_string(), id.to_string()))
            .filter(|d| d.is_alive(now))
            .map(StoredDocument::versioned))
    }

    async fn replace(
        &self,
        collection_id: &str,
        document: CommandDocument,
        if_match: &str,
    ) -> Result<String, StorageError> {
        let now = self.clock.now();
        let expires_at = self.expiry(&document);
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::Replace)?;
        let etag = state.mint_etag();
        let collection = state.collection_mut(collection_id)?;
        let stored = collection
            .documents
            .get_mut(&document_key(&document))
            .filter(|d| d.is_alive(now))
            .ok_or(StorageError::NotFound)?;
        if stored.etag != if_match {
            return Err(StorageError::PreconditionFailed);
        }
        *stored = StoredDocument {
            document,
            etag: etag.clone(),
            expires_at,
        };
        Ok(etag)
    }

    async fn delete(
        &self,
        collection_id: &str,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::Delete)?;
        let collection = state.collection_mut(collection_id)?;
        let key = (partition_key.to_string(), id.to_string());
        let stored = collection
            .documents
            .get(&key)
            .filter(|d| d.is_alive(now))
            .ok_or(StorageError::NotFound)?;
        if let Some(expected) = if_match
            && stored.etag != expected
        {
            return Err(StorageError::PreconditionFailed);
        }
        collection.documents.remove(&key);
        Ok(())
    }

    async fn pop_leased(
        &self,
        collection_id: &str,
        request: PopRequest,
    ) -> Result<Vec<VersionedDocument>, StorageError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::Pop)?;
        if !state.collection(collection_id)?.procedures_installed {
            return Err(StorageError::BadRequest(format!(
                "procedures not installed on {collection_id}"
            )));
        }

        let mut candidates: Vec<(String, String)> = {
            let collection = state.collection(collection_id)?;
            let mut visible: Vec<_> = collection
                .partition(&request.partition_key, request.now)
                .filter(|(_, d)| {
                    d.document.next_visible_time <= request.now
                        && d.document.created_time >= request.min_created_time
                })
                .map(|(k, d)| (d.document.next_visible_time, d.document.created_time, k.clone()))
                .collect();
            visible.sort();
            visible.into_iter().map(|(_, _, k)| k).collect()
        };
        candidates.truncate(request.max_count);

        let mut leased = Vec::with_capacity(candidates.len());
        for key in candidates {
            let etag = state.mint_etag();
            let collection = state.collection_mut(collection_id)?;
            if let Some(stored) = collection.documents.get_mut(&key) {
                stored.document.next_visible_time = request.lease_until;
                stored.etag = etag;
                leased.push(stored.versioned());
            }
        }
        Ok(leased)
    }

    async fn queue_stats(
        &self,
        collection_id: &str,
        partition_key: &str,
        detailed: bool,
        now: DateTime<Utc>,
    ) -> Result<PartitionQueueStats, StorageError> {
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::Stats)?;
        let collection = state.collection(collection_id)?;

        let mut stats = PartitionQueueStats::default();
        let mut per_type = BTreeMap::new();
        for (_, stored) in collection.partition(partition_key, now) {
            let doc = &stored.document;
            stats.pending += 1;
            if doc.next_visible_time <= now {
                stats.unleased += 1;
            }
            if detailed {
                *per_type.entry(doc.command_type).or_insert(0u64) += 1;
                stats.oldest_pending = Some(
                    stats
                        .oldest_pending
                        .map_or(doc.created_time, |t| t.min(doc.created_time)),
                );
                stats.earliest_lease_available = Some(
                    stats
                        .earliest_lease_available
                        .map_or(doc.next_visible_time, |t| t.min(doc.next_visible_time)),
                );
            }
        }
        stats.per_command_type = per_type;
        Ok(stats)
    }

    async fn flush_batch(
        &self,
        collection_id: &str,
        partition_key: &str,
        max_created_time: DateTime<Utc>,
        max_to_delete: usize,
    ) -> Result<FlushBatchResult, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::Flush)?;
        let collection = state.collection_mut(collection_id)?;

        let mut matched: Vec<(DateTime<Utc>, (String, String))> = collection
            .partition(partition_key, now)
            .filter(|(_, d)| d.document.created_time <= max_created_time)
            .map(|(k, d)| (d.document.created_time, k.clone()))
            .collect();
        matched.sort();

        let items_matched = matched.len() as u64;
        let mut items_deleted = 0;
        for (_, key) in matched.into_iter().take(max_to_delete) {
            if collection.documents.remove(&key).is_some() {
                items_deleted += 1;
            }
        }
        Ok(FlushBatchResult {
            items_deleted,
            items_matched,
        })
    }

    async fn partition_key_ranges(
        &self,
        collection_id: &str,
    ) -> Result<Vec<PartitionKeyRangeStatistics>, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(StoreOperation::PartitionRanges)?;
        let collection = state.collection(collection_id)?;

        // Single range; every partition key is sampled with its serialized size.
        let mut per_key: BTreeMap<&str, u64> = BTreeMap::new();
        let mut document_count = 0u64;
        let mut total_bytes = 0u64;
        for ((pk, _), stored) in &collection.documents {
            if !stored.is_alive(now) {
                continue;
            }
            let bytes = serde_json::to_vec(&stored.document).map(|v| v.len() as u64).unwrap_or(0);
            document_count += 1;
            total_bytes += bytes;
            *per_key.entry(pk.as_str()).or_default() += bytes;
        }

        let mut sampled: Vec<PartitionKeyStat> = per_key
            .into_iter()
            .map(|(pk, bytes)| PartitionKeyStat {
                partition_key: pk.to_string(),
                size_kb: bytes.div_ceil(1024),
            })
            .collect();
        sampled.sort_by(|a, b| b.size_kb.cmp(&a.size_kb));

        Ok(vec![PartitionKeyRangeStatistics {
            range_id: "0".to_string(),
            document_count,
            size_kb: total_bytes.div_ceil(1024),
            partition_key_stats: sampled,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentId, AssetGroupId, CommandId, PrivacyCommandType, SubjectType};
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use std::collections::HashSet as Set;

    const COLL: &str = "msaQueueCollection";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn doc(pk: &str, created: DateTime<Utc>) -> CommandDocument {
        CommandDocument {
            id: CommandId::generate(),
            pk: pk.to_string(),
            command_type: PrivacyCommandType::Delete,
            subject_type: SubjectType::Msa,
            agent_id: AgentId::generate(),
            asset_group_id: AssetGroupId::generate(),
            created_time: created,
            next_visible_time: created,
            absolute_expiration_time: created + chrono::Duration::days(30),
            ttl: None,
            body: serde_json::Value::Null,
        }
    }

    async fn store() -> (Arc<ManualClock>, InMemoryDocumentStore) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = InMemoryDocumentStore::new(clock.clone());
        store.create_collection_if_absent(COLL, true).await.unwrap();
        store.install_procedures(COLL).await.unwrap();
        (clock, store)
    }

    fn pop_request(pk: &str, now: DateTime<Utc>, max: usize) -> PopRequest {
        PopRequest {
            partition_key: pk.to_string(),
            max_count: max,
            now,
            lease_until: now + chrono::Duration::minutes(5),
            min_created_time: now - chrono::Duration::days(30),
        }
    }

    #[tokio::test]
    async fn create_conflicts_on_same_identity() {
        let (_, store) = store().await;
        let d = doc("p", start());
        store.create(COLL, d.clone()).await.unwrap();
        assert_eq!(store.create(COLL, d).await, Err(StorageError::Conflict));
    }

    #[tokio::test]
    async fn writes_to_missing_collection_are_not_found() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = InMemoryDocumentStore::new(clock);
        assert_eq!(store.create("nope", doc("p", start())).await, Err(StorageError::NotFound));
    }

    #[tokio::test]
    async fn replace_requires_current_etag() {
        let (_, store) = store().await;
        let d = doc("p", start());
        let first = store.create(COLL, d.clone()).await.unwrap();
        let second = store.replace(COLL, d.clone(), &first).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(
            store.replace(COLL, d, &first).await,
            Err(StorageError::PreconditionFailed)
        );
    }

    #[tokio::test]
    async fn pop_leases_each_document_once() {
        let (clock, store) = store().await;
        for _ in 0..5 {
            store.create(COLL, doc("p", start())).await.unwrap();
        }

        let first = store.pop_leased(COLL, pop_request("p", clock.now(), 3)).await.unwrap();
        let second = store.pop_leased(COLL, pop_request("p", clock.now(), 10)).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);

        let ids: Set<_> = first.iter().chain(&second).map(|d| d.document.id).collect();
        assert_eq!(ids.len(), 5);
        assert!(store.pop_leased(COLL, pop_request("p", clock.now(), 10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pop_skips_documents_older_than_lifespan() {
        let (clock, store) = store().await;
        store.create(COLL, doc("p", start() - chrono::Duration::days(31))).await.unwrap();
        let popped = store.pop_leased(COLL, pop_request("p", clock.now(), 10)).await.unwrap();
        assert!(popped.is_empty());
    }

    #[tokio::test]
    async fn ttl_expires_documents() {
        let (clock, store) = store().await;
        let mut d = doc("p", start());
        d.ttl = Some(10);
        store.create(COLL, d).await.unwrap();
        assert_eq!(store.document_count(COLL).await, 1);
        clock.advance(std::time::Duration::from_secs(10));
        assert_eq!(store.document_count(COLL).await, 0);
    }

    #[tokio::test]
    async fn flush_batch_reports_matches_before_delete() {
        let (_, store) = store().await;
        for _ in 0..3 {
            store.create(COLL, doc("p", start())).await.unwrap();
        }
        let result = store.flush_batch(COLL, "p", start(), 2).await.unwrap();
        assert_eq!(result, FlushBatchResult { items_deleted: 2, items_matched: 3 });
        let result = store.flush_batch(COLL, "p", start(), 2).await.unwrap();
        assert_eq!(result, FlushBatchResult { items_deleted: 1, items_matched: 1 });
        let result = store.flush_batch(COLL, "p", start(), 2).await.unwrap();
        assert_eq!(result.items_matched, 0);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let (_, store) = store().await;
        store.fail_next(StoreOperation::Read, StorageError::Throttled { retry_after: None }).await;
        assert!(store.read(COLL, "p", "x").await.is_err());
        assert_eq!(store.read(COLL, "p", "x").await, Ok(None));
        assert_eq!(store.calls(StoreOperation::Read).await, 2);
    }

    #[tokio::test]
    async fn stats_break_down_by_type_when_detailed() {
        let (clock, store) = store().await;
        store.create(COLL, doc("p", start())).await.unwrap();
        let mut export = doc("p", start() + chrono::Duration::seconds(1));
        export.command_type = PrivacyCommandType::Export;
        store.create(COLL, export).await.unwrap();

        let plain = store.queue_stats(COLL, "p", false, clock.now()).await.unwrap();
        assert_eq!(plain.pending, 2);
        assert!(plain.per_command_type.is_empty());

        let detailed = store.queue_stats(COLL, "p", true, clock.now()).await.unwrap();
        assert_eq!(detailed.per_command_type.get(&PrivacyCommandType::Export), Some(&1));
        assert_eq!(detailed.oldest_pending, Some(start()));
    }
}
