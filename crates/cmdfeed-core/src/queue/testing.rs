//! Shared fixtures for the queue tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use super::cloud_collection::CloudQueueCollection;
use super::document_collection::{CollectionOptions, DocumentQueueCollection};
use crate::domain::{
    AgentId, AssetGroupId, CommandId, PrivacyCommand, PrivacyCommandType, SubjectType,
};
use crate::impls::{InMemoryCloudQueue, InMemoryDocumentStore, StaticFeatureFlags};
use crate::ports::{Clock, CommandDocument, DocumentStoreClient, ManualClock};

pub(crate) const SUBJECT: SubjectType = SubjectType::Msa;

pub(crate) fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub(crate) struct Fixture {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryDocumentStore>,
    pub flags: Arc<StaticFeatureFlags>,
    pub options: CollectionOptions,
}

impl Fixture {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let mut options = CollectionOptions::default();
        options.retry.base_delay = Duration::from_millis(1);
        options.flush.pause_ms = 1;
        options.flush.not_found_pause_ms = 1;
        Self {
            store: Arc::new(InMemoryDocumentStore::new(clock.clone())),
            flags: Arc::new(StaticFeatureFlags::new()),
            clock,
            options,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn collection(&self, moniker: &str, weight: u32) -> Arc<DocumentQueueCollection> {
        self.collection_with_client(moniker, weight, self.store.clone())
    }

    pub fn collection_with_client(
        &self,
        moniker: &str,
        weight: u32,
        client: Arc<dyn DocumentStoreClient>,
    ) -> Arc<DocumentQueueCollection> {
        Arc::new(DocumentQueueCollection::new(
            moniker,
            weight,
            SUBJECT,
            client,
            self.flags.clone(),
            self.clock(),
            self.options.clone(),
        ))
    }

    pub async fn ready_collection(&self, moniker: &str, weight: u32) -> Arc<DocumentQueueCollection> {
        let collection = self.collection(moniker, weight);
        collection.initialize().await.unwrap();
        collection
    }

    pub fn cloud(&self, account: &str) -> (Arc<InMemoryCloudQueue>, Arc<CloudQueueCollection>) {
        let client = Arc::new(InMemoryCloudQueue::new(account, self.clock()));
        let collection = Arc::new(CloudQueueCollection::new(
            client.clone(),
            self.flags.clone(),
            self.clock(),
            self.options.clone(),
        ));
        (client, collection)
    }

    pub fn command(
        &self,
        command_type: PrivacyCommandType,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
    ) -> PrivacyCommand {
        let now = self.clock.now();
        PrivacyCommand::new(
            command_type,
            agent_id,
            asset_group_id,
            SUBJECT,
            now,
            now + chrono::Duration::days(30),
            serde_json::json!({"requested_by": "test"}),
        )
    }
}

/// Bare document in partition `pk`, created now.
pub(crate) fn document(fx: &Fixture, pk: &str) -> CommandDocument {
    let now = fx.clock.now();
    CommandDocument {
        id: CommandId::generate(),
        pk: pk.to_string(),
        command_type: PrivacyCommandType::Delete,
        subject_type: SUBJECT,
        agent_id: AgentId::generate(),
        asset_group_id: AssetGroupId::generate(),
        created_time: now,
        next_visible_time: now,
        absolute_expiration_time: now + chrono::Duration::days(30),
        ttl: None,
        body: serde_json::Value::Null,
    }
}
