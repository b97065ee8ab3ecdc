//! CommandQueueFactory - 論理キューの組み立てとキャッシュ
//!
//! Physical collections are created once, when the factory is built, and
//! shared by every logical queue assembled afterwards. Logical queues are
//! cheap to rebuild and live in a time-boxed LRU.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::cache::{LogicalQueueCache, QueueKey};
use super::cloud_collection::CloudQueueCollection;
use super::cloud_queue::{CLOUD_COMMAND_TYPES, CloudCommandQueue};
use super::document_collection::{CollectionOptions, DocumentQueueCollection};
use super::document_queue::DocumentCommandQueue;
use super::logical::{LogicalCommandQueue, LogicalQueueMember};
use crate::config::QueueConfig;
use crate::domain::{AgentId, AssetGroupId, QueueStorageKind, SubjectType};
use crate::error::QueueError;
use crate::impls::JsonCommandCodec;
use crate::ports::{
    Clock, CloudQueueClient, CommandCodec, DocumentStoreClient, NoFlags, QueueFeatureFlags,
    SystemClock,
};

/// Wires backend clients to the configured shards.
///
/// # 使用例
/// ```ignore
/// let factory = CommandQueueFactory::builder(config)
///     .document_client("db1", db1_client)
///     .cloud_client(account_client)
///     .build()?;
/// factory.initialize().await?;
/// let queue = factory.create_queue(agent, group, SubjectType::Msa, QueueStorageKind::DocumentDb)?;
/// ```
///
/// # Fail-fast
/// `build()` rejects an invalid config, a configured shard without a client
/// and a client without a configured shard.
pub struct CommandQueueFactoryBuilder {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    flags: Arc<dyn QueueFeatureFlags>,
    codec: Arc<dyn CommandCodec>,
    document_clients: Vec<(String, Arc<dyn DocumentStoreClient>)>,
    cloud_clients: Vec<Arc<dyn CloudQueueClient>>,
}

impl CommandQueueFactoryBuilder {
    fn new(config: QueueConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            flags: Arc::new(NoFlags),
            codec: Arc::new(JsonCommandCodec),
            document_clients: Vec::new(),
            cloud_clients: Vec::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn feature_flags(mut self, flags: Arc<dyn QueueFeatureFlags>) -> Self {
        self.flags = flags;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn CommandCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Client for the database instance configured under `moniker`.
    pub fn document_client(
        mut self,
        moniker: impl Into<String>,
        client: Arc<dyn DocumentStoreClient>,
    ) -> Self {
        self.document_clients.push((moniker.into(), client));
        self
    }

    /// Client for a cloud queue account; matched to the config by its
    /// account name.
    pub fn cloud_client(mut self, client: Arc<dyn CloudQueueClient>) -> Self {
        self.cloud_clients.push(client);
        self
    }

    pub fn build(self) -> Result<CommandQueueFactory, QueueError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| QueueError::Configuration(e.to_string()))?;
        let options = CollectionOptions::from_config(&config);

        let mut document_clients = self.document_clients;
        let mut document_collections: HashMap<SubjectType, Vec<Arc<DocumentQueueCollection>>> =
            HashMap::new();
        for database in &config.databases {
            let index = document_clients
                .iter()
                .position(|(moniker, _)| moniker.eq_ignore_ascii_case(&database.moniker))
                .ok_or_else(|| {
                    QueueError::Configuration(format!(
                        "no client for database {}",
                        database.moniker
                    ))
                })?;
            let (_, client) = document_clients.swap_remove(index);
            for subject_type in SubjectType::ALL {
                let collection = DocumentQueueCollection::new(
                    database.moniker.clone(),
                    database.weight,
                    subject_type,
                    client.clone(),
                    self.flags.clone(),
                    self.clock.clone(),
                    options.clone(),
                );
                document_collections
                    .entry(subject_type)
                    .or_default()
                    .push(Arc::new(collection));
            }
        }
        if let Some((moniker, _)) = document_clients.first() {
            return Err(QueueError::Configuration(format!(
                "client given for unconfigured database {moniker}"
            )));
        }

        let mut cloud_clients = self.cloud_clients;
        let mut cloud_collections = Vec::new();
        for account in &config.cloud_accounts {
            let index = cloud_clients
                .iter()
                .position(|c| c.account_name().eq_ignore_ascii_case(&account.moniker))
                .ok_or_else(|| {
                    QueueError::Configuration(format!(
                        "no client for cloud account {}",
                        account.moniker
                    ))
                })?;
            let client = cloud_clients.swap_remove(index);
            cloud_collections.push(Arc::new(CloudQueueCollection::new(
                client,
                self.flags.clone(),
                self.clock.clone(),
                options.clone(),
            )));
        }
        if let Some(client) = cloud_clients.first() {
            return Err(QueueError::Configuration(format!(
                "client given for unconfigured cloud account {}",
                client.account_name()
            )));
        }

        info!(
            databases = config.databases.len(),
            cloud_accounts = cloud_collections.len(),
            "command queue factory built"
        );
        Ok(CommandQueueFactory {
            cache: LogicalQueueCache::new(&config.cache, self.clock.clone()),
            clock: self.clock,
            codec: self.codec,
            document_collections,
            cloud_collections,
            config,
        })
    }
}

pub struct CommandQueueFactory {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn CommandCodec>,
    document_collections: HashMap<SubjectType, Vec<Arc<DocumentQueueCollection>>>,
    cloud_collections: Vec<Arc<CloudQueueCollection>>,
    cache: LogicalQueueCache,
}

impl CommandQueueFactory {
    pub fn builder(config: QueueConfig) -> CommandQueueFactoryBuilder {
        CommandQueueFactoryBuilder::new(config)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn cache(&self) -> &LogicalQueueCache {
        &self.cache
    }

    pub fn document_collections(&self, subject_type: SubjectType) -> &[Arc<DocumentQueueCollection>] {
        self.document_collections
            .get(&subject_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn cloud_collections(&self) -> &[Arc<CloudQueueCollection>] {
        &self.cloud_collections
    }

    /// Create every collection, procedure set and known cloud queue.
    pub async fn initialize(&self) -> Result<(), QueueError> {
        for collections in self.document_collections.values() {
            for collection in collections {
                collection.initialize().await?;
            }
        }
        for collection in &self.cloud_collections {
            collection.initialize().await?;
        }
        info!("command queue storage initialized");
        Ok(())
    }

    /// The logical queue for an address. Built on first use and cached;
    /// concurrent first calls converge on one instance.
    pub fn create_queue(
        &self,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        subject_type: SubjectType,
        storage_kind: QueueStorageKind,
    ) -> Result<Arc<LogicalCommandQueue>, QueueError> {
        let key = QueueKey {
            agent_id,
            asset_group_id,
            subject_type,
            storage_kind,
        };
        if let Some(queue) = self.cache.get(&key) {
            return Ok(queue);
        }

        let members = match storage_kind {
            QueueStorageKind::DocumentDb => self.document_members(&key)?,
            QueueStorageKind::CloudQueue => self.cloud_members(&key)?,
        };
        debug!(
            agent_id = %agent_id,
            asset_group_id = %asset_group_id,
            %subject_type,
            %storage_kind,
            members = members.len(),
            "built logical queue"
        );
        let queue = Arc::new(LogicalCommandQueue::new(
            agent_id,
            asset_group_id,
            subject_type,
            storage_kind,
            members,
        ));
        Ok(self.cache.insert_if_absent(key, queue))
    }

    /// Logical queues for several storage kinds, highest priority first.
    pub fn create_prioritized_queues(
        &self,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        subject_type: SubjectType,
        storage_kinds: &[QueueStorageKind],
    ) -> Result<Vec<Arc<LogicalCommandQueue>>, QueueError> {
        let mut queues = storage_kinds
            .iter()
            .map(|kind| self.create_queue(agent_id, asset_group_id, subject_type, *kind))
            .collect::<Result<Vec<_>, _>>()?;
        queues.sort_by_key(|q| q.storage_kind().priority());
        Ok(queues)
    }

    fn document_members(&self, key: &QueueKey) -> Result<Vec<LogicalQueueMember>, QueueError> {
        let collections = self.document_collections(key.subject_type);
        if collections.is_empty() {
            return Err(QueueError::Configuration(format!(
                "no database serves subject type {}",
                key.subject_type
            )));
        }
        let lease = self
            .config
            .lease
            .lease_for(&key.agent_id)
            .unwrap_or_else(|| self.config.lease.default_lease());

        Ok(collections
            .iter()
            .map(|collection| {
                let queue = DocumentCommandQueue::new(
                    collection.clone(),
                    self.codec.clone(),
                    self.clock.clone(),
                    key.agent_id,
                    key.asset_group_id,
                    lease,
                );
                LogicalQueueMember::new(Arc::new(queue), collection.weight(), collection.moniker())
            })
            .collect())
    }

    fn cloud_members(&self, key: &QueueKey) -> Result<Vec<LogicalQueueMember>, QueueError> {
        if self.cloud_collections.is_empty() {
            return Err(QueueError::Configuration("no cloud queue account configured".into()));
        }
        let lease = self
            .config
            .lease
            .lease_for(&key.agent_id)
            .unwrap_or_else(|| self.config.lease.cloud_default_lease());

        let mut members = Vec::new();
        for collection in &self.cloud_collections {
            for command_type in CLOUD_COMMAND_TYPES {
                let queue = CloudCommandQueue::new(
                    collection.clone(),
                    self.codec.clone(),
                    self.clock.clone(),
                    key.agent_id,
                    key.asset_group_id,
                    key.subject_type,
                    command_type,
                    lease,
                )?;
                members.push(LogicalQueueMember::new(
                    Arc::new(queue),
                    collection.weight(),
                    collection.moniker(),
                ));
            }
        }
        Ok(members)
    }
}

impl std::fmt::Debug for CommandQueueFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueueFactory")
            .field("databases", &self.config.databases.len())
            .field("cloud_collections", &self.cloud_collections)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
