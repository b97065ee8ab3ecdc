//! CloudQueueClient port - one storage account of simple visibility-timeout
//! queues.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::storage_error::StorageError;

/// A message as returned by a receive.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub pop_receipt: String,
    pub body: String,
    pub insertion_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub next_visible_time: DateTime<Utc>,
    pub dequeue_count: u32,
}

#[async_trait]
pub trait CloudQueueClient: Send + Sync {
    /// Storage account name, used as the queue moniker.
    fn account_name(&self) -> &str;

    async fn queue_exists(&self, queue: &str) -> Result<bool, StorageError>;

    async fn create_queue_if_absent(&self, queue: &str) -> Result<(), StorageError>;

    /// Add a message that expires after `time_to_live`.
    async fn add_message(
        &self,
        queue: &str,
        body: String,
        time_to_live: Duration,
    ) -> Result<(), StorageError>;

    /// Receive up to `count` visible messages and hide them for `visibility`.
    async fn get_messages(
        &self,
        queue: &str,
        count: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, StorageError>;

    /// Update visibility and optionally the body. Fails with
    /// `PreconditionFailed` when `pop_receipt` is stale. Returns the new pop
    /// receipt.
    async fn update_message(
        &self,
        queue: &str,
        message_id: &str,
        pop_receipt: &str,
        body: Option<String>,
        visibility: Duration,
    ) -> Result<String, StorageError>;

    async fn delete_message(
        &self,
        queue: &str,
        message_id: &str,
        pop_receipt: &str,
    ) -> Result<(), StorageError>;

    async fn approximate_message_count(&self, queue: &str) -> Result<u64, StorageError>;
}
