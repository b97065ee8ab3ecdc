//! InMemoryCloudQueue - 開発・テスト用のクラウドキュー
//!
//! Messages become invisible for the requested timeout when received; every
//! receive or update mints a new pop receipt and invalidates the old one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::ports::clock::checked_after;
use crate::ports::{Clock, CloudQueueClient, QueueMessage, StorageError};

/// Largest batch a single receive may ask for.
pub const MAX_MESSAGES_PER_GET: usize = 32;

/// Backend calls, for counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOperation {
    Exists,
    CreateQueue,
    Add,
    Get,
    Update,
    Delete,
    Count,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    pop_receipt: Option<String>,
    body: String,
    insertion_time: DateTime<Utc>,
    expiration_time: DateTime<Utc>,
    next_visible_time: DateTime<Utc>,
    dequeue_count: u32,
}

impl StoredMessage {
    fn is_alive(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time > now
    }

    fn snapshot(&self, pop_receipt: String) -> QueueMessage {
        QueueMessage {
            message_id: self.message_id.clone(),
            pop_receipt,
            body: self.body.clone(),
            insertion_time: self.insertion_time,
            expiration_time: self.expiration_time,
            next_visible_time: self.next_visible_time,
            dequeue_count: self.dequeue_count,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, Vec<StoredMessage>>,
    calls: HashMap<CloudOperation, u64>,
    faults: HashMap<CloudOperation, VecDeque<StorageError>>,
}

impl State {
    fn enter(&mut self, op: CloudOperation) -> Result<(), StorageError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn queue_mut(&mut self, queue: &str, now: DateTime<Utc>) -> Result<&mut Vec<StoredMessage>, StorageError> {
        let messages = self.queues.get_mut(queue).ok_or(StorageError::NotFound)?;
        messages.retain(|m| m.is_alive(now));
        Ok(messages)
    }
}

/// `now + duration`, rejected the way the service rejects an oversized
/// visibility timeout or time-to-live.
fn offset(now: DateTime<Utc>, duration: Duration, what: &str) -> Result<DateTime<Utc>, StorageError> {
    checked_after(now, duration)
        .ok_or_else(|| StorageError::BadRequest(format!("{what} {duration:?} is out of range")))
}

pub struct InMemoryCloudQueue {
    account_name: String,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl InMemoryCloudQueue {
    pub fn new(account_name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            account_name: account_name.into(),
            clock,
            state: Mutex::new(State::default()),
        }
    }

    pub async fn calls(&self, op: CloudOperation) -> u64 {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn total_calls(&self) -> u64 {
        self.state.lock().await.calls.values().sum()
    }

    pub async fn fail_next(&self, op: CloudOperation, error: StorageError) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Live messages in a queue, visible or not.
    pub async fn message_count(&self, queue: &str) -> usize {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.iter().filter(|m| m.is_alive(now)).count())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for InMemoryCloudQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCloudQueue")
            .field("account_name", &self.account_name)
            .finish_non_exhaustive()
    }
}

fn new_pop_receipt() -> String {
    Ulid::new().to_string()
}

#[async_trait]
impl CloudQueueClient for InMemoryCloudQueue {
    fn account_name(&self) -> &str {
        &self.account_name
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        state.enter(CloudOperation::Exists)?;
        Ok(state.queues.contains_key(queue))
    }

    async fn create_queue_if_absent(&self, queue: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.enter(CloudOperation::CreateQueue)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn add_message(
        &self,
        queue: &str,
        body: String,
        time_to_live: Duration,
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        let expiration_time = offset(now, time_to_live, "time-to-live")?;
        let mut state = self.state.lock().await;
        state.enter(CloudOperation::Add)?;
        let messages = state.queue_mut(queue, now)?;
        messages.push(StoredMessage {
            message_id: Ulid::new().to_string(),
            pop_receipt: None,
            body,
            insertion_time: now,
            expiration_time,
            next_visible_time: now,
            dequeue_count: 0,
        });
        Ok(())
    }

    async fn get_messages(
        &self,
        queue: &str,
        count: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, StorageError> {
        if count == 0 || count > MAX_MESSAGES_PER_GET {
            return Err(StorageError::BadRequest(format!(
                "message count {count} outside 1..={MAX_MESSAGES_PER_GET}"
            )));
        }
        let now = self.clock.now();
        let visible_at = offset(now, visibility, "visibility timeout")?;
        let mut state = self.state.lock().await;
        state.enter(CloudOperation::Get)?;
        let messages = state.queue_mut(queue, now)?;

        let mut received = Vec::new();
        for message in messages.iter_mut().filter(|m| m.next_visible_time <= now) {
            if received.len() == count {
                break;
            }
            let receipt = new_pop_receipt();
            message.pop_receipt = Some(receipt.clone());
            message.next_visible_time = visible_at;
            message.dequeue_count += 1;
            received.push(message.snapshot(receipt));
        }
        Ok(received)
    }

    async fn update_message(
        &self,
        queue: &str,
        message_id: &str,
        pop_receipt: &str,
        body: Option<String>,
        visibility: Duration,
    ) -> Result<String, StorageError> {
        let now = self.clock.now();
        let visible_at = offset(now, visibility, "visibility timeout")?;
        let mut state = self.state.lock().await;
        state.enter(CloudOperation::Update)?;
        let messages = state.queue_mut(queue, now)?;
        let message = messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
            .ok_or(StorageError::NotFound)?;
        if message.pop_receipt.as_deref() != Some(pop_receipt) {
            return Err(StorageError::PreconditionFailed);
        }

        let receipt = new_pop_receipt();
        message.pop_receipt = Some(receipt.clone());
        message.next_visible_time = visible_at;
        if let Some(body) = body {
            message.body = body;
        }
        Ok(receipt)
    }

    async fn delete_message(
        &self,
        queue: &str,
        message_id: &str,
        pop_receipt: &str,
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(CloudOperation::Delete)?;
        let messages = state.queue_mut(queue, now)?;
        let index = messages
            .iter()
            .position(|m| m.message_id == message_id)
            .ok_or(StorageError::NotFound)?;
        if messages[index].pop_receipt.as_deref() != Some(pop_receipt) {
            return Err(StorageError::PreconditionFailed);
        }
        messages.remove(index);
        Ok(())
    }

    async fn approximate_message_count(&self, queue: &str) -> Result<u64, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(CloudOperation::Count)?;
        Ok(state.queue_mut(queue, now)?.len() as u64)
    }
}
