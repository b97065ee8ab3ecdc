//! Process-local cache of assembled logical queues.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;

use super::logical::LogicalCommandQueue;
use crate::config::CacheSettings;
use crate::domain::{AgentId, AssetGroupId, QueueStorageKind, SubjectType};
use crate::ports::Clock;
use crate::ports::clock::to_chrono;

/// Address of one logical queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub subject_type: SubjectType,
    pub storage_kind: QueueStorageKind,
}

struct CacheEntry {
    queue: Arc<LogicalCommandQueue>,
    inserted_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

/// LRU of logical queues with a sliding and an absolute time-to-live.
///
/// Expiry is checked on read. Dropping an entry never touches storage, so
/// leases taken through an evicted queue stay valid.
pub struct LogicalQueueCache {
    entries: Mutex<LruCache<QueueKey, CacheEntry>>,
    sliding_ttl: chrono::Duration,
    absolute_ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl LogicalQueueCache {
    pub fn new(settings: &CacheSettings, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(settings.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            sliding_ttl: to_chrono(settings.sliding_ttl()),
            absolute_ttl: to_chrono(settings.absolute_ttl()),
            clock,
        }
    }

    fn is_live(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.inserted_at < self.absolute_ttl && now - entry.last_accessed < self.sliding_ttl
    }

    pub fn get(&self, key: &QueueKey) -> Option<Arc<LogicalCommandQueue>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let live = entries.peek(key).map(|e| self.is_live(e, now))?;
        if !live {
            entries.pop(key);
            return None;
        }
        let entry = entries.get_mut(key)?;
        entry.last_accessed = now;
        Some(entry.queue.clone())
    }

    /// Insert `queue` unless a live entry already holds the key; either way
    /// return the cached instance.
    pub fn insert_if_absent(
        &self,
        key: QueueKey,
        queue: Arc<LogicalCommandQueue>,
    ) -> Arc<LogicalCommandQueue> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = entries.get_mut(&key)
            && self.is_live(entry, now)
        {
            entry.last_accessed = now;
            return entry.queue.clone();
        }
        entries.put(
            key,
            CacheEntry {
                queue: queue.clone(),
                inserted_at: now,
                last_accessed: now,
            },
        );
        queue
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LogicalQueueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalQueueCache")
            .field("len", &self.len())
            .field("sliding_ttl", &self.sliding_ttl)
            .field("absolute_ttl", &self.absolute_ttl)
            .finish_non_exhaustive()
    }
}
