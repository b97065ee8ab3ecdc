//! Short-lived memory of partitions that recently popped empty.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ports::Clock;
use crate::ports::clock::checked_after;

/// Partition key -> instant until which pops should not hit storage.
pub struct PopBlocker {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    blocked_until: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl PopBlocker {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            blocked_until: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_blocked(&self, partition_key: &str) -> bool {
        let now = self.clock.now();
        let map = self.blocked_until.read().unwrap_or_else(|p| p.into_inner());
        map.get(partition_key).is_some_and(|until| *until > now)
    }

    pub fn block(&self, partition_key: &str) {
        if self.ttl.is_zero() {
            return;
        }
        let now = self.clock.now();
        let mut map = self.blocked_until.write().unwrap_or_else(|p| p.into_inner());
        map.retain(|_, expiry| *expiry > now);
        let until = checked_after(now, self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        map.insert(partition_key.to_string(), until);
    }
}

impl std::fmt::Debug for PopBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopBlocker").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}
