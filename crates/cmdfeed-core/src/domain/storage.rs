//! Storage tiers and their read priority.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which physical backend family serves a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStorageKind {
    /// Partitioned document database collection.
    DocumentDb,
    /// Plain cloud queue account.
    CloudQueue,
}

impl QueueStorageKind {
    /// Read priority of queues backed by this tier.
    pub fn priority(self) -> QueuePriority {
        match self {
            QueueStorageKind::DocumentDb => QueuePriority::High,
            QueueStorageKind::CloudQueue => QueuePriority::Low,
        }
    }
}

impl fmt::Display for QueueStorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStorageKind::DocumentDb => f.write_str("DocumentDb"),
            QueueStorageKind::CloudQueue => f.write_str("CloudQueue"),
        }
    }
}

/// Read scheduling class. `High` sorts before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueuePriority {
    High,
    Low,
}
