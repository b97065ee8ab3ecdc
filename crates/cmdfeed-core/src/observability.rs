//! Monitoring views: per-queue statistics and sampled partition sizes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AgentId, AssetGroupId, PrivacyCommandType, SubjectType};

/// Depth of one agent queue on one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentQueueStatistics {
    pub moniker: String,
    pub subject_type: SubjectType,
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,

    /// Set by queues that hold a single command type.
    pub command_type: Option<PrivacyCommandType>,

    pub query_date: DateTime<Utc>,
    pub pending_command_count: u64,
    pub unleased_command_count: Option<u64>,
    pub oldest_pending_command_time: Option<DateTime<Utc>>,
    pub earliest_lease_available_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_command_type: BTreeMap<PrivacyCommandType, u64>,
}

impl AgentQueueStatistics {
    pub fn new(
        moniker: impl Into<String>,
        subject_type: SubjectType,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        query_date: DateTime<Utc>,
    ) -> Self {
        Self {
            moniker: moniker.into(),
            subject_type,
            agent_id,
            asset_group_id,
            command_type: None,
            query_date,
            pending_command_count: 0,
            unleased_command_count: None,
            oldest_pending_command_time: None,
            earliest_lease_available_time: None,
            per_command_type: BTreeMap::new(),
        }
    }
}

/// Sampled size of one partition key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeyStat {
    pub partition_key: String,
    pub size_kb: u64,
}

/// Size statistics for one partition key range.
///
/// Only the largest partition keys are sampled; small ones do not appear in
/// `partition_key_stats` at all.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionKeyRangeStatistics {
    pub range_id: String,
    pub document_count: u64,
    pub size_kb: u64,
    pub partition_key_stats: Vec<PartitionKeyStat>,
}

impl PartitionKeyRangeStatistics {
    pub fn average_document_size_kb(&self) -> Option<f64> {
        if self.document_count == 0 {
            return None;
        }
        Some(self.size_kb as f64 / self.document_count as f64)
    }

    /// Documents in this range that belong to unsampled partition keys.
    pub fn unsampled_documents(&self) -> u64 {
        let Some(average) = self.average_document_size_kb() else {
            return 0;
        };
        if average <= 0.0 {
            return 0;
        }
        let sampled: u64 = self.partition_key_stats.iter().map(|s| s.size_kb).sum();
        let remaining = self.size_kb.saturating_sub(sampled);
        (remaining as f64 / average) as u64
    }
}

/// Worst-case document count of any single unsampled partition key.
///
/// Each range is estimated on its own; the largest estimate wins.
pub fn approximate_documents_count(ranges: &[PartitionKeyRangeStatistics]) -> u64 {
    ranges
        .iter()
        .map(PartitionKeyRangeStatistics::unsampled_documents)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(id: &str, docs: u64, size_kb: u64, sampled: &[(&str, u64)]) -> PartitionKeyRangeStatistics {
        PartitionKeyRangeStatistics {
            range_id: id.to_string(),
            document_count: docs,
            size_kb,
            partition_key_stats: sampled
                .iter()
                .map(|(pk, kb)| PartitionKeyStat {
                    partition_key: pk.to_string(),
                    size_kb: *kb,
                })
                .collect(),
        }
    }

    #[test]
    fn empty_ranges_count_as_zero() {
        assert_eq!(approximate_documents_count(&[]), 0);
        assert_eq!(approximate_documents_count(&[range("0", 0, 0, &[])]), 0);
    }

    #[test]
    fn subtracts_sampled_keys_per_range() {
        // 1000 docs in 2000 KB -> 2 KB per doc; 1200 KB sampled leaves 400 docs.
        let first = range("0", 1000, 2000, &[("a.b", 1200)]);
        // 100 docs in 100 KB; nothing sampled.
        let second = range("1", 100, 100, &[]);

        assert_eq!(first.unsampled_documents(), 400);
        assert_eq!(second.unsampled_documents(), 100);
        assert_eq!(approximate_documents_count(&[second.clone(), first.clone()]), 400);
        assert_eq!(approximate_documents_count(&[first, second]), 400);
    }
}
