//! Partition addressing.
//!
//! Every queue operation computes the partition key, and downstream flush and
//! query tooling depend on the exact `"{agent}.{asset_group}"` format.

use std::fmt::Write;

use super::ids::{AgentId, AssetGroupId};

/// Length of a ULID in its canonical text form.
const ID_TEXT_LEN: usize = 26;

/// Address of the (agent, asset group) queue inside one physical collection.
pub fn partition_key(agent_id: &AgentId, asset_group_id: &AssetGroupId) -> String {
    let mut key = String::with_capacity(ID_TEXT_LEN * 2 + 1);
    // Writing into a String cannot fail.
    let _ = write!(key, "{agent_id}.{asset_group_id}");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equals_literal_concatenation() {
        for _ in 0..64 {
            let agent = AgentId::generate();
            let group = AssetGroupId::generate();
            let naive = agent.to_string() + "." + &group.to_string();
            assert_eq!(partition_key(&agent, &group), naive);
        }
    }

    #[test]
    fn is_stable_across_calls() {
        let agent = AgentId::generate();
        let group = AssetGroupId::generate();
        let first = partition_key(&agent, &group);
        assert_eq!(partition_key(&agent, &group), first);
        assert_eq!(first.len(), ID_TEXT_LEN * 2 + 1);
    }

    #[test]
    fn distinct_pairs_get_distinct_keys() {
        let agent = AgentId::generate();
        let a = partition_key(&agent, &AssetGroupId::generate());
        let b = partition_key(&agent, &AssetGroupId::generate());
        assert_ne!(a, b);
    }
}
