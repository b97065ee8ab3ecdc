//! StaticFeatureFlags - in-process set of disabled shards.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::domain::SubjectType;
use crate::ports::{QueueFeatureFlags, flag_key};

#[derive(Debug, Default)]
pub struct StaticFeatureFlags {
    disabled: RwLock<HashSet<String>>,
}

impl StaticFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(&self, moniker: &str, subject_type: SubjectType) {
        let mut disabled = self.disabled.write().unwrap_or_else(|p| p.into_inner());
        disabled.insert(flag_key(moniker, subject_type));
    }

    pub fn enable(&self, moniker: &str, subject_type: SubjectType) {
        let mut disabled = self.disabled.write().unwrap_or_else(|p| p.into_inner());
        disabled.remove(&flag_key(moniker, subject_type));
    }
}

impl QueueFeatureFlags for StaticFeatureFlags {
    fn is_disabled(&self, moniker: &str, subject_type: SubjectType) -> bool {
        let disabled = self.disabled.read().unwrap_or_else(|p| p.into_inner());
        disabled.contains(&flag_key(moniker, subject_type))
    }
}
