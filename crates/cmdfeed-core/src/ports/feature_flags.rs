//! QueueFeatureFlags port - operator switches for pulling shards out of
//! rotation without a deploy.

use crate::domain::SubjectType;

pub trait QueueFeatureFlags: Send + Sync {
    /// Is the `(moniker, subject_type)` shard disabled?
    fn is_disabled(&self, moniker: &str, subject_type: SubjectType) -> bool;
}

/// Flag key for a shard: `MONIKER.SUBJECT`, upper-cased.
pub fn flag_key(moniker: &str, subject_type: SubjectType) -> String {
    format!("{moniker}.{subject_type}").to_ascii_uppercase()
}

/// Flags that never disable anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFlags;

impl QueueFeatureFlags for NoFlags {
    fn is_disabled(&self, _moniker: &str, _subject_type: SubjectType) -> bool {
        false
    }
}
