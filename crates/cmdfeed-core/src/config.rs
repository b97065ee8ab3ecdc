//! Queue layer configuration.
//!
//! Loaded from JSON. Every field has a default, so `{}` is a valid (if
//! backend-less) configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::AgentId;
use crate::queue::RetryPolicy;

/// Upper bound for any configured lease, default or per agent.
pub const MAX_LEASE_SECS: u64 = 7 * 24 * 60 * 60;

pub const MAX_POP_BLOCKER_SECS: u64 = 60 * 60;

pub const MAX_COMMAND_LIFESPAN_DAYS: u32 = 10 * 365;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Document database instances backing the high priority tier.
    pub databases: Vec<DatabaseInstanceConfig>,

    /// Cloud queue accounts backing the low priority tier.
    pub cloud_accounts: Vec<CloudAccountConfig>,

    pub lease: LeaseSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub flush: FlushSettings,

    /// How long an empty pop suppresses further pops on the same partition.
    pub pop_blocker_secs: u64,

    /// Commands older than this are never popped.
    pub max_command_lifespan_days: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            cloud_accounts: Vec::new(),
            lease: LeaseSettings::default(),
            retry: RetrySettings::default(),
            cache: CacheSettings::default(),
            flush: FlushSettings::default(),
            pop_blocker_secs: 60,
            max_command_lifespan_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInstanceConfig {
    pub moniker: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAccountConfig {
    pub moniker: String,
    #[serde(default)]
    pub connection: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// Lease applied by the document tier when neither the caller nor an
    /// agent override names one.
    pub default_secs: u64,

    /// Lease applied by the cloud tier when the caller names none.
    pub cloud_default_secs: u64,

    /// Per-agent lease overrides in seconds.
    pub agent_overrides: HashMap<AgentId, u64>,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            default_secs: 900,
            cloud_default_secs: 900,
            agent_overrides: HashMap::new(),
        }
    }
}

impl LeaseSettings {
    pub fn default_lease(&self) -> Duration {
        Duration::from_secs(self.default_secs)
    }

    pub fn cloud_default_lease(&self) -> Duration {
        Duration::from_secs(self.cloud_default_secs)
    }

    pub fn lease_for(&self, agent_id: &AgentId) -> Option<Duration> {
        self.agent_overrides
            .get(agent_id)
            .map(|secs| Duration::from_secs(*secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub sliding_ttl_secs: u64,
    pub absolute_ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            sliding_ttl_secs: 15 * 60,
            absolute_ttl_secs: 30 * 60,
            capacity: 1000,
        }
    }
}

impl CacheSettings {
    pub fn sliding_ttl(&self) -> Duration {
        Duration::from_secs(self.sliding_ttl_secs)
    }

    pub fn absolute_ttl(&self) -> Duration {
        Duration::from_secs(self.absolute_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushSettings {
    pub batch_size: usize,
    pub pause_ms: u64,
    pub not_found_pause_ms: u64,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pause_ms: 100,
            not_found_pause_ms: 100,
        }
    }
}

impl FlushSettings {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    pub fn not_found_pause(&self) -> Duration {
        Duration::from_millis(self.not_found_pause_ms)
    }
}

impl QueueConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: QueueConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn pop_blocker_ttl(&self) -> Duration {
        Duration::from_secs(self.pop_blocker_secs)
    }

    pub fn max_command_lifespan(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_command_lifespan_days) * 24 * 60 * 60)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for db in &self.databases {
            if db.moniker.trim().is_empty() {
                return Err(ConfigError::Invalid("database moniker must not be empty".into()));
            }
            if db.weight == 0 {
                return Err(ConfigError::Invalid(format!(
                    "database {} has zero weight",
                    db.moniker
                )));
            }
            if !seen.insert(db.moniker.to_ascii_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate moniker {}",
                    db.moniker
                )));
            }
        }
        for account in &self.cloud_accounts {
            if account.moniker.trim().is_empty() {
                return Err(ConfigError::Invalid("cloud account moniker must not be empty".into()));
            }
            if !seen.insert(account.moniker.to_ascii_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate moniker {}",
                    account.moniker
                )));
            }
        }
        if self.pop_blocker_secs > MAX_POP_BLOCKER_SECS {
            return Err(ConfigError::Invalid(format!(
                "pop_blocker_secs must be at most {MAX_POP_BLOCKER_SECS}"
            )));
        }
        let leases = [self.lease.default_secs, self.lease.cloud_default_secs]
            .into_iter()
            .chain(self.lease.agent_overrides.values().copied());
        for secs in leases {
            if secs > MAX_LEASE_SECS {
                return Err(ConfigError::Invalid(format!(
                    "lease of {secs}s exceeds {MAX_LEASE_SECS}s"
                )));
            }
        }
        if self.max_command_lifespan_days > MAX_COMMAND_LIFESPAN_DAYS {
            return Err(ConfigError::Invalid(format!(
                "max_command_lifespan_days must be at most {MAX_COMMAND_LIFESPAN_DAYS}"
            )));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache capacity must be positive".into()));
        }
        if self.flush.batch_size == 0 {
            return Err(ConfigError::Invalid("flush batch size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry max_attempts must be positive".into()));
        }
        if self.retry.multiplier < 1.0 || self.retry.jitter < 0.0 {
            return Err(ConfigError::Invalid(
                "retry multiplier must be >= 1 and jitter non-negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_object_uses_defaults() {
        let config = QueueConfig::from_json_str("{}").unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.pop_blocker_ttl(), Duration::from_secs(60));
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.sliding_ttl(), Duration::from_secs(900));
        assert_eq!(config.cache.absolute_ttl(), Duration::from_secs(1800));
        assert_eq!(config.flush.batch_size, 100);
        assert_eq!(config.retry.policy().max_attempts, 5);
        assert_eq!(config.max_command_lifespan(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn parses_backends_and_overrides() {
        let agent = AgentId::generate();
        let json = format!(
            r#"{{
                "databases": [
                    {{"moniker": "db1", "uri": "https://db1", "weight": 3}},
                    {{"moniker": "db2"}}
                ],
                "cloud_accounts": [{{"moniker": "acct1"}}],
                "lease": {{"agent_overrides": {{"{agent}": 120}}}}
            }}"#
        );
        let config = QueueConfig::from_json_str(&json).unwrap();

        assert_eq!(config.databases.len(), 2);
        assert_eq!(config.databases[0].weight, 3);
        assert_eq!(config.databases[1].weight, 1);
        assert_eq!(config.cloud_accounts[0].moniker, "acct1");
        assert_eq!(config.lease.lease_for(&agent), Some(Duration::from_secs(120)));
        assert_eq!(config.lease.lease_for(&AgentId::generate()), None);
    }

    #[rstest]
    #[case::zero_weight(r#"{"databases": [{"moniker": "db1", "weight": 0}]}"#)]
    #[case::duplicate(r#"{"databases": [{"moniker": "db1"}, {"moniker": "DB1"}]}"#)]
    #[case::duplicate_across_tiers(r#"{"databases": [{"moniker": "x"}], "cloud_accounts": [{"moniker": "x"}]}"#)]
    #[case::zero_capacity(r#"{"cache": {"capacity": 0}}"#)]
    #[case::zero_batch(r#"{"flush": {"batch_size": 0}}"#)]
    #[case::huge_pop_blocker(r#"{"pop_blocker_secs": 18446744073709551615}"#)]
    #[case::huge_lease(r#"{"lease": {"default_secs": 18446744073709551615}}"#)]
    #[case::huge_cloud_lease(r#"{"lease": {"cloud_default_secs": 604801}}"#)]
    #[case::huge_lifespan(r#"{"max_command_lifespan_days": 4294967295}"#)]
    fn rejects_invalid(#[case] json: &str) {
        let err = QueueConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = QueueConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
