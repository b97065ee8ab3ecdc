//! Lease receipts.
//!
//! A receipt is handed to the consumer that popped a command. It carries
//! enough identity to route a later replace/delete back to the exact queue and
//! shard that issued it, plus the storage version token used as the optimistic
//! concurrency precondition.
//!
//! Receipts are values: a replace returns a new receipt and the old one keeps
//! its stale token forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::command::{PrivacyCommand, PrivacyCommandType};
use super::ids::{AgentId, AssetGroupId, CommandId};
use super::storage::QueueStorageKind;
use super::subject::SubjectType;

/// Schema version written into new receipts.
pub const CURRENT_RECEIPT_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseReceipt {
    #[serde(rename = "v")]
    version: u32,
    #[serde(rename = "dm")]
    moniker: String,
    #[serde(rename = "cid")]
    command_id: CommandId,
    #[serde(rename = "tk")]
    token: String,
    #[serde(rename = "qst")]
    storage_kind: QueueStorageKind,
    #[serde(rename = "st")]
    subject_type: SubjectType,
    #[serde(rename = "aid")]
    agent_id: AgentId,
    #[serde(rename = "gid")]
    asset_group_id: AssetGroupId,
    #[serde(rename = "ct")]
    command_type: PrivacyCommandType,
    #[serde(rename = "et")]
    approximate_expiration_time: DateTime<Utc>,
    #[serde(rename = "cts")]
    command_created_time: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ReceiptParseError {
    #[error("lease receipt is empty")]
    Empty,
    #[error("malformed lease receipt: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported lease receipt version {0}")]
    UnsupportedVersion(u32),
}

impl LeaseReceipt {
    /// Receipt for `command` as stored on `moniker` under version `token`.
    pub fn for_command(
        moniker: impl Into<String>,
        token: impl Into<String>,
        command: &PrivacyCommand,
        storage_kind: QueueStorageKind,
    ) -> Self {
        Self {
            version: CURRENT_RECEIPT_VERSION,
            moniker: moniker.into(),
            command_id: command.command_id,
            token: token.into(),
            storage_kind,
            subject_type: command.subject_type,
            agent_id: command.agent_id,
            asset_group_id: command.asset_group_id,
            command_type: command.command_type,
            approximate_expiration_time: command.next_visible_time,
            command_created_time: command.created_time,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn moniker(&self) -> &str {
        &self.moniker
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// Storage version at the time the receipt was issued.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn storage_kind(&self) -> QueueStorageKind {
        self.storage_kind
    }

    pub fn subject_type(&self) -> SubjectType {
        self.subject_type
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn asset_group_id(&self) -> AssetGroupId {
        self.asset_group_id
    }

    pub fn command_type(&self) -> PrivacyCommandType {
        self.command_type
    }

    /// When the lease is expected to lapse. Informational only.
    pub fn approximate_expiration_time(&self) -> DateTime<Utc> {
        self.approximate_expiration_time
    }

    pub fn command_created_time(&self) -> DateTime<Utc> {
        self.command_created_time
    }

    /// Opaque string form handed to external consumers.
    pub fn serialize(&self) -> String {
        // Every field is a plain string, number or timestamp.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(value: &str) -> Result<Self, ReceiptParseError> {
        if value.trim().is_empty() {
            return Err(ReceiptParseError::Empty);
        }
        let receipt: LeaseReceipt = serde_json::from_str(value)?;
        if receipt.version > CURRENT_RECEIPT_VERSION {
            return Err(ReceiptParseError::UnsupportedVersion(receipt.version));
        }
        Ok(receipt)
    }

    pub fn try_parse(value: &str) -> Option<Self> {
        match Self::parse(value) {
            Ok(receipt) => Some(receipt),
            Err(err) => {
                tracing::debug!(error = %err, "lease receipt failed to parse");
                None
            }
        }
    }
}
