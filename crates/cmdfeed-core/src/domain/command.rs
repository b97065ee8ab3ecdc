//! The privacy command carried by the queues.
//!
//! The queue layer never looks inside `body`; it only needs the addressing
//! fields, the timestamps that drive leases and time-to-live, and the type tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{AgentId, AssetGroupId, CommandId};
use super::lease_receipt::LeaseReceipt;
use super::subject::SubjectType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrivacyCommandType {
    Delete,
    Export,
    AccountClose,
    AgeOut,
}

impl PrivacyCommandType {
    pub const ALL: [PrivacyCommandType; 4] = [
        PrivacyCommandType::Delete,
        PrivacyCommandType::Export,
        PrivacyCommandType::AccountClose,
        PrivacyCommandType::AgeOut,
    ];

    /// Stable numeric code, embedded in cloud queue names.
    pub fn code(self) -> u8 {
        match self {
            PrivacyCommandType::Delete => 1,
            PrivacyCommandType::Export => 2,
            PrivacyCommandType::AccountClose => 3,
            PrivacyCommandType::AgeOut => 4,
        }
    }
}

impl fmt::Display for PrivacyCommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrivacyCommandType::Delete => "Delete",
            PrivacyCommandType::Export => "Export",
            PrivacyCommandType::AccountClose => "AccountClose",
            PrivacyCommandType::AgeOut => "AgeOut",
        };
        f.write_str(name)
    }
}

/// A delete/export style instruction addressed to one agent and asset group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyCommand {
    pub command_id: CommandId,
    pub command_type: PrivacyCommandType,
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub subject_type: SubjectType,
    pub created_time: DateTime<Utc>,

    /// After this instant the command is dropped by storage.
    pub absolute_expiration_time: DateTime<Utc>,

    /// Earliest instant the command can be popped. Moving it forward on a
    /// leased command extends the lease.
    pub next_visible_time: DateTime<Utc>,

    /// Opaque payload.
    pub body: serde_json::Value,

    /// Present once the command has been popped or queried.
    #[serde(skip)]
    pub lease_receipt: Option<LeaseReceipt>,
}

impl PrivacyCommand {
    /// New, immediately visible command.
    pub fn new(
        command_type: PrivacyCommandType,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        subject_type: SubjectType,
        created_time: DateTime<Utc>,
        absolute_expiration_time: DateTime<Utc>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            command_id: CommandId::generate(),
            command_type,
            agent_id,
            asset_group_id,
            subject_type,
            created_time,
            absolute_expiration_time,
            next_visible_time: created_time,
            body,
            lease_receipt: None,
        }
    }

    pub fn with_command_id(mut self, command_id: CommandId) -> Self {
        self.command_id = command_id;
        self
    }

    pub fn with_lease_receipt(mut self, receipt: LeaseReceipt) -> Self {
        self.lease_receipt = Some(receipt);
        self
    }
}
