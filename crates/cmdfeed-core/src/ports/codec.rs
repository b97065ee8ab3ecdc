//! CommandCodec port - conversion between `PrivacyCommand` and the
//! backend-native document shape.
//!
//! The document database stores `CommandDocument` as-is; the cloud queue
//! stores it JSON-encoded as the message body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AgentId, AssetGroupId, CommandId, PrivacyCommand, PrivacyCommandType, SubjectType};

/// Storage shape of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDocument {
    pub id: CommandId,

    /// Partition key; stamped by the command queue, empty until then.
    #[serde(default)]
    pub pk: String,

    #[serde(rename = "ct")]
    pub command_type: PrivacyCommandType,
    #[serde(rename = "st")]
    pub subject_type: SubjectType,
    #[serde(rename = "aid")]
    pub agent_id: AgentId,
    #[serde(rename = "gid")]
    pub asset_group_id: AssetGroupId,
    #[serde(rename = "crt")]
    pub created_time: DateTime<Utc>,
    #[serde(rename = "nvt")]
    pub next_visible_time: DateTime<Utc>,
    #[serde(rename = "aet")]
    pub absolute_expiration_time: DateTime<Utc>,

    /// Storage-native time-to-live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,

    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode command {command_id}: {message}")]
    Encode { command_id: CommandId, message: String },

    #[error("failed to decode stored command: {0}")]
    Decode(String),
}

/// Converts commands to and from their stored form.
pub trait CommandCodec: Send + Sync {
    fn to_document(&self, command: &PrivacyCommand) -> Result<CommandDocument, CodecError>;

    fn from_document(&self, document: &CommandDocument) -> Result<PrivacyCommand, CodecError>;

    /// Message body for the cloud queue tier.
    fn to_message(&self, document: &CommandDocument) -> Result<String, CodecError> {
        serde_json::to_string(document).map_err(|e| CodecError::Encode {
            command_id: document.id,
            message: e.to_string(),
        })
    }

    fn from_message(&self, body: &str) -> Result<CommandDocument, CodecError> {
        serde_json::from_str(body).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
