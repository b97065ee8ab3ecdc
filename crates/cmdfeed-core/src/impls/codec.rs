//! JsonCommandCodec - default field-for-field mapping.

use crate::domain::PrivacyCommand;
use crate::ports::{CodecError, CommandCodec, CommandDocument};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCommandCodec;

impl CommandCodec for JsonCommandCodec {
    fn to_document(&self, command: &PrivacyCommand) -> Result<CommandDocument, CodecError> {
        if command.absolute_expiration_time < command.created_time {
            return Err(CodecError::Encode {
                command_id: command.command_id,
                message: "command expires before it was created".to_string(),
            });
        }
        Ok(CommandDocument {
            id: command.command_id,
            pk: String::new(),
            command_type: command.command_type,
            subject_type: command.subject_type,
            agent_id: command.agent_id,
            asset_group_id: command.asset_group_id,
            created_time: command.created_time,
            next_visible_time: command.next_visible_time,
            absolute_expiration_time: command.absolute_expiration_time,
            ttl: None,
            body: command.body.clone(),
        })
    }

    fn from_document(&self, document: &CommandDocument) -> Result<PrivacyCommand, CodecError> {
        Ok(PrivacyCommand {
            command_id: document.id,
            command_type: document.command_type,
            agent_id: document.agent_id,
            asset_group_id: document.asset_group_id,
            subject_type: document.subject_type,
            created_time: document.created_time,
            absolute_expiration_time: document.absolute_expiration_time,
            next_visible_time: document.next_visible_time,
            body: document.body.clone(),
            lease_receipt: None,
        })
    }
}
