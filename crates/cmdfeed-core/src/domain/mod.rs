//! Domain model: identifiers, commands, lease receipts, addressing.

pub mod command;
pub mod ids;
pub mod lease_receipt;
pub mod partition;
pub mod storage;
pub mod subject;

pub use command::{PrivacyCommand, PrivacyCommandType};
pub use ids::{AgentId, AssetGroupId, CommandId, IdParseError};
pub use lease_receipt::{LeaseReceipt, ReceiptParseError};
pub use partition::partition_key;
pub use storage::{QueuePriority, QueueStorageKind};
pub use subject::SubjectType;
