//! Ports - 抽象化レイヤー
//!
//! 外部システム（ドキュメント DB, クラウドキュー, フィーチャーフラグ）への
//! インターフェースを定義します。コマンドキューはこれらの trait のみに依存し、
//! 実装の詳細は `impls` 側に閉じ込めます。

pub mod clock;
pub mod cloud_queue;
pub mod codec;
pub mod document_store;
pub mod feature_flags;
pub mod storage_error;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::cloud_queue::{CloudQueueClient, QueueMessage};
pub use self::codec::{CodecError, CommandCodec, CommandDocument};
pub use self::document_store::{
    DocumentStoreClient, FlushBatchResult, PartitionQueueStats, PopRequest, VersionedDocument,
};
pub use self::feature_flags::{NoFlags, QueueFeatureFlags, flag_key};
pub use self::storage_error::StorageError;
