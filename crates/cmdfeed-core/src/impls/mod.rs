//! Impls - 実装（開発用・テスト用）
//!
//! ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryDocumentStore**: etag とリースを再現するドキュメント DB
//! - **InMemoryCloudQueue**: 可視性タイムアウト付きクラウドキュー
//! - **JsonCommandCodec**: デフォルトのコマンド変換
//! - **StaticFeatureFlags**: プロセス内のシャード無効化フラグ
//!
//! 本番用のクライアントは別クレートに配置する前提です。

pub mod codec;
pub mod feature_flags;
pub mod inmem_cloud_queue;
pub mod inmem_document_store;

pub use self::codec::JsonCommandCodec;
pub use self::feature_flags::StaticFeatureFlags;
pub use self::inmem_cloud_queue::{CloudOperation, InMemoryCloudQueue};
pub use self::inmem_document_store::{InMemoryDocumentStore, StoreOperation};
