//! cmdfeed-core
//!
//! Command queue abstraction layer for privacy commands.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, command, subject, lease_receipt, partition, storage）
//! - **ports**: 抽象化レイヤー（DocumentStoreClient, CloudQueueClient, CommandCodec, Clock, QueueFeatureFlags）
//! - **impls**: 実装（InMemoryDocumentStore, InMemoryCloudQueue など開発用）
//! - **queue**: 物理コレクション、コマンドキュー、論理キュー、ファクトリ
//! - **config**: JSON 設定
//! - **observability**: 監視用の統計ビュー
//! - **error**: QueueError

pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use config::{ConfigError, QueueConfig};
pub use error::QueueError;
pub use queue::{
    CommandQueue, CommandQueueFactory, CommandQueuePopResult, LogicalCommandQueue,
    ReplaceOperations,
};
