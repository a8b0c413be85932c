//! App - アプリケーション層
//!
//! ports を組み合わせて、キューとワーカーの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **ExecutorRegistry**: task_type -> Executor
//! - **WorkerPoolBuilder**: ワイヤリングと起動時検証（Fail-fast）
//! - **AttemptRunner**: 1 エントリ分の状態遷移（claim -> execute -> persist）
//! - **RetryScheduler**: retry の遅延 re-push（shutdown で flush / abandon）
//! - **WorkerPool**: 固定数のワーカーと停止シグナル
//! - **TaskService**: submit / get / list / cancel
//! - **TaskCounts**: ステータス別の件数

pub mod attempt;
pub mod builder;
pub mod registry;
pub mod retry_scheduler;
pub mod service;
pub mod status;
pub mod worker_pool;

// 主要な型を再エクスポート
pub use self::attempt::{AttemptOutcome, AttemptRunner};
pub use self::builder::WorkerPoolBuilder;
pub use self::registry::ExecutorRegistry;
pub use self::retry_scheduler::{RetryScheduler, RetrySender, ShutdownRetryMode};
pub use self::service::TaskService;
pub use self::status::TaskCounts;
pub use self::worker_pool::{WorkerConfig, WorkerPool, WorkerPoolHandle};
