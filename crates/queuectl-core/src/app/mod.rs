//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **WorkerLoop**: ジョブ実行ループ（stop flag→fetch→execute→report）
//! - **RetryScheduler**: delayed ジョブの昇格
//! - **WorkerManager**: ワーカープロセスの起動・停止
//! - **StatusReport**: ステータスクエリ

pub mod builder;
pub mod manager;
pub mod scheduler_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::manager::{ManagerError, SpawnedWorker, StopReport, StopTimings, WorkerManager};
pub use self::scheduler_loop::RetryScheduler;
pub use self::status::StatusReport;
pub use self::worker_loop::{ExitReason, WorkerLoop, WorkerStats};
