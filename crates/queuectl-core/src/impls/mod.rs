//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemoryStore**: 開発用・テスト用の BackingStore
//! - **RedisStore**: 本番用の BackingStore（`redis` feature）
//! - **ShellExecutor**: シェル経由のコマンド実行
//! - **OsProcessLauncher**: ワーカープロセスの起動・停止

pub mod memory_store;
pub mod os_process;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod shell;

// 主要な型を再エクスポート
pub use self::memory_store::MemoryStore;
pub use self::os_process::{ChildProcess, OsProcessLauncher, PidProcess, pid_alive};
#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;
pub use self::shell::ShellExecutor;
