//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（Redis, OS プロセス, シェル, 時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ジョブレコード（ハッシュ）が正本。キュー構造は job id のみを持つ
//! - 共有ストアへの書き込みはすべて BackingStore を経由する

pub mod backing_store;
pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod process;

// 主要な trait を再エクスポート
pub use self::backing_store::{BackingStore, FieldGuard, Promotion, StoreOp};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{CommandExecutor, ExecError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::process::{ProcessHandle, ProcessLauncher};
