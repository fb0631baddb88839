//! CommandExecutor port - ジョブのコマンドを実行して Outcome を返す
//!
//! # 設計原則
//! - 実行の失敗（非ゼロ終了・タイムアウト・起動失敗）はすべて `Outcome` の
//!   Failure として返す。エラー型で返すのはワーカーが続行できない場合のみ

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Outcome;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<Outcome, ExecError>;
}
