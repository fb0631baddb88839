//! Errors - エラー型と分類
//!
//! - StoreError: バックエンドストア（Redis など）の接続・コマンド失敗。一時的な障害として扱う
//! - RecordError: ストア境界での厳密なデコードに失敗したレコード
//! - QueueError: キュー操作の失敗（検証・未発見・不正な遷移を含む）

use thiserror::Error;

use super::ids::JobId;
use super::state::JobState;

/// Backing store failure. Callers in loops treat this as transient.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),
}

/// A stored record that cannot be decoded into its typed schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record {key} is missing field `{field}`")]
    MissingField { key: String, field: &'static str },

    #[error("record {key} has invalid `{field}`: {value:?}")]
    InvalidField {
        key: String,
        field: &'static str,
        value: String,
    },
}

/// Rejected state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {id}: cannot {action} from state {from}")]
pub struct TransitionError {
    pub id: JobId,
    pub from: JobState,
    pub action: &'static str,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Rejected before anything reached the store.
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

impl QueueError {
    /// Lifecycle outcomes the caller should report as "not found / not applicable"
    /// rather than as a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::NotFound(_))
    }
}
