//! BackingStore port - 共有データストアの抽象化
//!
//! ハッシュ・リスト・ソート済みセット・セット・TTL 付きフラグを提供する
//! 外部ストア（本番は Redis）への境界です。
//!
//! # 設計原則
//! - 競合が起きうる構造変更（dequeue / delayed の昇格 / DLQ 再投入）は
//!   ストア側のアトミック操作で行う。呼び出し側で read-modify-write しない
//! - 書き込みは `StoreOp` のバッチとしてまとめ、`apply` でアトミックに適用する
//! - ストアクライアントは明示的に注入する（グローバルなシングルトンは持たない）

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::StoreError;

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Delete the hash and write every field: a true full-record overwrite.
    ReplaceHash {
        key: String,
        fields: Vec<(String, String)>,
    },
    Delete {
        key: String,
    },
    /// RPUSH.
    ListPush {
        key: String,
        member: String,
    },
    /// LREM of every occurrence.
    ListRemove {
        key: String,
        member: String,
    },
    SortedAdd {
        key: String,
        member: String,
        score: i64,
    },
    SortedRemove {
        key: String,
        member: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    /// String value that disappears after `ttl`.
    SetWithExpiry {
        key: String,
        value: String,
        ttl: Duration,
    },
}

impl StoreOp {
    /// The store commands this op expands to, as plain argument vectors.
    ///
    /// Shared by the pipeline path and the compare-and-apply script so both
    /// execute exactly the same writes.
    pub fn commands(&self) -> Vec<Vec<String>> {
        match self {
            StoreOp::ReplaceHash { key, fields } => {
                let mut hset = Vec::with_capacity(2 + fields.len() * 2);
                hset.push("HSET".to_string());
                hset.push(key.clone());
                for (f, v) in fields {
                    hset.push(f.clone());
                    hset.push(v.clone());
                }
                let mut out = vec![vec!["DEL".to_string(), key.clone()]];
                if !fields.is_empty() {
                    out.push(hset);
                }
                out
            }
            StoreOp::Delete { key } => vec![vec!["DEL".into(), key.clone()]],
            StoreOp::ListPush { key, member } => {
                vec![vec!["RPUSH".into(), key.clone(), member.clone()]]
            }
            StoreOp::ListRemove { key, member } => {
                vec![vec!["LREM".into(), key.clone(), "0".into(), member.clone()]]
            }
            StoreOp::SortedAdd { key, member, score } => vec![vec![
                "ZADD".into(),
                key.clone(),
                score.to_string(),
                member.clone(),
            ]],
            StoreOp::SortedRemove { key, member } => {
                vec![vec!["ZREM".into(), key.clone(), member.clone()]]
            }
            StoreOp::SetAdd { key, member } => {
                vec![vec!["SADD".into(), key.clone(), member.clone()]]
            }
            StoreOp::SetRemove { key, member } => {
                vec![vec!["SREM".into(), key.clone(), member.clone()]]
            }
            StoreOp::SetWithExpiry { key, value, ttl } => vec![vec![
                "SET".into(),
                key.clone(),
                value.clone(),
                "EX".into(),
                ttl.as_secs().max(1).to_string(),
            ]],
        }
    }
}

/// Precondition of a compare-and-apply batch: `HGET key field == expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGuard {
    pub key: String,
    pub field: String,
    pub expected: String,
}

/// Atomic delayed-to-pending move, executed by the store in one step.
///
/// For every member of `delayed_key` with score <= `due_at`: remove it, and
/// only if this call removed it and `record_prefix + member` exists, write
/// `set_fields` into that record and RPUSH the member onto `pending_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub delayed_key: String,
    pub pending_key: String,
    pub record_prefix: String,
    pub due_at: i64,
    pub set_fields: Vec<(String, String)>,
}

#[async_trait]
pub trait BackingStore: Send + Sync {
    /// HGETALL. Missing key yields an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// All keys starting with `prefix`. Snapshot at call time, unordered.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// LPOP. Atomic against every other popper: each member is returned once.
    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Members ordered by score ascending.
    async fn sorted_range_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Apply every op or none of them.
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;

    /// Apply `ops` atomically only if the guard holds. Returns whether they ran.
    async fn apply_if_field(&self, guard: FieldGuard, ops: Vec<StoreOp>)
    -> Result<bool, StoreError>;

    /// Returns the members this call moved.
    async fn promote_due(&self, promotion: &Promotion) -> Result<Vec<String>, StoreError>;
}
