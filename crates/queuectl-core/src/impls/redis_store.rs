//! RedisStore - 本番用の BackingStore
//!
//! # 実装詳細
//! - `ConnectionManager` を共有し、呼び出しごとに clone して使う（自動再接続）
//! - `apply` は MULTI/EXEC パイプライン
//! - `apply_if_field` / `promote_due` は Lua スクリプトでサーバー側アトミックに実行

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use tracing::{debug, info};

use crate::domain::StoreError;
use crate::ports::{BackingStore, FieldGuard, Promotion, StoreOp};

/// ARGV: field, expected, then for each command: arg count followed by the args.
const APPLY_IF_FIELD_LUA: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
    return 0
end
local i = 3
while i <= #ARGV do
    local n = tonumber(ARGV[i])
    redis.call(unpack(ARGV, i + 1, i + n))
    i = i + n + 1
end
return 1
"#;

/// KEYS: delayed, pending. ARGV: due_at, record_prefix, then field/value pairs.
const PROMOTE_DUE_LUA: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = {}
for _, id in ipairs(due) do
    if redis.call('ZREM', KEYS[1], id) == 1 then
        local key = ARGV[2] .. id
        if redis.call('EXISTS', key) == 1 then
            if #ARGV > 2 then
                redis.call('HSET', key, unpack(ARGV, 3, #ARGV))
            end
            redis.call('RPUSH', KEYS[2], id)
            table.insert(moved, id)
        end
    end
end
return moved
"#;

const SCAN_BATCH: usize = 200;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    apply_if_field_script: Script,
    promote_due_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        info!(redis_url, "connecting to redis");

        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Connection(format!("invalid redis url {redis_url}: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(format!("failed to connect to {redis_url}: {e}")))?;

        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            apply_if_field_script: Script::new(APPLY_IF_FIELD_LUA),
            promote_due_script: Script::new(PROMOTE_DUE_LUA),
        }
    }

    fn pipeline(ops: &[StoreOp]) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            for command in op.commands() {
                if let Some((name, args)) = command.split_first() {
                    pipe.cmd(name).arg(args).ignore();
                }
            }
        }
        pipe
    }
}

fn store_error(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout()
    {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

/// ARGV of `APPLY_IF_FIELD_LUA`.
fn guarded_args(guard: &FieldGuard, ops: &[StoreOp]) -> Vec<String> {
    let mut args = vec![guard.field.clone(), guard.expected.clone()];
    for op in ops {
        for command in op.commands() {
            args.push(command.len().to_string());
            args.extend(command);
        }
    }
    args
}

/// ARGV of `PROMOTE_DUE_LUA`.
fn promotion_args(promotion: &Promotion) -> Vec<String> {
    let mut args = vec![
        promotion.due_at.to_string(),
        promotion.record_prefix.clone(),
    ];
    for (field, value) in &promotion.set_fields {
        args.push(field.clone());
        args.push(value.clone());
    }
    args
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN MATCH.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(store_error)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.lpop(key, None).await.map_err(store_error)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.lrange(key, 0, -1).await.map_err(store_error)
    }

    async fn sorted_range_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(key, 0, -1)
            .await
            .map_err(store_error)?;
        Ok(entries
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(store_error)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(store_error)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        Self::pipeline(&ops)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn apply_if_field(
        &self,
        guard: FieldGuard,
        ops: Vec<StoreOp>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.apply_if_field_script.key(&guard.key);
        invocation.arg(guarded_args(&guard, &ops));
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        debug!(key = %guard.key, applied, "guarded batch");
        Ok(applied == 1)
    }

    async fn promote_due(&self, promotion: &Promotion) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.promote_due_script.key(&promotion.delayed_key);
        invocation
            .key(&promotion.pending_key)
            .arg(promotion_args(promotion));
        invocation.invoke_async(&mut conn).await.map_err(store_error)
    }
}
