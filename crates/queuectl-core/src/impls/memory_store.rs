//! MemoryStore - 開発用・テスト用の BackingStore
//!
//! # 実装詳細
//! - 1 つの Mutex の中にハッシュ・リスト・ソート済みセット・セット・文字列を保持
//! - `apply` / `apply_if_field` / `promote_due` はロック 1 回で完結するので
//!   Redis の MULTI/EXEC や Lua スクリプトと同じくアトミック
//! - `set_unavailable(true)` で全操作を接続エラーにできる（障害テスト用）

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;

use crate::domain::StoreError;
use crate::ports::{BackingStore, FieldGuard, Promotion, StoreOp};

#[derive(Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    /// member -> score
    sorted: HashMap<String, BTreeMap<String, i64>>,
    sets: HashMap<String, BTreeSet<String>>,
    strings: HashMap<String, (String, Option<Instant>)>,
}

impl MemoryState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings
            .retain(|_, (_, expires)| expires.is_none_or(|at| at > now));
    }

    fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.hashes
            .keys()
            .chain(self.lists.keys())
            .chain(self.sorted.keys())
            .chain(self.sets.keys())
            .chain(self.strings.keys())
    }

    fn exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
            || self.lists.contains_key(key)
            || self.sorted.contains_key(key)
            || self.sets.contains_key(key)
            || self.strings.contains_key(key)
    }

    fn delete(&mut self, key: &str) {
        self.hashes.remove(key);
        self.lists.remove(key);
        self.sorted.remove(key);
        self.sets.remove(key);
        self.strings.remove(key);
    }

    fn hset(&mut self, key: &str, fields: &[(String, String)]) {
        if fields.is_empty() {
            return;
        }
        let hash = self.hashes.entry(key.to_string()).or_default();
        for (f, v) in fields {
            hash.insert(f.clone(), v.clone());
        }
    }

    fn apply_op(&mut self, op: &StoreOp) {
        match op {
            StoreOp::ReplaceHash { key, fields } => {
                self.delete(key);
                self.hset(key, fields);
            }
            StoreOp::Delete { key } => self.delete(key),
            StoreOp::ListPush { key, member } => {
                self.lists
                    .entry(key.clone())
                    .or_default()
                    .push_back(member.clone());
            }
            StoreOp::ListRemove { key, member } => {
                if let Some(list) = self.lists.get_mut(key) {
                    list.retain(|m| m != member);
                    if list.is_empty() {
                        self.lists.remove(key);
                    }
                }
            }
            StoreOp::SortedAdd { key, member, score } => {
                self.sorted
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            StoreOp::SortedRemove { key, member } => {
                if let Some(zset) = self.sorted.get_mut(key) {
                    zset.remove(member);
                    if zset.is_empty() {
                        self.sorted.remove(key);
                    }
                }
            }
            StoreOp::SetAdd { key, member } => {
                self.sets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone());
            }
            StoreOp::SetRemove { key, member } => {
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(member);
                    if set.is_empty() {
                        self.sets.remove(key);
                    }
                }
            }
            StoreOp::SetWithExpiry { key, value, ttl } => {
                self.strings
                    .insert(key.clone(), (value.clone(), Some(Instant::now() + *ttl)));
            }
        }
    }
}

/// MemoryStore は単一プロセス内で完結する BackingStore
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a connection error (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store marked unavailable".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Command("memory store lock poisoned".into()))?;
        state.purge_expired();
        Ok(f(&mut state))
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_state(|s| s.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.with_state(|s| {
            let keys: BTreeSet<String> = s
                .all_keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.into_iter().collect()
        })
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_state(|s| {
            let list = s.lists.get_mut(key)?;
            let popped = list.pop_front();
            if list.is_empty() {
                s.lists.remove(key);
            }
            popped
        })
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_state(|s| {
            s.lists
                .get(key)
                .map(|l| l.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn sorted_range_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        self.with_state(|s| {
            let mut entries: Vec<(String, i64)> = s
                .sorted
                .get(key)
                .map(|z| z.iter().map(|(m, score)| (m.clone(), *score)).collect())
                .unwrap_or_default();
            entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            entries
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_state(|s| {
            s.sets
                .get(key)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.with_state(|s| s.exists(key))
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        self.with_state(|s| {
            for op in &ops {
                s.apply_op(op);
            }
        })
    }

    async fn apply_if_field(
        &self,
        guard: FieldGuard,
        ops: Vec<StoreOp>,
    ) -> Result<bool, StoreError> {
        self.with_state(|s| {
            let current = s.hashes.get(&guard.key).and_then(|h| h.get(&guard.field));
            if current != Some(&guard.expected) {
                return false;
            }
            for op in &ops {
                s.apply_op(op);
            }
            true
        })
    }

    async fn promote_due(&self, promotion: &Promotion) -> Result<Vec<String>, StoreError> {
        self.with_state(|s| {
            let Some(zset) = s.sorted.get_mut(&promotion.delayed_key) else {
                return Vec::new();
            };
            let mut due: Vec<(String, i64)> = zset
                .iter()
                .filter(|(_, score)| **score <= promotion.due_at)
                .map(|(m, score)| (m.clone(), *score))
                .collect();
            due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            for (member, _) in &due {
                zset.remove(member);
            }
            if zset.is_empty() {
                s.sorted.remove(&promotion.delayed_key);
            }

            let mut moved = Vec::with_capacity(due.len());
            for (member, _) in due {
                let record_key = format!("{}{}", promotion.record_prefix, member);
                if !s.hashes.contains_key(&record_key) {
                    continue;
                }
                s.hset(&record_key, &promotion.set_fields);
                s.lists
                    .entry(promotion.pending_key.clone())
                    .or_default()
                    .push_back(member.clone());
                moved.push(member);
            }
            moved
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn push(key: &str, member: &str) -> StoreOp {
        StoreOp::ListPush {
            key: key.into(),
            member: member.into(),
        }
    }

    #[tokio::test]
    async fn lists_are_fifo() {
        let store = MemoryStore::new();
        store
            .apply(vec![push("q", "a"), push("q", "b")])
            .await
            .unwrap();

        assert_eq!(store.list_pop_front("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.list_pop_front("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.list_pop_front("q").await.unwrap(), None);
        assert!(!store.exists("q").await.unwrap());
    }

    #[tokio::test]
    async fn replace_hash_drops_stale_fields() {
        let store = MemoryStore::new();
        store
            .apply(vec![StoreOp::ReplaceHash {
                key: "h".into(),
                fields: vec![("a".into(), "1".into()), ("b".into(), "2".into())],
            }])
            .await
            .unwrap();
        store
            .apply(vec![StoreOp::ReplaceHash {
                key: "h".into(),
                fields: vec![("a".into(), "3".into())],
            }])
            .await
            .unwrap();

        let hash = store.hash_get_all("h").await.unwrap();
        assert_eq!(hash.len(), 1);
        assert_eq!(hash.get("a").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn guarded_apply_runs_only_when_field_matches() {
        let store = MemoryStore::new();
        store
            .apply(vec![StoreOp::ReplaceHash {
                key: "h".into(),
                fields: vec![("state".into(), "DEAD".into())],
            }])
            .await
            .unwrap();

        let guard = |expected: &str| FieldGuard {
            key: "h".into(),
            field: "state".into(),
            expected: expected.into(),
        };

        assert!(!store.apply_if_field(guard("PENDING"), vec![push("q", "x")]).await.unwrap());
        assert!(store.list_range("q").await.unwrap().is_empty());

        assert!(store.apply_if_field(guard("DEAD"), vec![push("q", "x")]).await.unwrap());
        assert_eq!(store.list_range("q").await.unwrap(), vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn promotion_moves_only_due_members_with_records() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                StoreOp::ReplaceHash {
                    key: "job:a".into(),
                    fields: vec![("state".into(), "DELAYED".into())],
                },
                StoreOp::ReplaceHash {
                    key: "job:c".into(),
                    fields: vec![("state".into(), "DELAYED".into())],
                },
                StoreOp::SortedAdd {
                    key: "delayed".into(),
                    member: "a".into(),
                    score: 10,
                },
                StoreOp::SortedAdd {
                    key: "delayed".into(),
                    member: "b".into(),
                    score: 5,
                },
                StoreOp::SortedAdd {
                    key: "delayed".into(),
                    member: "c".into(),
                    score: 100,
                },
            ])
            .await
            .unwrap();

        let promotion = Promotion {
            delayed_key: "delayed".into(),
            pending_key: "pending".into(),
            record_prefix: "job:".into(),
            due_at: 10,
            set_fields: vec![("state".into(), "PENDING".into())],
        };
        let moved = store.promote_due(&promotion).await.unwrap();

        // "b" has no record: dropped from the set but not pushed.
        assert_eq!(moved, vec!["a".to_string()]);
        assert_eq!(store.list_range("pending").await.unwrap(), vec!["a".to_string()]);
        assert_eq!(
            store.sorted_range_with_scores("delayed").await.unwrap(),
            vec![("c".to_string(), 100)]
        );
        assert_eq!(
            store.hash_get_all("job:a").await.unwrap().get("state").map(String::as_str),
            Some("PENDING")
        );
    }

    #[tokio::test]
    async fn expiring_values_vanish() {
        let store = MemoryStore::new();
        store
            .apply(vec![StoreOp::SetWithExpiry {
                key: "flag".into(),
                value: "1".into(),
                ttl: Duration::from_millis(20),
            }])
            .await
            .unwrap();
        assert!(store.exists("flag").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("flag").await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_reports_connection_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.list_pop_front("q").await,
            Err(StoreError::Connection(_))
        ));
        store.set_unavailable(false);
        assert!(store.list_pop_front("q").await.unwrap().is_none());
    }
}
