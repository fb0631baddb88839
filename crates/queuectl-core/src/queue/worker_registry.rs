//! Worker registry: worker records, the active set and stop flags.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::Keyspace;
use crate::domain::{StoreError, WorkerId, WorkerRecord};
use crate::ports::{BackingStore, StoreOp};

/// How long a stop request stays valid if nobody acknowledges it.
pub const STOP_FLAG_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn BackingStore>,
    keys: Keyspace,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn BackingStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Write the record and add the id to the active set.
    ///
    /// An existing stop flag is kept: a stop requested while the worker
    /// process was still starting must reach it.
    pub async fn register(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        let id = record.worker_id;
        self.store
            .apply(vec![
                StoreOp::ReplaceHash {
                    key: self.keys.worker(id),
                    fields: record.to_fields(),
                },
                StoreOp::SetAdd {
                    key: self.keys.active_workers(),
                    member: id.to_string(),
                },
            ])
            .await
    }

    /// Drop a stop flag left behind by an earlier worker with this id.
    pub async fn clear_stop(&self, id: WorkerId) -> Result<(), StoreError> {
        self.store
            .apply(vec![StoreOp::Delete {
                key: self.keys.stop_flag(id),
            }])
            .await
    }

    /// Remove the record, the active-set entry and any pending stop flag.
    pub async fn unregister(&self, id: WorkerId) -> Result<(), StoreError> {
        self.store
            .apply(vec![
                StoreOp::Delete {
                    key: self.keys.worker(id),
                },
                StoreOp::SetRemove {
                    key: self.keys.active_workers(),
                    member: id.to_string(),
                },
                StoreOp::Delete {
                    key: self.keys.stop_flag(id),
                },
            ])
            .await
    }

    pub async fn get(&self, id: WorkerId) -> Result<Option<WorkerRecord>, StoreError> {
        let key = self.keys.worker(id);
        let raw = self.store.hash_get_all(&key).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        match WorkerRecord::from_fields(&key, &raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(key = %key, error = %e, "skipping malformed worker record");
                Ok(None)
            }
        }
    }

    /// Ids in the active set, ascending. Unparseable members are skipped.
    pub async fn ids(&self) -> Result<Vec<WorkerId>, StoreError> {
        let members = self.store.set_members(&self.keys.active_workers()).await?;
        let mut ids: Vec<WorkerId> = members
            .iter()
            .filter_map(|m| match m.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(member = %m, "ignoring invalid worker id in active set");
                    None
                }
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Registry snapshot ordered by worker id.
    pub async fn list(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let mut out = Vec::new();
        for id in self.ids().await? {
            if let Some(record) = self.get(id).await? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// `max(registered) + 1`, or 1 for an empty registry.
    pub async fn next_id(&self) -> Result<WorkerId, StoreError> {
        Ok(self
            .ids()
            .await?
            .into_iter()
            .max()
            .map(WorkerId::next)
            .unwrap_or(WorkerId::new(1)))
    }

    pub async fn request_stop(&self, id: WorkerId) -> Result<(), StoreError> {
        self.store
            .apply(vec![StoreOp::SetWithExpiry {
                key: self.keys.stop_flag(id),
                value: "1".to_string(),
                ttl: STOP_FLAG_TTL,
            }])
            .await
    }

    pub async fn stop_requested(&self, id: WorkerId) -> Result<bool, StoreError> {
        self.store.exists(&self.keys.stop_flag(id)).await
    }
}
