//! Typed access to job records on top of the backing store.

use std::sync::Arc;

use tracing::warn;

use super::Keyspace;
use crate::domain::{Job, JobId, QueueError};
use crate::ports::{BackingStore, StoreOp};

/// Result of a prefix scan: decoded jobs plus how many records were skipped.
#[derive(Debug, Default)]
pub struct JobScan {
    pub jobs: Vec<Job>,
    pub malformed: usize,
}

#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn BackingStore>,
    keys: Keyspace,
}

impl JobStore {
    pub fn new(store: Arc<dyn BackingStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// `Ok(None)` when no record exists. A record that exists but does not
    /// decode is an error.
    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let key = self.keys.job(id);
        let raw = self.store.hash_get_all(&key).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_fields(&key, &raw)?))
    }

    /// Full-record overwrite op for `job`.
    pub fn put_op(&self, job: &Job) -> StoreOp {
        StoreOp::ReplaceHash {
            key: self.keys.job(&job.id),
            fields: job.to_fields(),
        }
    }

    pub async fn put(&self, job: &Job) -> Result<(), QueueError> {
        self.store.apply(vec![self.put_op(job)]).await?;
        Ok(())
    }

    /// Every job record in the namespace, in no particular order.
    ///
    /// Records that fail to decode are logged and counted, not returned.
    /// Records deleted between the scan and the read are silently skipped.
    pub async fn scan(&self) -> Result<JobScan, QueueError> {
        let keys = self.store.keys_with_prefix(&self.keys.job_prefix()).await?;
        let mut scan = JobScan::default();
        for key in keys {
            let raw = self.store.hash_get_all(&key).await?;
            if raw.is_empty() {
                continue;
            }
            match Job::from_fields(&key, &raw) {
                Ok(job) => scan.jobs.push(job),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping malformed job record");
                    scan.malformed += 1;
                }
            }
        }
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn job_store() -> (Arc<MemoryStore>, JobStore) {
        let store = Arc::new(MemoryStore::new());
        let jobs = JobStore::new(store.clone(), Keyspace::new("t"));
        (store, jobs)
    }

    #[tokio::test]
    async fn put_then_get_returns_the_same_job() {
        let (_, jobs) = job_store();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job = Job::new(JobId::from("a"), "echo hi", 3, now);

        jobs.put(&job).await.unwrap();
        assert_eq!(jobs.get(&job.id).await.unwrap(), Some(job));
        assert_eq!(jobs.get(&JobId::from("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_skips_malformed_records() {
        let (store, jobs) = job_store();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        jobs.put(&Job::new(JobId::from("a"), "true", 3, now)).await.unwrap();
        store
            .apply(vec![StoreOp::ReplaceHash {
                key: "t:job:broken".into(),
                fields: vec![("id".into(), "broken".into())],
            }])
            .await
            .unwrap();

        let scan = jobs.scan().await.unwrap();
        assert_eq!(scan.jobs.len(), 1);
        assert_eq!(scan.malformed, 1);
    }

    #[tokio::test]
    async fn get_of_malformed_record_is_an_error() {
        let (store, jobs) = job_store();
        store
            .apply(vec![StoreOp::ReplaceHash {
                key: "t:job:broken".into(),
                fields: vec![("id".into(), "broken".into())],
            }])
            .await
            .unwrap();

        let err = jobs.get(&JobId::from("broken")).await.unwrap_err();
        assert!(matches!(err, QueueError::Record(_)));
    }
}
