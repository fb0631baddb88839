//! Queue engine: the job state machine on top of the backing store.
//!
//! Every write that moves a job between queue structures is a single atomic
//! batch, so the record and its queue membership never disagree.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use super::{BackoffPolicy, JobStore, Keyspace};
use crate::domain::{
    FailureDecision, Job, JobId, JobState, QueueError, TransitionError, job::fields,
    job::format_timestamp,
};
use crate::observability::{QueueDepths, QueueSummary};
use crate::ports::{BackingStore, Clock, FieldGuard, IdGenerator, Promotion, StoreOp};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub struct QueueEngine {
    store: Arc<dyn BackingStore>,
    jobs: JobStore,
    keys: Keyspace,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    backoff: BackoffPolicy,
    default_max_retries: u32,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn BackingStore>,
        keys: Keyspace,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            jobs: JobStore::new(store.clone(), keys.clone()),
            store,
            keys,
            clock,
            ids,
            backoff: BackoffPolicy::default(),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub(crate) fn keys(&self) -> &Keyspace {
        &self.keys
    }

    pub(crate) fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate, create and enqueue a new job.
    ///
    /// `max_retries` falls back to the configured default.
    pub async fn submit(
        &self,
        command: &str,
        max_retries: Option<u32>,
    ) -> Result<Job, QueueError> {
        validate_command(command)?;
        let job = Job::new(
            self.ids.generate_job_id(),
            command,
            max_retries.unwrap_or(self.default_max_retries),
            self.clock.now(),
        );
        self.enqueue(&job).await?;
        info!(job_id = %job.id, max_retries = job.max_retries, "job enqueued");
        Ok(job)
    }

    /// Persist a PENDING job and append its id to the pending list, atomically.
    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let ops = self.enqueue_ops(job)?;
        self.store.apply(ops).await?;
        Ok(())
    }

    /// Record write plus pending push for `job`, after the enqueue checks.
    /// Shared by every path that puts a job (back) on the pending list.
    pub(crate) fn enqueue_ops(&self, job: &Job) -> Result<Vec<StoreOp>, QueueError> {
        validate_command(&job.command)?;
        if job.state != JobState::Pending {
            return Err(TransitionError {
                id: job.id.clone(),
                from: job.state,
                action: "enqueue",
            }
            .into());
        }
        Ok(vec![
            self.jobs.put_op(job),
            StoreOp::ListPush {
                key: self.keys.pending(),
                member: job.id.to_string(),
            },
        ])
    }

    /// Pop the next pending id and claim it as PROCESSING.
    ///
    /// The pop is atomic against other fetchers, and the claim only applies
    /// while the record is still PENDING. A popped id with no record, or one
    /// whose record is no longer PENDING, is logged and yields `Ok(None)`.
    pub async fn fetch_next(&self) -> Result<Option<Job>, QueueError> {
        let Some(raw_id) = self.store.list_pop_front(&self.keys.pending()).await? else {
            return Ok(None);
        };
        let id = JobId::new(raw_id);

        let Some(mut job) = self.jobs.get(&id).await? else {
            warn!(job_id = %id, "pending id has no job record; dropping it");
            return Ok(None);
        };
        if let Err(e) = job.begin_processing(self.clock.now()) {
            warn!(job_id = %id, error = %e, "stale pending entry; skipping");
            return Ok(None);
        }

        let claimed = self
            .store
            .apply_if_field(
                FieldGuard {
                    key: self.keys.job(&id),
                    field: fields::STATE.to_string(),
                    expected: JobState::Pending.as_str().to_string(),
                },
                vec![self.jobs.put_op(&job)],
            )
            .await?;
        if !claimed {
            warn!(job_id = %id, "job changed state before it could be claimed; skipping");
            return Ok(None);
        }

        debug!(job_id = %id, "job claimed");
        Ok(Some(job))
    }

    /// PROCESSING -> COMPLETED.
    pub async fn mark_completed(&self, job: &Job) -> Result<Job, QueueError> {
        let mut job = job.clone();
        job.complete(self.clock.now())?;
        self.jobs.put(&job).await?;
        info!(job_id = %job.id, "job completed");
        Ok(job)
    }

    /// PROCESSING -> DELAYED (backoff) or DEAD (retry budget exhausted).
    pub async fn mark_failed(
        &self,
        job: &Job,
        reason: Option<String>,
    ) -> Result<(Job, FailureDecision), QueueError> {
        let mut job = job.clone();
        let decision = job.fail(reason, &self.backoff, self.clock.now())?;

        let placement = match &decision {
            FailureDecision::Retry { run_at, .. } => StoreOp::SortedAdd {
                key: self.keys.delayed(),
                member: job.id.to_string(),
                score: run_at.timestamp(),
            },
            FailureDecision::Dead => StoreOp::ListPush {
                key: self.keys.dead(),
                member: job.id.to_string(),
            },
        };
        self.store
            .apply(vec![self.jobs.put_op(&job), placement])
            .await?;

        match &decision {
            FailureDecision::Retry { delay, run_at } => info!(
                job_id = %job.id,
                attempts = job.attempts,
                delay_secs = delay.as_secs(),
                run_at = %format_timestamp(*run_at),
                "job failed; retry scheduled"
            ),
            FailureDecision::Dead => warn!(
                job_id = %job.id,
                attempts = job.attempts,
                last_error = job.last_error.as_deref().unwrap_or(""),
                "job moved to dead letter queue"
            ),
        }
        Ok((job, decision))
    }

    /// Move every delayed job whose ready-at is not after `now` back to pending.
    ///
    /// Safe to run from any number of processes at once: each id is moved by
    /// exactly one caller.
    pub async fn promote_due(&self) -> Result<Vec<JobId>, QueueError> {
        let now = self.clock.now();
        let promotion = Promotion {
            delayed_key: self.keys.delayed(),
            pending_key: self.keys.pending(),
            record_prefix: self.keys.job_prefix(),
            due_at: now.timestamp(),
            set_fields: vec![
                (
                    fields::STATE.to_string(),
                    JobState::Pending.as_str().to_string(),
                ),
                (fields::UPDATED_AT.to_string(), format_timestamp(now)),
            ],
        };
        let moved = self.store.promote_due(&promotion).await?;
        Ok(moved.into_iter().map(JobId::new).collect())
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.jobs.get(id).await
    }

    pub async fn summary(&self) -> Result<QueueSummary, QueueError> {
        let scan = self.jobs.scan().await?;
        let mut summary = QueueSummary {
            malformed: scan.malformed,
            ..QueueSummary::default()
        };
        for job in &scan.jobs {
            summary.record(job.state);
        }
        Ok(summary)
    }

    /// All jobs, optionally filtered by state, oldest first.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, QueueError> {
        let mut jobs = self.jobs.scan().await?.jobs;
        if let Some(state) = state {
            jobs.retain(|job| job.state == state);
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    pub async fn queue_depths(&self) -> Result<QueueDepths, QueueError> {
        Ok(QueueDepths {
            pending: self.store.list_range(&self.keys.pending()).await?.len(),
            delayed: self
                .store
                .sorted_range_with_scores(&self.keys.delayed())
                .await?
                .len(),
            dead: self.store.list_range(&self.keys.dead()).await?.len(),
        })
    }

    /// Delayed ids with their ready-at time, soonest first.
    pub async fn delayed_jobs(&self) -> Result<Vec<(JobId, DateTime<Utc>)>, QueueError> {
        let entries = self
            .store
            .sorted_range_with_scores(&self.keys.delayed())
            .await?;
        Ok(entries
            .into_iter()
            .map(|(id, score)| {
                let ready_at = Utc
                    .timestamp_opt(score, 0)
                    .single()
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                (JobId::new(id), ready_at)
            })
            .collect())
    }
}

fn validate_command(command: &str) -> Result<(), QueueError> {
    if command.trim().is_empty() {
        return Err(QueueError::Validation("command must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryStore;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<FixedClock>,
        engine: QueueEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let engine = QueueEngine::new(
            store.clone(),
            Keyspace::new("t"),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
        );
        Fixture {
            store,
            clock,
            engine,
        }
    }

    #[tokio::test]
    async fn submit_rejects_blank_commands() {
        let f = fixture();
        let err = f.engine.submit("   ", None).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(f.store.keys_with_prefix("t:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_uses_the_default_retry_budget() {
        let f = fixture();
        let job = f.engine.submit("echo hi", None).await.unwrap();
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.state, JobState::Pending);

        let custom = QueueEngine::new(
            f.store.clone(),
            Keyspace::new("t"),
            f.clock.clone(),
            Arc::new(UlidGenerator::new(f.clock.clone())),
        )
        .with_default_max_retries(7);
        assert_eq!(custom.submit("true", None).await.unwrap().max_retries, 7);
        assert_eq!(custom.submit("true", Some(1)).await.unwrap().max_retries, 1);
    }

    #[tokio::test]
    async fn enqueue_then_fetch_only_changes_state_and_updated_at() {
        let f = fixture();
        let job = f.engine.submit("echo hi", Some(3)).await.unwrap();
        f.clock.advance(ChronoDuration::seconds(1));

        let fetched = f.engine.fetch_next().await.unwrap().unwrap();
        assert_eq!(fetched.state, JobState::Processing);
        assert_eq!(fetched.updated_at, job.updated_at + ChronoDuration::seconds(1));
        assert_eq!(
            Job {
                state: JobState::Pending,
                updated_at: job.updated_at,
                ..fetched.clone()
            },
            job
        );
        assert_eq!(f.engine.get(&job.id).await.unwrap(), Some(fetched));
        assert_eq!(f.engine.fetch_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn fetch_drops_ids_without_records() {
        let f = fixture();
        f.store
            .apply(vec![StoreOp::ListPush {
                key: "t:queue:pending".into(),
                member: "ghost".into(),
            }])
            .await
            .unwrap();

        assert_eq!(f.engine.fetch_next().await.unwrap(), None);
        assert!(f.store.list_range("t:queue:pending").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_skips_stale_entries_for_non_pending_jobs() {
        let f = fixture();
        let job = f.engine.submit("true", None).await.unwrap();
        let claimed = f.engine.fetch_next().await.unwrap().unwrap();
        // duplicate id pushed out of band
        f.store
            .apply(vec![StoreOp::ListPush {
                key: "t:queue:pending".into(),
                member: job.id.to_string(),
            }])
            .await
            .unwrap();

        assert_eq!(f.engine.fetch_next().await.unwrap(), None);
        assert_eq!(f.engine.get(&job.id).await.unwrap(), Some(claimed));
    }

    #[tokio::test]
    async fn fetch_propagates_malformed_records() {
        let f = fixture();
        f.store
            .apply(vec![
                StoreOp::ReplaceHash {
                    key: "t:job:bad".into(),
                    fields: vec![("id".into(), "bad".into())],
                },
                StoreOp::ListPush {
                    key: "t:queue:pending".into(),
                    member: "bad".into(),
                },
            ])
            .await
            .unwrap();

        assert!(matches!(
            f.engine.fetch_next().await,
            Err(QueueError::Record(_))
        ));
    }

    #[tokio::test]
    async fn completed_requires_processing() {
        let f = fixture();
        let job = f.engine.submit("true", None).await.unwrap();
        let err = f.engine.mark_completed(&job).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition(_)));

        let job = f.engine.fetch_next().await.unwrap().unwrap();
        let done = f.engine.mark_completed(&job).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(f.engine.get(&job.id).await.unwrap(), Some(done));
    }

    #[tokio::test]
    async fn failure_with_budget_left_is_delayed_by_backoff() {
        let f = fixture();
        f.engine.submit("false", Some(3)).await.unwrap();
        let job = f.engine.fetch_next().await.unwrap().unwrap();

        let (failed, decision) = f
            .engine
            .mark_failed(&job, Some("exit code 1".into()))
            .await
            .unwrap();
        assert_eq!(failed.state, JobState::Delayed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("exit code 1"));

        let now = f.clock.now();
        assert_eq!(
            decision,
            FailureDecision::Retry {
                delay: Duration::from_secs(2),
                run_at: now + ChronoDuration::seconds(2),
            }
        );
        assert_eq!(
            f.store.sorted_range_with_scores("t:queue:delayed").await.unwrap(),
            vec![(job.id.to_string(), now.timestamp() + 2)]
        );
        assert_eq!(
            f.engine.delayed_jobs().await.unwrap(),
            vec![(job.id.clone(), now + ChronoDuration::seconds(2))]
        );
    }

    #[tokio::test]
    async fn zero_retry_budget_dead_letters_on_first_failure() {
        let f = fixture();
        f.engine.submit("false", Some(0)).await.unwrap();
        let job = f.engine.fetch_next().await.unwrap().unwrap();

        let (dead, decision) = f.engine.mark_failed(&job, None).await.unwrap();
        assert_eq!(decision, FailureDecision::Dead);
        assert_eq!(dead.state, JobState::Dead);
        assert_eq!(dead.attempts, 1);
        assert_eq!(
            f.store.list_range("t:queue:dead").await.unwrap(),
            vec![job.id.to_string()]
        );
    }

    #[tokio::test]
    async fn custom_backoff_base_is_used() {
        let f = fixture();
        let engine = QueueEngine::new(
            f.store.clone(),
            Keyspace::new("t"),
            f.clock.clone(),
            Arc::new(UlidGenerator::new(f.clock.clone())),
        )
        .with_backoff(BackoffPolicy::new(3));
        engine.submit("false", Some(5)).await.unwrap();
        let job = engine.fetch_next().await.unwrap().unwrap();

        let (_, decision) = engine.mark_failed(&job, None).await.unwrap();
        assert!(matches!(
            decision,
            FailureDecision::Retry { delay, .. } if delay == Duration::from_secs(3)
        ));
    }

    #[tokio::test]
    async fn promotion_waits_for_the_ready_time() {
        let f = fixture();
        f.engine.submit("false", Some(3)).await.unwrap();
        let job = f.engine.fetch_next().await.unwrap().unwrap();
        f.engine.mark_failed(&job, None).await.unwrap();

        f.clock.advance(ChronoDuration::seconds(1));
        assert!(f.engine.promote_due().await.unwrap().is_empty());

        f.clock.advance(ChronoDuration::seconds(1));
        assert_eq!(f.engine.promote_due().await.unwrap(), vec![job.id.clone()]);
        let promoted = f.engine.get(&job.id).await.unwrap().unwrap();
        assert_eq!(promoted.state, JobState::Pending);
        assert_eq!(promoted.attempts, 1);
        assert_eq!(promoted.updated_at, f.clock.now());

        // second tick has nothing left to move
        assert!(f.engine.promote_due().await.unwrap().is_empty());
        assert_eq!(
            f.engine.queue_depths().await.unwrap(),
            QueueDepths {
                pending: 1,
                delayed: 0,
                dead: 0
            }
        );
    }

    #[tokio::test]
    async fn summary_and_listing() {
        let f = fixture();
        let first = f.engine.submit("true", None).await.unwrap();
        f.clock.advance(ChronoDuration::seconds(1));
        let second = f.engine.submit("true", None).await.unwrap();
        let claimed = f.engine.fetch_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        f.store
            .apply(vec![StoreOp::ReplaceHash {
                key: "t:job:junk".into(),
                fields: vec![("state".into(), "PENDING".into())],
            }])
            .await
            .unwrap();

        let summary = f.engine.summary().await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.count(JobState::Pending), 1);
        assert_eq!(summary.count(JobState::Processing), 1);

        let all = f.engine.list_jobs(None).await.unwrap();
        assert_eq!(
            all.iter().map(|j| j.id.clone()).collect::<Vec<_>>(),
            vec![first.id.clone(), second.id.clone()]
        );
        let pending = f.engine.list_jobs(Some(JobState::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }
}
