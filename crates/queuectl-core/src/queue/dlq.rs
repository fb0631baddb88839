//! Dead letter queue: inspection and re-submission of dead jobs.

use std::sync::Arc;

use tracing::info;

use super::QueueEngine;
use crate::domain::{Job, JobId, JobState, QueueError, TransitionError, job::fields};
use crate::ports::{FieldGuard, StoreOp};

pub struct DeadLetterQueue {
    engine: Arc<QueueEngine>,
}

impl DeadLetterQueue {
    pub fn new(engine: Arc<QueueEngine>) -> Self {
        Self { engine }
    }

    /// Every job whose record is DEAD, oldest first.
    pub async fn list(&self) -> Result<Vec<Job>, QueueError> {
        self.engine.list_jobs(Some(JobState::Dead)).await
    }

    /// DEAD -> PENDING with `attempts` reset to 0.
    ///
    /// Removing the id from the dead list, rewriting the record and appending
    /// the id to pending happen in one step guarded on `state == DEAD`, so two
    /// concurrent retries of the same id re-enqueue it once.
    pub async fn retry(&self, id: &JobId) -> Result<Job, QueueError> {
        let Some(mut job) = self.engine.get(id).await? else {
            return Err(QueueError::NotFound(id.clone()));
        };
        job.reset_for_retry(self.engine.now())?;

        let keys = self.engine.keys();
        let mut ops = vec![StoreOp::ListRemove {
            key: keys.dead(),
            member: id.to_string(),
        }];
        ops.extend(self.engine.enqueue_ops(&job)?);
        let applied = self
            .engine
            .store()
            .apply_if_field(
                FieldGuard {
                    key: keys.job(id),
                    field: fields::STATE.to_string(),
                    expected: JobState::Dead.as_str().to_string(),
                },
                ops,
            )
            .await?;

        if !applied {
            // raced with another retry; report what the record looks like now
            return match self.engine.get(id).await? {
                Some(current) => Err(TransitionError {
                    id: id.clone(),
                    from: current.state,
                    action: "retry",
                }
                .into()),
                None => Err(QueueError::NotFound(id.clone())),
            };
        }

        info!(job_id = %id, "dead job re-enqueued");
        Ok(job)
    }
}
