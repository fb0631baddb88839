//! Job record: the unit of work and its retry bookkeeping.
//!
//! The hash stored at `ns:job:<id>` is the single source of truth. Queue
//! structures (pending / delayed / dead) hold the id only.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::decision::{FailureDecision, decide_failure};
use super::errors::{RecordError, TransitionError};
use super::ids::JobId;
use super::state::JobState;
use crate::queue::BackoffPolicy;

/// Hash field names of a stored job.
pub mod fields {
    pub const ID: &str = "id";
    pub const COMMAND: &str = "command";
    pub const STATE: &str = "state";
    pub const ATTEMPTS: &str = "attempts";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const LAST_ERROR: &str = "last_error";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,

    /// Failed execution attempts so far.
    pub attempts: u32,

    /// Attempts threshold after which the job is dead-lettered.
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Reason of the most recent failure (exit code, stderr tail, spawn error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(id: JobId, command: impl Into<String>, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    fn transition_error(&self, action: &'static str) -> TransitionError {
        TransitionError {
            id: self.id.clone(),
            from: self.state,
            action,
        }
    }

    /// Pending -> Processing.
    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.state != JobState::Pending {
            return Err(self.transition_error("begin processing"));
        }
        self.state = JobState::Processing;
        self.updated_at = now;
        Ok(())
    }

    /// Processing -> Completed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.state != JobState::Processing {
            return Err(self.transition_error("complete"));
        }
        self.state = JobState::Completed;
        self.updated_at = now;
        Ok(())
    }

    /// Processing -> Delayed | Dead.
    ///
    /// Increments `attempts` and applies the failure decision. Once the job is
    /// dead, `attempts` no longer changes.
    pub fn fail(
        &mut self,
        reason: Option<String>,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDecision, TransitionError> {
        if self.state != JobState::Processing {
            return Err(self.transition_error("fail"));
        }
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = now;
        self.last_error = reason;

        let decision = decide_failure(self.attempts, self.max_retries, backoff, now);
        self.state = match decision {
            FailureDecision::Retry { .. } => JobState::Delayed,
            FailureDecision::Dead => JobState::Dead,
        };
        Ok(decision)
    }

    /// Dead -> Pending with a fresh retry budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.state != JobState::Dead {
            return Err(self.transition_error("retry"));
        }
        self.state = JobState::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Encode as hash fields for a full-record write.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = vec![
            (fields::ID.to_string(), self.id.to_string()),
            (fields::COMMAND.to_string(), self.command.clone()),
            (fields::STATE.to_string(), self.state.as_str().to_string()),
            (fields::ATTEMPTS.to_string(), self.attempts.to_string()),
            (fields::MAX_RETRIES.to_string(), self.max_retries.to_string()),
            (fields::CREATED_AT.to_string(), format_timestamp(self.created_at)),
            (fields::UPDATED_AT.to_string(), format_timestamp(self.updated_at)),
        ];
        if let Some(err) = &self.last_error {
            out.push((fields::LAST_ERROR.to_string(), err.clone()));
        }
        out
    }

    /// Strict decode of a stored hash. `key` is only used in error messages.
    pub fn from_fields(key: &str, raw: &HashMap<String, String>) -> Result<Self, RecordError> {
        let get = |field: &'static str| {
            raw.get(field).ok_or_else(|| RecordError::MissingField {
                key: key.to_string(),
                field,
            })
        };
        let invalid = |field: &'static str, value: &str| RecordError::InvalidField {
            key: key.to_string(),
            field,
            value: value.to_string(),
        };

        let id = get(fields::ID)?;
        if id.trim().is_empty() {
            return Err(invalid(fields::ID, id));
        }
        let command = get(fields::COMMAND)?;
        let state_raw = get(fields::STATE)?;
        let state = state_raw
            .parse::<JobState>()
            .map_err(|_| invalid(fields::STATE, state_raw))?;
        let attempts_raw = get(fields::ATTEMPTS)?;
        let attempts = attempts_raw
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid(fields::ATTEMPTS, attempts_raw))?;
        let max_raw = get(fields::MAX_RETRIES)?;
        let max_retries = max_raw
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid(fields::MAX_RETRIES, max_raw))?;
        let created_raw = get(fields::CREATED_AT)?;
        let created_at =
            parse_timestamp(created_raw).ok_or_else(|| invalid(fields::CREATED_AT, created_raw))?;
        let updated_raw = get(fields::UPDATED_AT)?;
        let updated_at =
            parse_timestamp(updated_raw).ok_or_else(|| invalid(fields::UPDATED_AT, updated_raw))?;
        let last_error = raw
            .get(fields::LAST_ERROR)
            .filter(|v| !v.is_empty())
            .cloned();

        Ok(Self {
            id: JobId::new(id.clone()),
            command: command.clone(),
            state,
            attempts,
            max_retries,
            created_at,
            updated_at,
            last_error,
        })
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn sample() -> Job {
        Job::new(JobId::from("job-1"), "echo hi", 3, now())
    }

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn new_job_is_pending_with_zero_attempts() {
        let job = sample();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn failure_lifecycle_ends_dead_with_frozen_attempts() {
        let backoff = BackoffPolicy::default();
        let mut job = sample();

        for expected in 1..=2 {
            job.begin_processing(now()).unwrap();
            let decision = job.fail(Some("exit 1".into()), &backoff, now()).unwrap();
            assert!(matches!(decision, FailureDecision::Retry { .. }));
            assert_eq!(job.state, JobState::Delayed);
            assert_eq!(job.attempts, expected);
            // promoted by the scheduler
            job.state = JobState::Pending;
        }

        job.begin_processing(now()).unwrap();
        let decision = job.fail(None, &backoff, now()).unwrap();
        assert_eq!(decision, FailureDecision::Dead);
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);

        let err = job.fail(None, &backoff, now()).unwrap_err();
        assert_eq!(err.from, JobState::Dead);
        assert_eq!(job.attempts, 3);
    }

    #[test]
    fn complete_requires_processing() {
        let mut job = sample();
        assert!(job.complete(now()).is_err());

        job.begin_processing(now()).unwrap();
        let later = now() + ChronoDuration::seconds(5);
        job.complete(later).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.updated_at, later);
    }

    #[test]
    fn reset_for_retry_only_from_dead() {
        let mut job = sample();
        assert!(job.reset_for_retry(now()).is_err());

        job.state = JobState::Dead;
        job.attempts = 3;
        job.last_error = Some("boom".into());
        job.reset_for_retry(now()).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error, None);
    }

    #[test]
    fn fields_decode_back_to_the_same_job() {
        let mut job = sample();
        job.last_error = Some("exit status 2".into());
        let map: HashMap<_, _> = job.to_fields().into_iter().collect();
        let decoded = Job::from_fields("queuectl:job:job-1", &map).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn decodes_records_written_by_older_tooling() {
        let map = raw(&[
            ("id", "5f0c1a2e"),
            ("command", "sleep 1"),
            ("state", "dead"),
            ("attempts", "3"),
            ("max_retries", "3"),
            ("created_at", "2024-05-01T10:00:00.123456Z"),
            ("updated_at", "2024-05-01T10:00:09Z"),
        ]);
        let job = Job::from_fields("k", &map).unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.last_error, None);
    }

    #[test]
    fn rejects_missing_and_malformed_fields() {
        let mut map: HashMap<_, _> = sample().to_fields().into_iter().collect();
        map.remove("command");
        assert_eq!(
            Job::from_fields("k", &map).unwrap_err(),
            RecordError::MissingField {
                key: "k".into(),
                field: "command"
            }
        );

        let mut map: HashMap<_, _> = sample().to_fields().into_iter().collect();
        map.insert("attempts".into(), "-1".into());
        assert!(matches!(
            Job::from_fields("k", &map),
            Err(RecordError::InvalidField { field: "attempts", .. })
        ));

        let mut map: HashMap<_, _> = sample().to_fields().into_iter().collect();
        map.insert("state".into(), "FAILED".into());
        assert!(matches!(
            Job::from_fields("k", &map),
            Err(RecordError::InvalidField { field: "state", .. })
        ));
    }
}
