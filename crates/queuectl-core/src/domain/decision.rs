//! Decision model: what happens to a job after a failed attempt.
//!
//! The decision is a pure function of the attempt count, the retry budget and
//! the backoff policy. Applying it (writing the record, scheduling the retry,
//! dead-lettering) is the queue engine's job.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::queue::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Park in the delayed set until `run_at`.
    Retry {
        delay: Duration,
        run_at: DateTime<Utc>,
    },

    /// Retry budget exhausted.
    Dead,
}

/// Decide the next step for a job that has just failed.
///
/// # Arguments
/// * `attempts` - failed attempts including the one that just happened.
/// * `max_retries` - attempts threshold; reaching it dead-letters the job.
pub fn decide_failure(
    attempts: u32,
    max_retries: u32,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) -> FailureDecision {
    if attempts >= max_retries {
        return FailureDecision::Dead;
    }
    let delay = backoff.delay(attempts);
    let run_at = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    FailureDecision::Retry { delay, run_at }
}
