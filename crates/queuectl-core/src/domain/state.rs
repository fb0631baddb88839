//! Job state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job state.
///
/// State transitions:
/// - (none) -> Pending
/// - Pending -> Processing (only when dequeued from the pending list)
/// - Processing -> Completed
/// - Processing -> Delayed (failure, retry budget left)
/// - Processing -> Dead (failure, retry budget exhausted)
/// - Delayed -> Pending (promoted by the retry scheduler)
/// - Dead -> Pending (DLQ retry, attempts reset)
///
/// The wire form is upper-case everywhere (`PENDING`, `DEAD`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting in the pending list.
    Pending,

    /// Claimed by exactly one worker.
    Processing,

    /// Waiting in the delayed set for its backoff to elapse.
    Delayed,

    /// Finished successfully.
    Completed,

    /// Retry budget exhausted; parked in the dead list.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Delayed,
        JobState::Completed,
        JobState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Processing => "PROCESSING",
            JobState::Delayed => "DELAYED",
            JobState::Completed => "COMPLETED",
            JobState::Dead => "DEAD",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0:?} (expected one of PENDING, PROCESSING, DELAYED, COMPLETED, DEAD)")]
pub struct UnknownState(pub String);

impl FromStr for JobState {
    type Err = UnknownState;

    /// Case-insensitive, so lower-case values written by older tooling decode too.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}
