//! Observability: tracing setup and the queue status views.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::domain::JobState;

/// Initialize tracing/logging for the process.
///
/// `RUST_LOG` wins over `default_level`. Logs go to stderr so stdout stays
/// free for command output. Safe to call multiple times (subsequent calls are no-ops).
pub fn init_tracing(json: bool, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Job counts per state, computed from a full scan of job records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    /// Every state is present, zero when no job is in it.
    pub counts: BTreeMap<JobState, usize>,
    pub total: usize,

    /// Records that exist but could not be decoded.
    #[serde(default)]
    pub malformed: usize,
}

impl Default for QueueSummary {
    fn default() -> Self {
        Self {
            counts: JobState::ALL.iter().map(|s| (*s, 0)).collect(),
            total: 0,
            malformed: 0,
        }
    }
}

impl QueueSummary {
    pub fn record(&mut self, state: JobState) {
        *self.counts.entry(state).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn count(&self, state: JobState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

/// Lengths of the queue structures themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub pending: usize,
    pub delayed: usize,
    pub dead: usize,
}
