//! Backoff policy: decides how long a failed job waits before its next attempt.

use std::time::Duration;

/// Exponential backoff for failed jobs.
///
/// `delay(attempts) = base ^ attempts` seconds, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Base of the exponent, in seconds.
    pub base: u32,

    /// Upper bound for a single delay. `None` means uncapped.
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: 2,
            max_delay: None,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before the next attempt.
    ///
    /// # Arguments
    /// * `attempts` - Failed attempts so far, including the one that just happened.
    ///
    /// Example with base=2:
    /// - attempt 1 (first failure): 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    ///
    /// Overflow saturates at `u64::MAX` seconds before the cap applies.
    pub fn delay(&self, attempts: u32) -> Duration {
        let secs = u64::from(self.base).saturating_pow(attempts);
        let delay = Duration::from_secs(secs);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}
