//! RetryScheduler - delayed ジョブの昇格ループ
//!
//! # フロー
//! 1. 一定間隔（既定 2 秒）で tick
//! 2. QueueEngine::promote_due() で ready-at を過ぎた delayed ジョブを pending へ
//!
//! 昇格はストア側でアトミックなので、複数プロセスで同時に動かしてもよい。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::worker_loop::wait_for_shutdown;
use crate::domain::{JobId, QueueError};
use crate::queue::QueueEngine;

pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(2);

pub struct RetryScheduler {
    engine: Arc<QueueEngine>,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(engine: Arc<QueueEngine>) -> Self {
        Self {
            engine,
            interval: DEFAULT_SCHEDULER_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One promotion pass.
    pub async fn tick(&self) -> Result<Vec<JobId>, QueueError> {
        let promoted = self.engine.promote_due().await?;
        if promoted.is_empty() {
            debug!("no delayed jobs due");
        } else {
            info!(count = promoted.len(), "promoted delayed jobs to pending");
        }
        Ok(promoted)
    }

    /// Tick until `shutdown` flips to `true`. Store errors are logged and the
    /// next tick tries again.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "retry scheduler tick failed");
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        debug!("retry scheduler stopped");
    }
}
