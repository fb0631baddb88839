//! WorkerLoop - ジョブ実行ループ
//!
//! # フロー
//! 1. 自分の stop flag を確認（確認に失敗したら「停止していない」扱い）
//! 2. QueueEngine::fetch_next() で 1 件 claim
//! 3. CommandExecutor で実行 → Outcome
//! 4. 成功なら mark_completed、それ以外は mark_failed
//!
//! どの段階のエラーもログに残してループを続けます。ループを抜けるのは
//! stop flag か shutdown シグナルを受け取ったときだけです。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::{Job, Outcome, WorkerRecord};
use crate::ports::CommandExecutor;
use crate::queue::{QueueEngine, WorkerRegistry};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Reason recorded on a job that was running when shutdown arrived.
pub const INTERRUPTED_REASON: &str = "interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopFlag,
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub exit_reason: Option<ExitReason>,
}

pub struct WorkerLoop {
    record: WorkerRecord,
    engine: Arc<QueueEngine>,
    registry: WorkerRegistry,
    executor: Arc<dyn CommandExecutor>,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl WorkerLoop {
    pub fn new(
        record: WorkerRecord,
        engine: Arc<QueueEngine>,
        registry: WorkerRegistry,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            record,
            engine,
            registry,
            executor,
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Run until the stop flag is set or `shutdown` flips to `true`.
    ///
    /// Dropping the sender side of `shutdown` does not stop the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let worker_id = self.record.worker_id;
        let mut stats = WorkerStats::default();

        match self.registry.register(&self.record).await {
            Ok(()) => info!(%worker_id, pid = self.record.pid, "worker registered"),
            Err(e) => error!(%worker_id, error = %e, "failed to register worker; continuing"),
        }

        let reason = loop {
            if *shutdown.borrow() {
                break ExitReason::Shutdown;
            }

            match self.registry.stop_requested(worker_id).await {
                Ok(true) => break ExitReason::StopFlag,
                Ok(false) => {}
                Err(e) => warn!(%worker_id, error = %e, "could not check stop flag"),
            }

            // fetch_next is not raced with shutdown: an id popped but not yet
            // claimed would be lost.
            let job = match self.engine.fetch_next().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if pause(self.poll_interval, &mut shutdown).await {
                        break ExitReason::Shutdown;
                    }
                    continue;
                }
                Err(e) => {
                    error!(%worker_id, error = %e, "fetch failed");
                    if pause(self.error_backoff, &mut shutdown).await {
                        break ExitReason::Shutdown;
                    }
                    continue;
                }
            };

            stats.processed += 1;
            info!(%worker_id, job_id = %job.id, command = %job.command, "executing job");

            let executor = Arc::clone(&self.executor);
            let command = job.command.clone();
            let mut task = tokio::spawn(async move { executor.execute(&command).await });

            let result = tokio::select! {
                joined = &mut task => Some(joined),
                _ = wait_for_shutdown(&mut shutdown) => {
                    task.abort();
                    None
                }
            };

            let outcome = match result {
                None => {
                    warn!(%worker_id, job_id = %job.id, "shutdown while job was running");
                    self.report_failed(&job, INTERRUPTED_REASON.to_string()).await;
                    stats.failed += 1;
                    break ExitReason::Shutdown;
                }
                Some(Ok(Ok(outcome))) => outcome,
                Some(Ok(Err(e))) => Outcome::failure(e.to_string()),
                Some(Err(join_err)) => Outcome::failure(format!("executor crashed: {join_err}")),
            };

            if outcome.is_success() {
                stats.completed += 1;
                self.report_completed(&job).await;
            } else {
                stats.failed += 1;
                let reason = outcome
                    .failure_summary()
                    .unwrap_or_else(|| "failed".to_string());
                self.report_failed(&job, reason).await;
            }
        };

        stats.exit_reason = Some(reason);
        info!(%worker_id, ?reason, processed = stats.processed, "worker stopping");

        if let Err(e) = self.registry.unregister(worker_id).await {
            error!(%worker_id, error = %e, "failed to unregister worker");
        }
        stats
    }

    async fn report_completed(&self, job: &Job) {
        if let Err(e) = self.engine.mark_completed(job).await {
            error!(
                worker_id = %self.record.worker_id,
                job_id = %job.id,
                error = %e,
                "failed to record completion"
            );
        }
    }

    async fn report_failed(&self, job: &Job, reason: String) {
        debug!(job_id = %job.id, reason = %reason, "job failed");
        if let Err(e) = self.engine.mark_failed(job, Some(reason)).await {
            error!(
                worker_id = %self.record.worker_id,
                job_id = %job.id,
                error = %e,
                "failed to record failure"
            );
        }
    }
}

/// Resolves once `true` is observed; never resolves if the sender is gone.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Sleep for `duration`. Returns `true` if shutdown arrived first.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = wait_for_shutdown(shutdown) => true,
    }
}
