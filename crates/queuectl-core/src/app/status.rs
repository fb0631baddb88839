//! Status - ステータスクエリ
//!
//! ジョブの状態別件数・キュー長・登録ワーカーをまとめて返します。
//! CLI の `status` と HTTP API の `/api/status` が同じものを使います。

use serde::Serialize;

use crate::domain::{QueueError, WorkerRecord};
use crate::observability::{QueueDepths, QueueSummary};
use crate::queue::{QueueEngine, WorkerRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub summary: QueueSummary,
    pub depths: QueueDepths,
    pub worker_count: usize,
    pub workers: Vec<WorkerRecord>,
}

impl StatusReport {
    pub async fn collect(
        engine: &QueueEngine,
        registry: &WorkerRegistry,
    ) -> Result<Self, QueueError> {
        let summary = engine.summary().await?;
        let depths = engine.queue_depths().await?;
        let workers = registry.list().await?;
        Ok(Self {
            summary,
            depths,
            worker_count: workers.len(),
            workers,
        })
    }
}
