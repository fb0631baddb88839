//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - ストアクライアントは明示的に注入（グローバルなシングルトンを持たない）

use std::sync::Arc;

use crate::app::{RetryScheduler, StatusReport, StopTimings, WorkerLoop, WorkerManager};
use crate::config::QueueConfig;
use crate::domain::{QueueError, StoreError, WorkerId, WorkerRecord};
use crate::impls::ShellExecutor;
use crate::ports::{
    BackingStore, Clock, CommandExecutor, IdGenerator, ProcessLauncher, SystemClock, UlidGenerator,
};
use crate::queue::{DeadLetterQueue, Keyspace, QueueEngine, WorkerRegistry};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(config)
///     .connect_redis()
///     .await?
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - build() 時に設定値とストアの有無をチェック
/// - 不足や不正があれば BuildError を返す
pub struct AppBuilder {
    config: QueueConfig,
    store: Option<Arc<dyn BackingStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no backing store configured")]
    MissingStore,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            ids: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Connect to the configured Redis and use it as the store.
    #[cfg(feature = "redis")]
    pub async fn connect_redis(self) -> Result<Self, StoreError> {
        let store = crate::impls::RedisStore::connect(&self.config.redis_url).await?;
        Ok(self.store(Arc::new(store)))
    }

    /// # 検証
    /// - ストアが設定されているか
    /// - namespace が空でないか、backoff_base と各間隔が 0 でないか
    pub fn build(self) -> Result<App, BuildError> {
        let store = self.store.ok_or(BuildError::MissingStore)?;
        validate(&self.config)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let keys = Keyspace::new(self.config.namespace.clone());

        let engine = Arc::new(
            QueueEngine::new(store.clone(), keys.clone(), clock.clone(), ids)
                .with_backoff(self.config.backoff())
                .with_default_max_retries(self.config.max_retries),
        );
        let dlq = DeadLetterQueue::new(engine.clone());
        let registry = WorkerRegistry::new(store, keys);

        Ok(App {
            config: self.config,
            clock,
            engine,
            dlq,
            registry,
        })
    }
}

fn validate(config: &QueueConfig) -> Result<(), BuildError> {
    let mut problems = Vec::new();
    if config.namespace.trim().is_empty() {
        problems.push("namespace must not be empty");
    }
    if config.backoff_base == 0 {
        problems.push("backoff_base must be at least 1");
    }
    if config.poll_interval_ms == 0 {
        problems.push("poll_interval_ms must be greater than zero");
    }
    if config.scheduler_interval_ms == 0 {
        problems.push("scheduler_interval_ms must be greater than zero");
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(BuildError::InvalidConfig(problems.join("; ")))
    }
}

/// App はアプリケーションのランタイム
///
/// エンジン・DLQ・ワーカーレジストリを 1 つのストアの上に束ね、
/// ワーカーループ・スケジューラ・マネージャを設定どおりに組み立てます。
pub struct App {
    pub config: QueueConfig,
    pub clock: Arc<dyn Clock>,
    pub engine: Arc<QueueEngine>,
    pub dlq: DeadLetterQueue,
    pub registry: WorkerRegistry,
}

impl App {
    pub async fn status(&self) -> Result<StatusReport, QueueError> {
        StatusReport::collect(&self.engine, &self.registry).await
    }

    pub fn scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(self.engine.clone()).with_interval(self.config.scheduler_interval())
    }

    pub fn executor(&self) -> Arc<dyn CommandExecutor> {
        Arc::new(ShellExecutor::with_timeout(self.config.job_timeout()))
    }

    /// Record describing the current process as worker `worker_id`.
    pub fn worker_record(&self, worker_id: WorkerId, parent_pid: Option<u32>) -> WorkerRecord {
        WorkerRecord {
            worker_id,
            pid: std::process::id(),
            parent_pid,
            started_at: self.clock.now(),
            hostname: crate::app::manager::local_hostname(),
        }
    }

    pub fn worker_loop(
        &self,
        record: WorkerRecord,
        executor: Arc<dyn CommandExecutor>,
    ) -> WorkerLoop {
        WorkerLoop::new(record, self.engine.clone(), self.registry.clone(), executor)
            .with_poll_interval(self.config.poll_interval())
    }

    pub fn manager(&self, launcher: Arc<dyn ProcessLauncher>) -> WorkerManager {
        WorkerManager::new(self.registry.clone(), launcher)
            .with_clock(self.clock.clone())
            .with_timings(StopTimings {
                stop_all_timeout: self.config.stop_timeout(),
                stop_pid_timeout: self.config.stop_pid_timeout(),
                ..StopTimings::default()
            })
    }
}
