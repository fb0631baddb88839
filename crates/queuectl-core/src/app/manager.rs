//! WorkerManager - ワーカープロセスの起動・列挙・停止
//!
//! # 停止の流れ
//! 1. 対象ワーカーの stop flag を立てる（協調的停止）
//! 2. レジストリから消えるのを一定時間ポーリングで待つ
//! 3. 残ったワーカーは OS レベルで終了させる（graceful → 猶予 → forced）
//!    その後、明示的にレジストリから削除する
//!
//! 別ホストから登録されたワーカーには OS シグナルを送れないので、
//! unreachable として報告し登録は残します。

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::{StoreError, WorkerId, WorkerRecord};
use crate::ports::{Clock, ProcessHandle, ProcessLauncher, SystemClock};
use crate::queue::WorkerRegistry;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no registered worker with pid {pid}")]
    WorkerNotFound { pid: u32 },

    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: WorkerId,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct StopTimings {
    pub stop_all_timeout: Duration,
    pub stop_pid_timeout: Duration,
    pub poll_interval: Duration,
    /// Wait between the graceful and the forced termination of a straggler.
    pub kill_grace: Duration,
}

impl Default for StopTimings {
    fn default() -> Self {
        Self {
            stop_all_timeout: Duration::from_secs(10),
            stop_pid_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            kill_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    /// Stopped cooperatively through the stop flag.
    pub exited: Vec<WorkerRecord>,
    /// Terminated at OS level and deregistered by the manager.
    pub terminated: Vec<WorkerRecord>,
    /// Registered from another host; still registered.
    pub unreachable: Vec<WorkerRecord>,
}

impl StopReport {
    pub fn is_empty(&self) -> bool {
        self.exited.is_empty() && self.terminated.is_empty() && self.unreachable.is_empty()
    }
}

/// A worker process started by this manager.
pub struct SpawnedWorker {
    pub record: WorkerRecord,
    pub process: Box<dyn ProcessHandle>,
}

pub struct WorkerManager {
    registry: WorkerRegistry,
    launcher: Arc<dyn ProcessLauncher>,
    clock: Arc<dyn Clock>,
    hostname: Option<String>,
    timings: StopTimings,
}

impl WorkerManager {
    pub fn new(registry: WorkerRegistry, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            registry,
            launcher,
            clock: Arc::new(SystemClock),
            hostname: local_hostname(),
            timings: StopTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: StopTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    /// Spawn `count` worker processes with ids above the current maximum.
    ///
    /// Each worker is registered right after it is spawned so that a second
    /// `start` issued before the workers come up does not reuse their ids.
    /// A stale stop flag for a reused id is cleared before the spawn, so a
    /// stop requested after that point is honoured by the new process.
    pub async fn start(&self, count: usize) -> Result<Vec<SpawnedWorker>, ManagerError> {
        let mut next = self.registry.next_id().await?;
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            let worker_id = next;
            self.registry.clear_stop(worker_id).await?;
            let process = self
                .launcher
                .launch(worker_id)
                .map_err(|source| ManagerError::Spawn { worker_id, source })?;
            let record = WorkerRecord {
                worker_id,
                pid: process.pid(),
                parent_pid: Some(std::process::id()),
                started_at: self.clock.now(),
                hostname: self.hostname.clone(),
            };
            self.registry.register(&record).await?;
            info!(%worker_id, pid = record.pid, "worker started");
            spawned.push(SpawnedWorker { record, process });
            next = next.next();
        }
        Ok(spawned)
    }

    /// Deregister spawned workers whose process is gone but whose record is
    /// still there, e.g. one that exited before it ever reached the store.
    pub async fn reap_exited(
        &self,
        spawned: &mut [SpawnedWorker],
    ) -> Result<Vec<WorkerRecord>, ManagerError> {
        let mut reaped = Vec::new();
        for worker in spawned.iter_mut() {
            if worker.process.is_alive() {
                continue;
            }
            let id = worker.record.worker_id;
            match self.registry.get(id).await? {
                Some(current) if current.pid == worker.record.pid => {
                    warn!(worker_id = %id, pid = current.pid, "worker exited without deregistering");
                    self.registry.unregister(id).await?;
                    reaped.push(current);
                }
                _ => {}
            }
        }
        Ok(reaped)
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>, ManagerError> {
        Ok(self.registry.list().await?)
    }

    pub async fn stop_all(&self) -> Result<StopReport, ManagerError> {
        let workers = self.registry.list().await?;
        self.stop(workers, self.timings.stop_all_timeout).await
    }

    pub async fn stop_by_pid(&self, pid: u32) -> Result<StopReport, ManagerError> {
        let worker = self
            .registry
            .list()
            .await?
            .into_iter()
            .find(|w| w.pid == pid)
            .ok_or(ManagerError::WorkerNotFound { pid })?;
        self.stop(vec![worker], self.timings.stop_pid_timeout).await
    }

    /// Stop exactly the given workers, e.g. the ones a foreground `start` spawned.
    pub async fn stop_workers(
        &self,
        workers: Vec<WorkerRecord>,
    ) -> Result<StopReport, ManagerError> {
        self.stop(workers, self.timings.stop_all_timeout).await
    }

    async fn stop(
        &self,
        workers: Vec<WorkerRecord>,
        timeout: Duration,
    ) -> Result<StopReport, ManagerError> {
        let mut report = StopReport::default();
        if workers.is_empty() {
            return Ok(report);
        }

        for worker in &workers {
            self.registry.request_stop(worker.worker_id).await?;
        }
        info!(count = workers.len(), "stop requested");

        let remaining = self.wait_for_exit(&workers, timeout).await?;
        for worker in workers {
            if !remaining.contains(&worker.worker_id) {
                report.exited.push(worker);
            } else if self.is_remote(&worker) {
                warn!(
                    worker_id = %worker.worker_id,
                    hostname = worker.hostname.as_deref().unwrap_or(""),
                    "worker did not stop and runs on another host"
                );
                report.unreachable.push(worker);
            } else {
                self.force_stop(&worker).await?;
                report.terminated.push(worker);
            }
        }
        Ok(report)
    }

    /// Poll the registry until every worker has deregistered or `timeout`
    /// passes. Returns the ids still registered.
    async fn wait_for_exit(
        &self,
        workers: &[WorkerRecord],
        timeout: Duration,
    ) -> Result<HashSet<WorkerId>, ManagerError> {
        let wanted: HashSet<WorkerId> = workers.iter().map(|w| w.worker_id).collect();
        let deadline = Instant::now() + timeout;
        loop {
            let registered: HashSet<WorkerId> = self.registry.ids().await?.into_iter().collect();
            let remaining: HashSet<WorkerId> =
                wanted.intersection(&registered).copied().collect();
            if remaining.is_empty() || Instant::now() >= deadline {
                return Ok(remaining);
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }

    fn is_remote(&self, worker: &WorkerRecord) -> bool {
        match (&worker.hostname, &self.hostname) {
            (Some(theirs), Some(ours)) => theirs != ours,
            _ => false,
        }
    }

    async fn force_stop(&self, worker: &WorkerRecord) -> Result<(), ManagerError> {
        let mut process = self.launcher.attach(worker.pid);
        if process.is_alive() {
            warn!(worker_id = %worker.worker_id, pid = worker.pid, "terminating unresponsive worker");
            if let Err(e) = process.terminate(true) {
                warn!(pid = worker.pid, error = %e, "graceful termination failed");
            }
            let deadline = Instant::now() + self.timings.kill_grace;
            while process.is_alive() && Instant::now() < deadline {
                tokio::time::sleep(self.timings.poll_interval.min(self.timings.kill_grace)).await;
            }
            if process.is_alive() {
                warn!(pid = worker.pid, "killing worker");
                if let Err(e) = process.terminate(false) {
                    warn!(pid = worker.pid, error = %e, "forced termination failed");
                }
            }
        }
        self.registry.unregister(worker.worker_id).await?;
        Ok(())
    }
}

/// Hostname recorded on worker records started from this machine.
pub fn local_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

/// Age of a worker for display purposes.
pub fn uptime(record: &WorkerRecord, now: DateTime<Utc>) -> Duration {
    (now - record.started_at).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryStore;
    use crate::queue::Keyspace;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeOs {
        /// pid -> alive
        processes: Mutex<HashMap<u32, bool>>,
        /// pids that ignore SIGTERM
        stubborn: Mutex<HashSet<u32>>,
        signals: Mutex<Vec<(u32, bool)>>,
        next_pid: Mutex<u32>,
    }

    struct FakeProcess {
        pid: u32,
        os: Arc<FakeOs>,
    }

    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn is_alive(&mut self) -> bool {
            self.os
                .processes
                .lock()
                .unwrap()
                .get(&self.pid)
                .copied()
                .unwrap_or(false)
        }

        fn terminate(&mut self, graceful: bool) -> io::Result<()> {
            self.os.signals.lock().unwrap().push((self.pid, graceful));
            let stubborn = self.os.stubborn.lock().unwrap().contains(&self.pid);
            if !graceful || !stubborn {
                self.os.processes.lock().unwrap().insert(self.pid, false);
            }
            Ok(())
        }
    }

    struct FakeLauncher {
        os: Arc<FakeOs>,
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self, _worker_id: WorkerId) -> io::Result<Box<dyn ProcessHandle>> {
            let mut next = self.os.next_pid.lock().unwrap();
            *next += 1;
            let pid = 1000 + *next;
            self.os.processes.lock().unwrap().insert(pid, true);
            Ok(Box::new(FakeProcess {
                pid,
                os: self.os.clone(),
            }))
        }

        fn attach(&self, pid: u32) -> Box<dyn ProcessHandle> {
            Box::new(FakeProcess {
                pid,
                os: self.os.clone(),
            })
        }
    }

    fn fast_timings() -> StopTimings {
        StopTimings {
            stop_all_timeout: Duration::from_millis(100),
            stop_pid_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            kill_grace: Duration::from_millis(30),
        }
    }

    fn setup() -> (Arc<FakeOs>, WorkerRegistry, WorkerManager) {
        let os = Arc::new(FakeOs::default());
        let registry = WorkerRegistry::new(Arc::new(MemoryStore::new()), Keyspace::new("t"));
        let manager = WorkerManager::new(
            registry.clone(),
            Arc::new(FakeLauncher { os: os.clone() }),
        )
        .with_hostname(Some("host-a".into()))
        .with_timings(fast_timings());
        (os, registry, manager)
    }

    /// Stand-in for a worker process that honours its stop flag.
    fn cooperative(registry: WorkerRegistry, id: WorkerId) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if registry.stop_requested(id).await.unwrap() {
                    registry.unregister(id).await.unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    #[tokio::test]
    async fn start_assigns_ids_above_the_maximum() {
        let (_, registry, manager) = setup();
        let first = manager.start(2).await.unwrap();
        assert_eq!(
            first.iter().map(|w| w.record.worker_id.get()).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let second = manager.start(1).await.unwrap();
        assert_eq!(second[0].record.worker_id, WorkerId::new(3));
        assert_eq!(registry.ids().await.unwrap().len(), 3);
        assert_eq!(second[0].record.hostname.as_deref(), Some("host-a"));
    }

    #[tokio::test]
    async fn start_clears_a_stale_stop_flag_for_a_reused_id() {
        let (_, registry, manager) = setup();
        registry.request_stop(WorkerId::new(1)).await.unwrap();

        let spawned = manager.start(1).await.unwrap();
        assert_eq!(spawned[0].record.worker_id, WorkerId::new(1));
        assert!(!registry.stop_requested(WorkerId::new(1)).await.unwrap());
    }

    #[tokio::test]
    async fn stop_all_with_cooperative_workers() {
        let (os, registry, manager) = setup();
        let spawned = manager.start(2).await.unwrap();
        let tasks: Vec<_> = spawned
            .iter()
            .map(|w| cooperative(registry.clone(), w.record.worker_id))
            .collect();

        let report = manager.stop_all().await.unwrap();
        assert_eq!(report.exited.len(), 2);
        assert!(report.terminated.is_empty());
        assert!(os.signals.lock().unwrap().is_empty());
        assert!(registry.ids().await.unwrap().is_empty());
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn stragglers_are_terminated_then_killed() {
        let (os, registry, manager) = setup();
        let spawned = manager.start(1).await.unwrap();
        let pid = spawned[0].process.pid();
        os.stubborn.lock().unwrap().insert(pid);

        let report = manager.stop_all().await.unwrap();
        assert_eq!(report.terminated.len(), 1);
        assert_eq!(*os.signals.lock().unwrap(), vec![(pid, true), (pid, false)]);
        assert!(registry.ids().await.unwrap().is_empty());
        assert!(!registry.stop_requested(WorkerId::new(1)).await.unwrap());
    }

    #[tokio::test]
    async fn dead_stragglers_are_just_deregistered() {
        let (os, registry, manager) = setup();
        let spawned = manager.start(1).await.unwrap();
        os.processes
            .lock()
            .unwrap()
            .insert(spawned[0].process.pid(), false);

        let report = manager.stop_all().await.unwrap();
        assert_eq!(report.terminated.len(), 1);
        assert!(os.signals.lock().unwrap().is_empty());
        assert!(registry.ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_stragglers_stay_registered() {
        let (os, registry, manager) = setup();
        let remote = WorkerRecord {
            worker_id: WorkerId::new(9),
            pid: 77,
            parent_pid: None,
            started_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            hostname: Some("host-b".into()),
        };
        registry.register(&remote).await.unwrap();

        let report = manager.stop_all().await.unwrap();
        assert_eq!(report.unreachable, vec![remote]);
        assert!(os.signals.lock().unwrap().is_empty());
        assert_eq!(registry.ids().await.unwrap(), vec![WorkerId::new(9)]);
    }

    #[tokio::test]
    async fn exited_workers_left_registered_are_reaped() {
        let (os, registry, manager) = setup();
        let mut spawned = manager.start(2).await.unwrap();
        let dead = spawned[0].record.clone();
        os.processes.lock().unwrap().insert(dead.pid, false);

        let reaped = manager.reap_exited(&mut spawned).await.unwrap();
        assert_eq!(reaped, vec![dead]);
        assert_eq!(registry.ids().await.unwrap(), vec![spawned[1].record.worker_id]);

        // a record that now belongs to another process is left alone
        let reused = WorkerRecord {
            pid: 9999,
            ..spawned[1].record.clone()
        };
        registry.register(&reused).await.unwrap();
        os.processes.lock().unwrap().insert(spawned[1].record.pid, false);
        assert!(manager.reap_exited(&mut spawned).await.unwrap().is_empty());
        assert_eq!(registry.get(reused.worker_id).await.unwrap(), Some(reused));
    }

    #[tokio::test]
    async fn stop_by_pid_targets_one_worker() {
        let (_, registry, manager) = setup();
        let spawned = manager.start(2).await.unwrap();
        let target = &spawned[1];
        let task = cooperative(registry.clone(), target.record.worker_id);

        let report = manager.stop_by_pid(target.process.pid()).await.unwrap();
        assert_eq!(report.exited.len(), 1);
        assert_eq!(report.exited[0].worker_id, target.record.worker_id);
        assert_eq!(registry.ids().await.unwrap(), vec![spawned[0].record.worker_id]);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stop_by_unknown_pid_is_not_found() {
        let (_, _, manager) = setup();
        let err = manager.stop_by_pid(31337).await.unwrap_err();
        assert!(matches!(err, ManagerError::WorkerNotFound { pid: 31337 }));
    }

    #[tokio::test]
    async fn stop_all_with_no_workers_is_empty() {
        let (_, _, manager) = setup();
        assert!(manager.stop_all().await.unwrap().is_empty());
    }
}
