//! Process port - ワーカープロセスの起動・監視・停止
//!
//! WorkerManager は OS プロセスを直接触らず、この trait 経由で扱います。
//! テストでは偽のプロセスを差し込めます。

use std::io;

use crate::domain::WorkerId;

/// A worker process the manager can observe and signal.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Whether the process is still running. Reaps it if it has exited.
    fn is_alive(&mut self) -> bool;

    /// `graceful = true` asks the process to exit (SIGTERM); otherwise kill it.
    fn terminate(&mut self, graceful: bool) -> io::Result<()>;
}

pub trait ProcessLauncher: Send + Sync {
    /// Start a new worker process running the worker loop as `worker_id`.
    fn launch(&self, worker_id: WorkerId) -> io::Result<Box<dyn ProcessHandle>>;

    /// Handle to an already running process known only by pid.
    fn attach(&self, pid: u32) -> Box<dyn ProcessHandle>;
}
