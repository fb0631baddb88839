//! OS プロセス実装 - ワーカーの子プロセス起動とシグナル送信
//!
//! - unix: nix で SIGTERM / SIGKILL、`kill(pid, None)` で生存確認
//! - windows: taskkill / tasklist

use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::domain::WorkerId;
use crate::ports::{ProcessHandle, ProcessLauncher};

/// A worker spawned by this process. `try_wait` reaps it once it exits.
pub struct ChildProcess {
    child: Child,
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self, graceful: bool) -> io::Result<()> {
        if graceful {
            return signal_pid(self.pid(), true);
        }
        match self.child.kill() {
            Ok(()) => Ok(()),
            // already exited
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A process known only by pid, e.g. a detached worker started by an earlier CLI invocation.
pub struct PidProcess {
    pid: u32,
}

impl PidProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl ProcessHandle for PidProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        pid_alive(self.pid)
    }

    fn terminate(&mut self, graceful: bool) -> io::Result<()> {
        signal_pid(self.pid, graceful)
    }
}

/// Whether a process with this pid exists on this host.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // exists but owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn pid_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .stdin(Stdio::null())
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(unix)]
fn signal_pid(pid: u32, graceful: bool) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))?;
    let signal = if graceful {
        Signal::SIGTERM
    } else {
        Signal::SIGKILL
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

#[cfg(windows)]
fn signal_pid(pid: u32, graceful: bool) -> io::Result<()> {
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str()];
    if !graceful {
        args.push("/F");
    }
    Command::new("taskkill")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    Ok(())
}

/// Launches `<program> worker run --id <K> --parent-pid <P>`.
#[derive(Debug, Clone)]
pub struct OsProcessLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
    /// When set, each worker's stdout/stderr is appended to `<dir>/worker-<id>.log`
    /// and the worker is moved out of the caller's process group.
    log_dir: Option<PathBuf>,
}

impl OsProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: None,
            log_dir: None,
        }
    }

    /// Re-invoke the running executable.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn detached(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    fn command(&self, worker_id: WorkerId) -> io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.args([
            "worker",
            "run",
            "--id",
            &worker_id.to_string(),
            "--parent-pid",
            &std::process::id().to_string(),
        ]);
        cmd.stdin(Stdio::null());

        match &self.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("worker-{worker_id}.log")))?;
                cmd.stdout(log.try_clone()?);
                cmd.stderr(log);
                #[cfg(unix)]
                {
                    use std::os::unix::process::CommandExt;
                    cmd.process_group(0);
                }
            }
            None => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
        }
        Ok(cmd)
    }
}

impl ProcessLauncher for OsProcessLauncher {
    fn launch(&self, worker_id: WorkerId) -> io::Result<Box<dyn ProcessHandle>> {
        let child = self.command(worker_id)?.spawn()?;
        debug!(%worker_id, pid = child.id(), "spawned worker process");
        Ok(Box::new(ChildProcess { child }))
    }

    fn attach(&self, pid: u32) -> Box<dyn ProcessHandle> {
        Box::new(PidProcess::new(pid))
    }
}
