//! ShellExecutor - ジョブのコマンドをシェル経由で実行
//!
//! unix は `sh -c`, windows は `cmd /C`。標準出力・標準エラーは取り込み、
//! Outcome の artifact として返します。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::Outcome;
use crate::ports::{CommandExecutor, ExecError};

#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    timeout: Option<Duration>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the command and report failure once it runs longer than `timeout`.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn command(command: &str) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str) -> Result<Outcome, ExecError> {
        let child = match Self::command(command).spawn() {
            Ok(child) => child,
            Err(e) => return Ok(Outcome::failure(format!("failed to spawn shell: {e}"))),
        };
        debug!(pid = child.id(), command, "running job command");

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                // dropping the future kills the child
                Err(_) => {
                    return Ok(Outcome::failure(format!(
                        "timed out after {}s",
                        limit.as_secs_f64()
                    )));
                }
            },
            None => child.wait_with_output().await,
        };

        match output {
            Ok(output) => Ok(Outcome::from_exit(
                output.status.code(),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )),
            Err(e) => Ok(Outcome::failure(format!("failed to wait for command: {e}"))),
        }
    }
}
