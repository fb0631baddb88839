//! Outcome model: the result of one command execution.
//!
//! Every way a command can end (exit 0, non-zero exit, timeout, spawn error)
//! is mapped onto `Outcome` so the worker loop has exactly two reporting paths:
//! completed or failed.

use serde::{Deserialize, Serialize};

/// Longest stderr/stdout tail kept in a failure reason.
const REASON_TAIL_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// Output captured during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Artifact {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    /// Exit code, when the process ran to completion and the OS reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            exit_code: Some(0),
            artifacts: Vec::new(),
            reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            exit_code: None,
            artifacts: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    /// Build from a finished process. `exit_code` is `None` when the process was
    /// killed by a signal.
    pub fn from_exit(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        let kind = if exit_code == Some(0) {
            OutcomeKind::Success
        } else {
            OutcomeKind::Failure
        };
        let mut artifacts = Vec::new();
        if !stdout.is_empty() {
            artifacts.push(Artifact::Stdout(stdout));
        }
        if !stderr.is_empty() {
            artifacts.push(Artifact::Stderr(stderr));
        }
        let reason = match (kind, exit_code) {
            (OutcomeKind::Success, _) => None,
            (OutcomeKind::Failure, Some(code)) => Some(format!("exit code {code}")),
            (OutcomeKind::Failure, None) => Some("terminated by signal".to_string()),
        };
        Self {
            kind,
            exit_code,
            artifacts,
            reason,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    pub fn stdout(&self) -> Option<&str> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::Stdout(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn stderr(&self) -> Option<&str> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::Stderr(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// One-line summary stored as the job's `last_error`.
    pub fn failure_summary(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        let reason = self
            .reason
            .clone()
            .unwrap_or_else(|| "failed".to_string());
        match self.stderr().map(str::trim).filter(|s| !s.is_empty()) {
            Some(stderr) => Some(format!("{reason}: {}", tail(stderr, REASON_TAIL_CHARS))),
            None => Some(reason),
        }
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
