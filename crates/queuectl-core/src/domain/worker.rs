//! Worker record: runtime registration of one worker process.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::RecordError;
use super::ids::WorkerId;
use super::job::format_timestamp;

pub mod fields {
    pub const WORKER_ID: &str = "worker_id";
    pub const PID: &str = "pid";
    pub const PARENT_PID: &str = "parent_pid";
    pub const STARTED_AT: &str = "started_at";
    pub const HOSTNAME: &str = "hostname";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<u32>,
    pub started_at: DateTime<Utc>,

    /// Host the worker runs on. Absent in records written by older tooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl WorkerRecord {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (fields::WORKER_ID.to_string(), self.worker_id.to_string()),
            (fields::PID.to_string(), self.pid.to_string()),
            (
                fields::PARENT_PID.to_string(),
                self.parent_pid.map(|p| p.to_string()).unwrap_or_default(),
            ),
            (fields::STARTED_AT.to_string(), format_timestamp(self.started_at)),
            (
                fields::HOSTNAME.to_string(),
                self.hostname.clone().unwrap_or_default(),
            ),
        ]
    }

    pub fn from_fields(key: &str, raw: &HashMap<String, String>) -> Result<Self, RecordError> {
        let get = |field: &'static str| {
            raw.get(field).ok_or_else(|| RecordError::MissingField {
                key: key.to_string(),
                field,
            })
        };
        let invalid = |field: &'static str, value: &str| RecordError::InvalidField {
            key: key.to_string(),
            field,
            value: value.to_string(),
        };

        let id_raw = get(fields::WORKER_ID)?;
        let worker_id = id_raw
            .parse::<WorkerId>()
            .map_err(|_| invalid(fields::WORKER_ID, id_raw))?;
        let pid_raw = get(fields::PID)?;
        let pid = pid_raw
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid(fields::PID, pid_raw))?;
        let parent_pid = match raw.get(fields::PARENT_PID).map(|v| v.trim()) {
            None | Some("") => None,
            Some(v) => Some(v.parse::<u32>().map_err(|_| invalid(fields::PARENT_PID, v))?),
        };
        let started_raw = get(fields::STARTED_AT)?;
        let started_at = DateTime::parse_from_rfc3339(started_raw.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| invalid(fields::STARTED_AT, started_raw))?;
        let hostname = raw
            .get(fields::HOSTNAME)
            .filter(|h| !h.is_empty())
            .cloned();

        Ok(Self {
            worker_id,
            pid,
            parent_pid,
            started_at,
            hostname,
        })
    }
}
