//! Store key layout under one namespace.

use crate::domain::{JobId, WorkerId};

pub const DEFAULT_NAMESPACE: &str = "queuectl";

/// Builds every key the queue reads or writes.
///
/// | key | type |
/// |---|---|
/// | `ns:job:<id>` | hash |
/// | `ns:queue:pending` | list |
/// | `ns:queue:delayed` | sorted set (epoch seconds) |
/// | `ns:queue:dead` | list |
/// | `ns:worker:<id>` | hash |
/// | `ns:workers:active` | set |
/// | `ns:worker:<id>:stop` | string with TTL |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    ns: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Keyspace {
    pub fn new(ns: impl Into<String>) -> Self {
        Self { ns: ns.into() }
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.ns)
    }

    pub fn job(&self, id: &JobId) -> String {
        format!("{}{}", self.job_prefix(), id)
    }

    pub fn pending(&self) -> String {
        format!("{}:queue:pending", self.ns)
    }

    pub fn delayed(&self) -> String {
        format!("{}:queue:delayed", self.ns)
    }

    pub fn dead(&self) -> String {
        format!("{}:queue:dead", self.ns)
    }

    pub fn worker(&self, id: WorkerId) -> String {
        format!("{}:worker:{}", self.ns, id)
    }

    pub fn active_workers(&self) -> String {
        format!("{}:workers:active", self.ns)
    }

    pub fn stop_flag(&self, id: WorkerId) -> String {
        format!("{}:stop", self.worker(id))
    }
}
