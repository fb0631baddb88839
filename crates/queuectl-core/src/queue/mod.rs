//! Queue module: key layout, job/worker storage, the state machine engine,
//! backoff policy and the dead letter queue.

mod dlq;
mod engine;
mod job_store;
mod keys;
mod retry;
mod worker_registry;

pub use dlq::DeadLetterQueue;
pub use engine::{DEFAULT_MAX_RETRIES, QueueEngine};
pub use job_store::{JobScan, JobStore};
pub use keys::{DEFAULT_NAMESPACE, Keyspace};
pub use retry::BackoffPolicy;
pub use worker_registry::{STOP_FLAG_TTL, WorkerRegistry};
