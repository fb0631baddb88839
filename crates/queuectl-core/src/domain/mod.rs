//! Domain model (ids, states, records, decisions, outcomes, errors).
//!
//! ストアや OS プロセスには依存しない純粋な型のみを置きます。

pub mod decision;
pub mod errors;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod state;
pub mod worker;

pub use decision::{FailureDecision, decide_failure};
pub use errors::{QueueError, RecordError, StoreError, TransitionError};
pub use ids::{JobId, WorkerId};
pub use job::Job;
pub use outcome::{Artifact, Outcome, OutcomeKind};
pub use state::{JobState, UnknownState};
pub use worker::WorkerRecord;
