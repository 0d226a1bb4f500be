//! # Stage Engine
//!
//! A bounded-concurrency executor for jobs that advance through a fixed,
//! ordered list of asynchronous stages.
//!
//! ## Features
//!
//! - `ConcurrencyGate` caps the number of jobs in flight
//! - `Scheduler` admits pending jobs in FIFO order and refills a slot as soon
//!   as a job reaches a terminal state
//! - Pause/resume of admissions, whole-job retry, best-effort clear and a
//!   full session reset
//! - `ProgressSink` projections for rendering per-job progress
//! - Fixed-size wave batching on top of the continuous-refill scheduler
//!
//! A job holds exactly one concurrency slot for its whole stage sequence.
//! Stages of one job never run concurrently and a failed stage fails the
//! whole job; there is no per-stage retry.

use thiserror::Error;

pub mod config;
pub mod gate;
pub mod job;
pub mod progress;
pub mod scheduler;
pub mod stage;
pub mod wave;

#[cfg(test)]
mod test_utils;

pub use config::SchedulerConfig;
pub use gate::ConcurrencyGate;
pub use job::{Job, JobError, JobId, JobOutcome, JobStatus, StageResults};
pub use progress::{JobEvent, JobSnapshot, ProgressSink, ProgressSummary};
pub use scheduler::{Scheduler, SchedulerStats};
pub use stage::{BoxError, Pipeline, Stage, StageContext, stage_fn};
pub use tokio_util::sync::CancellationToken;
pub use wave::{WaveOptions, run_in_waves};

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine itself.
///
/// Stage failures are not engine errors: they are recorded on the failing
/// job and never abort the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Concurrency gate released more times than acquired")]
    GateUnderflow,

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("Pipeline must contain at least one stage")]
    EmptyPipeline,

    #[error("Duplicate stage name in pipeline: {0}")]
    DuplicateStage(String),

    #[error("Capacity exceeded: {requested} jobs would be visible, at most {limit} allowed")]
    CapacityExceeded { requested: usize, limit: usize },
}

impl EngineError {
    pub(crate) fn transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
