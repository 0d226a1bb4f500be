//! Job and stage-state model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque job identity, assigned at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Job status.
///
/// Transitions only move forward (`Pending -> Running -> Succeeded | Failed`),
/// except for an explicit retry which takes `Failed` back to `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a concurrency slot.
    Pending,
    /// Holding a slot and executing the named stage.
    Running { stage: String },
    /// Every stage succeeded.
    Succeeded,
    /// A stage failed; the job stopped there.
    Failed,
}

impl JobStatus {
    /// Whether the job has settled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::Running { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Pending)
    }

    /// Status name without the stage detail.
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running { .. } => "Running",
            JobStatus::Succeeded => "Succeeded",
            JobStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running { stage } => write!(f, "Running({})", stage),
            other => f.write_str(other.name()),
        }
    }
}

/// Failure recorded on a job: the stage that rejected and its error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Name of the stage that failed.
    pub stage: String,
    /// The stage's error, rendered verbatim.
    pub message: String,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage '{}' failed: {}", self.stage, self.message)
    }
}

impl std::error::Error for JobError {}

/// Outputs of completed stages, in stage order.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResults<O> {
    entries: Vec<(String, O)>,
}

impl<O> Default for StageResults<O> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<O> StageResults<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output of the named stage, if it has completed.
    pub fn get(&self, stage: &str) -> Option<&O> {
        self.entries
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, output)| output)
    }

    /// Output of the most recently completed stage.
    pub fn last(&self) -> Option<(&str, &O)> {
        self.entries
            .last()
            .map(|(name, output)| (name.as_str(), output))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &O)> {
        self.entries
            .iter()
            .map(|(name, output)| (name.as_str(), output))
    }

    /// Names of completed stages, in order.
    pub fn stage_names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, stage: impl Into<String>, output: O) {
        self.entries.push((stage.into(), output));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn into_vec(self) -> Vec<(String, O)> {
        self.entries
    }
}

/// A unit of work driven through a fixed, ordered list of stages.
#[derive(Debug)]
pub struct Job<I, O> {
    id: JobId,
    label: Option<String>,
    input: Arc<I>,
    stages: Arc<[String]>,
    stage_index: usize,
    status: JobStatus,
    results: StageResults<O>,
    error: Option<JobError>,
    attempt: u32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

// The input sits behind an `Arc`, so cloning a job never requires `I: Clone`.
impl<I, O: Clone> Clone for Job<I, O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            label: self.label.clone(),
            input: self.input.clone(),
            stages: self.stages.clone(),
            stage_index: self.stage_index,
            status: self.status.clone(),
            results: self.results.clone(),
            error: self.error.clone(),
            attempt: self.attempt,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

impl<I, O> Job<I, O> {
    pub(crate) fn new(input: I, label: Option<String>, stages: Arc<[String]>) -> Self {
        Self {
            id: JobId::new(),
            label,
            input: Arc::new(input),
            stages,
            stage_index: 0,
            status: JobStatus::Pending,
            results: StageResults::new(),
            error: None,
            attempt: 1,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Caller-supplied display label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The immutable caller payload.
    pub fn input(&self) -> &I {
        &self.input
    }

    pub(crate) fn input_arc(&self) -> Arc<I> {
        self.input.clone()
    }

    /// Stage names, fixed at enqueue.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Index of the next stage to run.
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn total_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    /// Outputs of the stages completed so far in the current attempt.
    pub fn results(&self) -> &StageResults<O> {
        &self.results
    }

    /// Set only while the job is `Failed`.
    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    /// Attempt number, starting at 1 and bumped by each retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Completion ratio in `0.0..=1.0` derived from the stage index.
    pub fn progress(&self) -> f32 {
        if self.status == JobStatus::Succeeded {
            return 1.0;
        }
        if self.stages.is_empty() {
            return 0.0;
        }
        self.stage_index as f32 / self.stages.len() as f32
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = JobStatus::Running {
            stage: self.stages[self.stage_index].clone(),
        };
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    /// Record a completed stage and advance. Returns `true` once every stage
    /// has completed.
    pub(crate) fn complete_stage(&mut self, output: O) -> bool {
        let stage = self.stages[self.stage_index].clone();
        self.results.push(stage, output);
        self.stage_index += 1;

        if self.stage_index >= self.stages.len() {
            self.status = JobStatus::Succeeded;
            self.finished_at = Some(Utc::now());
            true
        } else {
            self.status = JobStatus::Running {
                stage: self.stages[self.stage_index].clone(),
            };
            false
        }
    }

    pub(crate) fn fail(&mut self, error: JobError) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    /// Put a failed job back to the start of its stage list.
    pub(crate) fn reset_for_retry(&mut self) {
        self.status = JobStatus::Pending;
        self.stage_index = 0;
        self.results.clear();
        self.error = None;
        self.attempt += 1;
        self.started_at = None;
        self.finished_at = None;
    }
}

/// Final state of a job as seen by a waiter.
#[derive(Debug, Clone)]
pub enum JobOutcome<O> {
    /// All stages succeeded.
    Succeeded { id: JobId, results: StageResults<O> },
    /// A stage failed; `results` holds the outputs of the stages before it.
    Failed {
        id: JobId,
        error: JobError,
        results: StageResults<O>,
    },
    /// The job was removed from the scheduler before it settled.
    Removed { id: JobId },
}

impl<O> JobOutcome<O> {
    pub fn id(&self) -> JobId {
        match self {
            JobOutcome::Succeeded { id, .. }
            | JobOutcome::Failed { id, .. }
            | JobOutcome::Removed { id } => *id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}
