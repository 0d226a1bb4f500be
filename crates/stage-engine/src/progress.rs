//! Read-only progress projections.
//!
//! The scheduler publishes a [`JobEvent`] for every job transition. A
//! [`ProgressSink`] folds those events into a local view that a UI can render
//! without touching scheduler state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

use crate::job::{Job, JobError, JobId, JobStatus};

/// Point-in-time view of one job, without its payload or outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub label: Option<String>,
    pub status: JobStatus,
    pub stage_index: usize,
    pub total_stages: usize,
    /// Names of the stages completed in the current attempt.
    pub completed_stages: Vec<String>,
    pub error: Option<JobError>,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    /// Completion percentage derived from the stage index.
    pub fn percent(&self) -> f32 {
        if self.status == JobStatus::Succeeded {
            return 100.0;
        }
        if self.total_stages == 0 {
            return 0.0;
        }
        self.stage_index as f32 * 100.0 / self.total_stages as f32
    }

    /// Label if set, otherwise the job id.
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.id.to_string())
    }
}

impl<I, O> From<&Job<I, O>> for JobSnapshot {
    fn from(job: &Job<I, O>) -> Self {
        Self {
            id: job.id(),
            label: job.label().map(str::to_string),
            status: job.status().clone(),
            stage_index: job.stage_index(),
            total_stages: job.total_stages(),
            completed_stages: job.results().stage_names(),
            error: job.error().cloned(),
            attempt: job.attempt(),
            created_at: job.created_at(),
            started_at: job.started_at(),
            finished_at: job.finished_at(),
        }
    }
}

/// Events published by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job was enqueued or changed state.
    Updated(JobSnapshot),
    /// A job left the visible collection.
    Removed { id: JobId },
    /// Admissions were paused.
    Paused,
    /// Admissions were resumed.
    Resumed,
}

/// Counts per status plus overall completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Mean per-job completion percentage.
    pub percent: f32,
}

impl ProgressSummary {
    pub fn from_snapshots<'a>(jobs: impl IntoIterator<Item = &'a JobSnapshot>) -> Self {
        let mut summary = Self::default();
        let mut percent_sum = 0.0f32;

        for job in jobs {
            summary.total += 1;
            percent_sum += job.percent();
            match job.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Running { .. } => summary.running += 1,
                JobStatus::Succeeded => summary.succeeded += 1,
                JobStatus::Failed => summary.failed += 1,
            }
        }

        if summary.total > 0 {
            summary.percent = percent_sum / summary.total as f32;
        }
        summary
    }

    /// No job is pending or running.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

pub(crate) type SnapshotSource = Arc<dyn Fn() -> Vec<JobSnapshot> + Send + Sync>;

/// Local, read-only view of a scheduler's jobs kept current from its events.
///
/// Obtained from [`Scheduler::progress`](crate::Scheduler::progress). If the
/// sink falls behind the event channel it re-reads a full snapshot.
pub struct ProgressSink {
    rx: broadcast::Receiver<JobEvent>,
    jobs: Vec<JobSnapshot>,
    paused: bool,
    resync: SnapshotSource,
}

impl ProgressSink {
    pub(crate) fn new(
        rx: broadcast::Receiver<JobEvent>,
        jobs: Vec<JobSnapshot>,
        paused: bool,
        resync: SnapshotSource,
    ) -> Self {
        Self {
            rx,
            jobs,
            paused,
            resync,
        }
    }

    /// Jobs in enqueue order.
    pub fn jobs(&self) -> &[JobSnapshot] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> Option<&JobSnapshot> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary::from_snapshots(&self.jobs)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Wait for the next event and fold it into the view.
    ///
    /// Returns `None` once the scheduler has been dropped.
    pub async fn changed(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    self.apply(&event);
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress sink lagged; resyncing from scheduler");
                    self.jobs = (self.resync)();
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Apply every event already queued without waiting. Returns how many
    /// events were applied.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.apply(&event);
                    applied += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress sink lagged; resyncing from scheduler");
                    self.jobs = (self.resync)();
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return applied,
            }
        }
    }

    fn apply(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Updated(snapshot) => {
                match self.jobs.iter_mut().find(|job| job.id == snapshot.id) {
                    Some(existing) => *existing = snapshot.clone(),
                    None => self.jobs.push(snapshot.clone()),
                }
            }
            JobEvent::Removed { id } => self.jobs.retain(|job| job.id != *id),
            JobEvent::Paused => self.paused = true,
            JobEvent::Resumed => self.paused = false,
        }
    }
}
