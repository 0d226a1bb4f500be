//! Job scheduler.
//!
//! The scheduler owns the job collection, the pending queue, the
//! [`ConcurrencyGate`] and the pause flag. Every scheduling decision (gate
//! check-and-increment, queue pop, status change) happens while holding the
//! state lock, and the lock is never held across an `.await`. Each admitted
//! job runs on its own spawned task; when it settles, the task releases its
//! slot and runs the next admission pass inside the same critical section.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::gate::ConcurrencyGate;
use crate::job::{Job, JobError, JobId, JobOutcome, JobStatus, StageResults};
use crate::progress::{JobEvent, JobSnapshot, ProgressSink, ProgressSummary};
use crate::stage::{Pipeline, StageContext};
use crate::{EngineError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Counters read in one critical section, so they are mutually consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub ceiling: usize,
    pub in_flight: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub paused: bool,
}

/// Work handed from an admission pass to a freshly spawned job task.
struct Admission<I, O> {
    id: JobId,
    attempt: u32,
    start_index: usize,
    input: Arc<I>,
    results: StageResults<O>,
    cancellation: CancellationToken,
}

struct State<I, O> {
    /// Visible collection, in enqueue order.
    jobs: Vec<Job<I, O>>,
    /// Admission candidates, earliest first.
    pending: VecDeque<JobId>,
    paused: bool,
    /// Set while `reset` waits for running jobs to settle.
    draining: bool,
    cancellation: CancellationToken,
}

impl<I, O> State<I, O> {
    fn job(&self, id: JobId) -> Option<&Job<I, O>> {
        self.jobs.iter().find(|job| job.id() == id)
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job<I, O>> {
        self.jobs.iter_mut().find(|job| job.id() == id)
    }

    fn running_count(&self) -> usize {
        self.jobs.iter().filter(|job| job.status().is_running()).count()
    }
}

struct Inner<I, O> {
    name: String,
    pipeline: Pipeline<I, O>,
    stage_names: Arc<[String]>,
    gate: ConcurrencyGate,
    state: Mutex<State<I, O>>,
    events: broadcast::Sender<JobEvent>,
    /// Bumped on every terminal transition, removal and pause change.
    settled: watch::Sender<u64>,
    runtime: Handle,
}

/// Bounded-concurrency scheduler for multi-stage jobs.
///
/// Cloning yields another handle to the same scheduler. Create one per
/// workspace or session; [`reset`](Self::reset) returns it to an empty state.
pub struct Scheduler<I, O> {
    inner: Arc<Inner<I, O>>,
}

impl<I, O> Clone for Scheduler<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, O> Scheduler<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Create a scheduler. Must be called from within a tokio runtime; job
    /// tasks are spawned onto that runtime.
    pub fn new(config: SchedulerConfig, pipeline: Pipeline<I, O>) -> Result<Self> {
        config.validate()?;
        pipeline.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            EngineError::InvalidConfig("scheduler must be created inside a tokio runtime".into())
        })?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (settled, _) = watch::channel(0);
        let stage_names = pipeline.stage_names();

        info!(
            scheduler = %config.name,
            max_concurrent = config.max_concurrent,
            stages = ?stage_names,
            "Scheduler created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name: config.name,
                pipeline,
                stage_names,
                gate: ConcurrencyGate::new(config.max_concurrent),
                state: Mutex::new(State {
                    jobs: Vec::new(),
                    pending: VecDeque::new(),
                    paused: config.start_paused,
                    draining: false,
                    cancellation: CancellationToken::new(),
                }),
                events,
                settled,
                runtime,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stage names every job runs through.
    pub fn stage_names(&self) -> &[String] {
        &self.inner.stage_names
    }

    /// Append one pending job per input and run an admission pass.
    pub fn enqueue(&self, inputs: impl IntoIterator<Item = I>) -> Vec<JobId> {
        self.enqueue_jobs(inputs.into_iter().map(|input| (None, input)))
    }

    /// Like [`enqueue`](Self::enqueue), attaching a display label to each job.
    pub fn enqueue_labeled(
        &self,
        inputs: impl IntoIterator<Item = (String, I)>,
    ) -> Vec<JobId> {
        self.enqueue_jobs(inputs.into_iter().map(|(label, input)| (Some(label), input)))
    }

    /// Like [`enqueue_labeled`](Self::enqueue_labeled), but rejects the whole
    /// batch with [`EngineError::CapacityExceeded`] when more than
    /// `max_visible` jobs would be visible afterwards. The check and the
    /// enqueue happen in one critical section.
    pub fn try_enqueue_labeled(
        &self,
        inputs: impl IntoIterator<Item = (String, I)>,
        max_visible: usize,
    ) -> Result<Vec<JobId>> {
        let inputs: Vec<(Option<String>, I)> = inputs
            .into_iter()
            .map(|(label, input)| (Some(label), input))
            .collect();
        self.try_enqueue_jobs(inputs, Some(max_visible))
    }

    /// Enqueue a single job.
    pub fn enqueue_one(&self, input: I) -> JobId {
        let ids = self.enqueue_jobs(std::iter::once((None, input)));
        ids[0]
    }

    fn enqueue_jobs(&self, inputs: impl Iterator<Item = (Option<String>, I)>) -> Vec<JobId> {
        let inputs: Vec<(Option<String>, I)> = inputs.collect();
        // Without a limit there is nothing to reject.
        self.try_enqueue_jobs(inputs, None).unwrap_or_default()
    }

    fn try_enqueue_jobs(
        &self,
        inputs: Vec<(Option<String>, I)>,
        max_visible: Option<usize>,
    ) -> Result<Vec<JobId>> {
        let inner = &self.inner;
        let (ids, admissions) = {
            let mut state = inner.state.lock();
            if let Some(limit) = max_visible {
                let requested = state.jobs.len() + inputs.len();
                if requested > limit {
                    return Err(EngineError::CapacityExceeded { requested, limit });
                }
            }
            let mut ids = Vec::with_capacity(inputs.len());
            for (label, input) in inputs {
                let job = Job::new(input, label, inner.stage_names.clone());
                let id = job.id();
                inner.publish(&job);
                state.jobs.push(job);
                state.pending.push_back(id);
                ids.push(id);
            }
            info!(
                scheduler = %inner.name,
                count = ids.len(),
                pending = state.pending.len(),
                paused = state.paused,
                "Enqueued jobs"
            );
            let admissions = inner.admit_locked(&mut state);
            (ids, admissions)
        };
        inner.spawn_all(admissions);
        Ok(ids)
    }

    /// Pause or resume admissions. Running jobs are not affected; resuming
    /// runs an admission pass.
    pub fn set_paused(&self, paused: bool) {
        let inner = &self.inner;
        let admissions = {
            let mut state = inner.state.lock();
            if state.paused == paused {
                return;
            }
            state.paused = paused;
            let event = if paused {
                JobEvent::Paused
            } else {
                JobEvent::Resumed
            };
            let _ = inner.events.send(event);
            info!(scheduler = %inner.name, paused, "Admissions {}", if paused { "paused" } else { "resumed" });
            if paused {
                Vec::new()
            } else {
                inner.admit_locked(&mut state)
            }
        };
        inner.notify_settled();
        inner.spawn_all(admissions);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Reset a failed job to pending so it runs its full stage list again.
    ///
    /// Partial results of the failed attempt are discarded.
    pub fn retry(&self, id: JobId) -> Result<()> {
        let inner = &self.inner;
        let admissions = {
            let mut state = inner.state.lock();
            let job = state.job_mut(id).ok_or(EngineError::JobNotFound(id))?;
            if job.status() != &JobStatus::Failed {
                return Err(EngineError::transition(job.status(), "Pending"));
            }
            job.reset_for_retry();
            info!(
                scheduler = %inner.name,
                job_id = %id,
                attempt = job.attempt(),
                "Job retried"
            );
            inner.publish(job);
            state.pending.push_back(id);
            inner.admit_locked(&mut state)
        };
        inner.spawn_all(admissions);
        Ok(())
    }

    /// Retry every failed job. Returns the ids that were reset.
    pub fn retry_failed(&self) -> Vec<JobId> {
        let failed: Vec<JobId> = {
            let state = self.inner.state.lock();
            state
                .jobs
                .iter()
                .filter(|job| job.status() == &JobStatus::Failed)
                .map(|job| job.id())
                .collect()
        };
        failed
            .into_iter()
            .filter(|id| self.retry(*id).is_ok())
            .collect()
    }

    /// Drop pending and settled jobs from the collection.
    ///
    /// Running jobs are not cancelled: they stay visible, finish, release
    /// their slot and record their results as usual. Returns the number of
    /// jobs removed.
    pub fn clear(&self) -> usize {
        let inner = &self.inner;
        let removed = {
            let mut state = inner.state.lock();
            let removed = inner.remove_idle_locked(&mut state);
            info!(scheduler = %inner.name, removed, "Cleared job collection");
            removed
        };
        inner.notify_settled();
        removed
    }

    /// Remove one job that is not running.
    pub fn remove(&self, id: JobId) -> Result<Job<I, O>> {
        let inner = &self.inner;
        let job = {
            let mut state = inner.state.lock();
            let position = state
                .jobs
                .iter()
                .position(|job| job.id() == id)
                .ok_or(EngineError::JobNotFound(id))?;
            if state.jobs[position].status().is_running() {
                return Err(EngineError::transition(
                    state.jobs[position].status(),
                    "Removed",
                ));
            }
            state.pending.retain(|pending| *pending != id);
            let job = state.jobs.remove(position);
            let _ = inner.events.send(JobEvent::Removed { id });
            job
        };
        inner.notify_settled();
        Ok(job)
    }

    /// Return the scheduler to an empty state.
    ///
    /// Admissions stop, pending and settled jobs are dropped, and the
    /// cancellation token handed to running stages is cancelled. The call
    /// then waits until every running job has settled and released its slot,
    /// so the in-flight count is zero when it returns. Jobs enqueued while
    /// the reset is waiting are kept.
    pub async fn reset(&self) {
        let inner = &self.inner;
        let mut settled = inner.settled.subscribe();
        {
            let mut state = inner.state.lock();
            state.draining = true;
            state.cancellation.cancel();
            let removed = inner.remove_idle_locked(&mut state);
            info!(
                scheduler = %inner.name,
                removed,
                running = state.running_count(),
                "Resetting scheduler"
            );
        }

        loop {
            settled.mark_unchanged();
            {
                let state = inner.state.lock();
                if inner.gate.in_flight() == 0 && state.running_count() == 0 {
                    break;
                }
            }
            if settled.changed().await.is_err() {
                break;
            }
        }

        let admissions = {
            let mut state = inner.state.lock();
            let drained: Vec<JobId> = state
                .jobs
                .iter()
                .filter(|job| job.status().is_terminal())
                .map(|job| job.id())
                .collect();
            state.jobs.retain(|job| !job.status().is_terminal());
            for id in drained {
                let _ = inner.events.send(JobEvent::Removed { id });
            }
            state.cancellation = CancellationToken::new();
            state.draining = false;
            info!(scheduler = %inner.name, "Scheduler reset complete");
            inner.admit_locked(&mut state)
        };
        inner.notify_settled();
        inner.spawn_all(admissions);
    }

    /// Clone of a job, including its input and partial results.
    pub fn job(&self, id: JobId) -> Option<Job<I, O>> {
        self.inner.state.lock().job(id).cloned()
    }

    /// Clones of every visible job in enqueue order.
    pub fn jobs(&self) -> Vec<Job<I, O>> {
        self.inner.state.lock().jobs.clone()
    }

    pub fn snapshot(&self, id: JobId) -> Option<JobSnapshot> {
        self.inner.state.lock().job(id).map(JobSnapshot::from)
    }

    /// Snapshots of every visible job in enqueue order.
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        self.inner.snapshots()
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary::from_snapshots(&self.snapshots())
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        let mut stats = SchedulerStats {
            ceiling: self.inner.gate.ceiling(),
            in_flight: self.inner.gate.in_flight(),
            paused: state.paused,
            ..SchedulerStats::default()
        };
        for job in &state.jobs {
            match job.status() {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running { .. } => stats.running += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Number of jobs holding a slot.
    pub fn in_flight(&self) -> usize {
        let _state = self.inner.state.lock();
        self.inner.gate.in_flight()
    }

    pub fn ceiling(&self) -> usize {
        self.inner.gate.ceiling()
    }

    /// Number of visible jobs.
    pub fn len(&self) -> usize {
        self.inner.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to raw job events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// A read-only progress view seeded with the current state.
    pub fn progress(&self) -> ProgressSink {
        let state = self.inner.state.lock();
        let rx = self.inner.events.subscribe();
        let jobs = state.jobs.iter().map(JobSnapshot::from).collect();
        let weak = Arc::downgrade(&self.inner);
        ProgressSink::new(
            rx,
            jobs,
            state.paused,
            Arc::new(move || {
                weak.upgrade()
                    .map(|inner| inner.snapshots())
                    .unwrap_or_default()
            }),
        )
    }

    /// Wait until every listed job has settled or been removed.
    ///
    /// Outcomes are returned in the order of `ids`.
    pub async fn wait_for(&self, ids: &[JobId]) -> Vec<JobOutcome<O>> {
        let mut settled = self.inner.settled.subscribe();
        loop {
            settled.mark_unchanged();
            if let Some(outcomes) = self.inner.outcomes(ids) {
                return outcomes;
            }
            if settled.changed().await.is_err() {
                return self.inner.outcomes(ids).unwrap_or_default();
            }
        }
    }

    /// Wait until nothing is running and nothing can be admitted: the pending
    /// queue is empty or admissions are paused.
    pub async fn wait_idle(&self) {
        let mut settled = self.inner.settled.subscribe();
        loop {
            settled.mark_unchanged();
            {
                let state = self.inner.state.lock();
                let admissible = !state.pending.is_empty() && !state.paused;
                if self.inner.gate.in_flight() == 0 && !admissible {
                    return;
                }
            }
            if settled.changed().await.is_err() {
                return;
            }
        }
    }
}

impl<I, O> Inner<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn publish(&self, job: &Job<I, O>) {
        // No receivers is fine.
        let _ = self.events.send(JobEvent::Updated(JobSnapshot::from(job)));
    }

    fn notify_settled(&self) {
        self.settled.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn snapshots(&self) -> Vec<JobSnapshot> {
        self.state.lock().jobs.iter().map(JobSnapshot::from).collect()
    }

    /// Admission pass: admit pending jobs in FIFO order while a slot is free.
    fn admit_locked(&self, state: &mut State<I, O>) -> Vec<Admission<I, O>> {
        let mut admissions = Vec::new();
        if state.paused || state.draining {
            return admissions;
        }

        while let Some(&id) = state.pending.front() {
            if !self.gate.try_acquire() {
                break;
            }
            state.pending.pop_front();

            let cancellation = state.cancellation.child_token();
            let Some(job) = state.job_mut(id) else {
                let _ = self.gate.release();
                continue;
            };
            job.mark_running();
            self.publish(job);
            info!(
                scheduler = %self.name,
                job_id = %id,
                attempt = job.attempt(),
                in_flight = self.gate.in_flight(),
                "Job admitted"
            );
            admissions.push(Admission {
                id,
                attempt: job.attempt(),
                start_index: job.stage_index(),
                input: job.input_arc(),
                results: job.results().clone(),
                cancellation,
            });
        }

        if !admissions.is_empty() {
            debug!(
                scheduler = %self.name,
                admitted = admissions.len(),
                pending = state.pending.len(),
                "Admission pass complete"
            );
        }
        admissions
    }

    fn spawn_all(self: &Arc<Self>, admissions: Vec<Admission<I, O>>) {
        for admission in admissions {
            let inner = self.clone();
            self.runtime.spawn(run_job(inner, admission));
        }
    }

    fn remove_idle_locked(&self, state: &mut State<I, O>) -> usize {
        state.pending.clear();
        let removed: Vec<JobId> = state
            .jobs
            .iter()
            .filter(|job| !job.status().is_running())
            .map(|job| job.id())
            .collect();
        state.jobs.retain(|job| job.status().is_running());
        for id in &removed {
            let _ = self.events.send(JobEvent::Removed { id: *id });
        }
        removed.len()
    }

    /// Record a successful stage. Returns `true` when the job has settled.
    fn complete_stage(self: &Arc<Self>, id: JobId, output: O) -> bool {
        let admissions = {
            let mut state = self.state.lock();
            let finished = match state.job_mut(id) {
                Some(job) => {
                    let finished = job.complete_stage(output);
                    self.publish(job);
                    if finished {
                        info!(
                            scheduler = %self.name,
                            job_id = %id,
                            attempt = job.attempt(),
                            "Job succeeded"
                        );
                    } else {
                        debug!(
                            scheduler = %self.name,
                            job_id = %id,
                            next_stage = %job.status(),
                            "Stage completed"
                        );
                    }
                    finished
                }
                None => true,
            };
            if !finished {
                return false;
            }
            self.release_locked();
            self.admit_locked(&mut state)
        };
        self.notify_settled();
        self.spawn_all(admissions);
        true
    }

    /// Mark the job failed, free its slot and refill.
    fn fail(self: &Arc<Self>, id: JobId, error: JobError) {
        let admissions = {
            let mut state = self.state.lock();
            if let Some(job) = state.job_mut(id) {
                warn!(
                    scheduler = %self.name,
                    job_id = %id,
                    attempt = job.attempt(),
                    stage = %error.stage,
                    error = %error.message,
                    "Job failed"
                );
                job.fail(error);
                self.publish(job);
            }
            self.release_locked();
            self.admit_locked(&mut state)
        };
        self.notify_settled();
        self.spawn_all(admissions);
    }

    fn release_locked(&self) {
        if let Err(e) = self.gate.release() {
            warn!(scheduler = %self.name, error = %e, "Slot release rejected");
        }
    }

    fn outcomes(&self, ids: &[JobId]) -> Option<Vec<JobOutcome<O>>> {
        let state = self.state.lock();
        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            let outcome = match state.job(id) {
                None => JobOutcome::Removed { id },
                Some(job) => match job.status() {
                    JobStatus::Succeeded => JobOutcome::Succeeded {
                        id,
                        results: job.results().clone(),
                    },
                    JobStatus::Failed => JobOutcome::Failed {
                        id,
                        error: job.error().cloned().unwrap_or_else(|| JobError {
                            stage: String::new(),
                            message: "unknown error".to_string(),
                        }),
                        results: job.results().clone(),
                    },
                    JobStatus::Pending | JobStatus::Running { .. } => return None,
                },
            };
            outcomes.push(outcome);
        }
        Some(outcomes)
    }
}

/// Drive one admitted job through its remaining stages.
///
/// The job owns its slot for the whole sequence; the slot is released exactly
/// once, by whichever terminal transition ends the loop.
async fn run_job<I, O>(inner: Arc<Inner<I, O>>, admission: Admission<I, O>)
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    let Admission {
        id,
        attempt,
        start_index,
        input,
        mut results,
        cancellation,
    } = admission;

    let mut index = start_index;
    loop {
        let Some(stage) = inner.pipeline.stage(index) else {
            inner.fail(
                id,
                JobError {
                    stage: String::new(),
                    message: format!("no stage at index {}", index),
                },
            );
            return;
        };
        let stage_name = stage.name().to_string();
        debug!(scheduler = %inner.name, job_id = %id, stage = %stage_name, "Stage started");

        let ctx = StageContext::new(
            id,
            attempt,
            input.clone(),
            Arc::new(results.clone()),
            cancellation.clone(),
        );
        let outcome = AssertUnwindSafe(stage.run(ctx)).catch_unwind().await;

        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                inner.fail(
                    id,
                    JobError {
                        stage: stage_name,
                        message: e.to_string(),
                    },
                );
                return;
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                warn!(scheduler = %inner.name, job_id = %id, stage = %stage_name, "Stage panicked: {}", message);
                inner.fail(
                    id,
                    JobError {
                        stage: stage_name,
                        message: format!("stage panicked: {}", message),
                    },
                );
                return;
            }
        };

        results.push(stage_name, output.clone());
        if inner.complete_stage(id, output) {
            return;
        }
        index += 1;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
