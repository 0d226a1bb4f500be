//! Per-request image generation batcher.
//!
//! Requests are single-stage jobs run in fixed-size waves: a wave of at most
//! `concurrency` requests is enqueued, the whole wave is awaited, then the
//! next wave starts. Partial failures are reported per request.
//!
//! Jobs live only as long as the request that created them: successes are
//! removed once reported, failures once they are discarded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stage_engine::{
    BoxError, JobError, JobId, JobOutcome, Pipeline, ProgressSink, Scheduler, SchedulerConfig,
    Stage, StageContext, WaveOptions, run_in_waves,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::GenerateSettings;
use crate::inference::{GenerateRequest, ImageData, InferenceClient, cancellable};
use crate::{Error, Result};

pub const GENERATE: &str = "generate";

/// One image to generate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub references: Vec<ImageData>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            references: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub id: JobId,
    /// Position of the request in the submitted batch.
    pub index: usize,
    pub image: ImageData,
}

#[derive(Debug, Clone)]
pub struct GenerationFailure {
    pub id: JobId,
    pub index: usize,
    pub error: JobError,
}

/// Result of a batch: successes are kept even when other requests failed.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub succeeded: Vec<GeneratedImage>,
    pub failed: Vec<GenerationFailure>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, index: usize, outcome: JobOutcome<ImageData>) {
        match outcome {
            JobOutcome::Succeeded { id, results } => match results.get(GENERATE) {
                Some(image) => self.succeeded.push(GeneratedImage {
                    id,
                    index,
                    image: image.clone(),
                }),
                None => self.failed.push(GenerationFailure {
                    id,
                    index,
                    error: JobError {
                        stage: GENERATE.to_string(),
                        message: "no image returned".to_string(),
                    },
                }),
            },
            JobOutcome::Failed { id, error, .. } => {
                self.failed.push(GenerationFailure { id, index, error })
            }
            JobOutcome::Removed { id } => self.failed.push(GenerationFailure {
                id,
                index,
                error: JobError {
                    stage: GENERATE.to_string(),
                    message: "request was removed before it finished".to_string(),
                },
            }),
        }
    }

    fn sort(&mut self) {
        self.succeeded.sort_by_key(|image| image.index);
        self.failed.sort_by_key(|failure| failure.index);
    }
}

struct GenerateStage {
    client: Arc<dyn InferenceClient>,
}

#[async_trait]
impl Stage<GenerationRequest, ImageData> for GenerateStage {
    fn name(&self) -> &str {
        GENERATE
    }

    async fn run(
        &self,
        ctx: StageContext<GenerationRequest, ImageData>,
    ) -> std::result::Result<ImageData, BoxError> {
        let input = ctx.input();
        let request = GenerateRequest {
            prompt: input.prompt.clone(),
            base_image: None,
            references: input.references.clone(),
        };
        cancellable(ctx.cancellation(), self.client.generate(&request)).await
    }
}

/// Wave-batched generation for one user request.
pub struct GenerationBatcher {
    scheduler: Scheduler<GenerationRequest, ImageData>,
    waves: WaveOptions,
}

impl GenerationBatcher {
    pub fn new(client: Arc<dyn InferenceClient>, settings: GenerateSettings) -> Result<Self> {
        let pipeline = Pipeline::new().add_stage(GenerateStage { client });
        let scheduler = Scheduler::new(
            SchedulerConfig::new("generate", settings.concurrency),
            pipeline,
        )?;
        Ok(Self {
            scheduler,
            waves: WaveOptions::new(settings.concurrency).with_pause(settings.wave_pause),
        })
    }

    /// Generate one image per request and report per-request outcomes.
    pub async fn run(&self, requests: Vec<GenerationRequest>) -> Result<BatchReport> {
        if let Some(index) = requests.iter().position(|r| r.prompt.trim().is_empty()) {
            return Err(Error::validation(format!("Request {} has an empty prompt", index)));
        }

        let total = requests.len();
        let outcomes = run_in_waves(&self.scheduler, requests, self.waves).await?;

        let mut report = BatchReport::default();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            report.record(index, outcome);
        }
        report.sort();
        self.release(report.succeeded.iter().map(|image| image.id));

        if report.failed.is_empty() {
            info!(total, "Generation batch complete");
        } else {
            warn!(
                total,
                failed = report.failed.len(),
                "Generation batch finished with failures"
            );
        }
        Ok(report)
    }

    /// Re-run the failed requests of `report` and return the merged report.
    ///
    /// Requests that fail again stay in `failed` with their new error.
    pub async fn retry_failed(&self, report: BatchReport) -> Result<BatchReport> {
        let BatchReport { succeeded, failed } = report;
        let mut merged = BatchReport {
            succeeded,
            failed: Vec::new(),
        };

        let mut retried = Vec::new();
        for failure in failed {
            match self.scheduler.retry(failure.id) {
                Ok(()) => retried.push((failure.index, failure.id)),
                Err(e) => {
                    warn!(job_id = %failure.id, error = %e, "Cannot retry generation request");
                    merged.failed.push(failure);
                }
            }
        }

        let ids: Vec<JobId> = retried.iter().map(|(_, id)| *id).collect();
        info!(count = ids.len(), "Retrying failed generation requests");
        let outcomes = self.scheduler.wait_for(&ids).await;
        for ((index, _), outcome) in retried.into_iter().zip(outcomes) {
            merged.record(index, outcome);
        }
        merged.sort();
        self.release(
            merged
                .succeeded
                .iter()
                .filter(|image| ids.contains(&image.id))
                .map(|image| image.id),
        );
        Ok(merged)
    }

    /// Drop the jobs still held for the failures of `report`. Call once the
    /// report will not be retried again.
    pub fn discard(&self, report: &BatchReport) {
        self.release(report.failed.iter().map(|failure| failure.id));
    }

    /// Remove settled jobs. Only failed jobs are kept, for `retry_failed`.
    fn release(&self, ids: impl IntoIterator<Item = JobId>) {
        let mut released = 0;
        for id in ids {
            match self.scheduler.remove(id) {
                Ok(_) => released += 1,
                Err(e) => debug!(job_id = %id, error = %e, "Generation job already released"),
            }
        }
        debug!(released, remaining = self.scheduler.len(), "Released generation jobs");
    }

    /// Cancel running requests and drop every job.
    pub async fn reset(&self) {
        self.scheduler.reset().await;
    }

    pub fn progress(&self) -> ProgressSink {
        self.scheduler.progress()
    }

    pub fn scheduler(&self) -> &Scheduler<GenerationRequest, ImageData> {
        &self.scheduler
    }
}
