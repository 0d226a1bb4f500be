//! Bulk template ingestion.
//!
//! Each submitted item runs `analyze -> generate -> compress -> save` as one
//! job. Jobs share a continuous-refill scheduler so that at most
//! `concurrency` items talk to the inference service at a time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stage_engine::{
    BoxError, EngineError, JobError, JobId, JobStatus, Pipeline, ProgressSink, ProgressSummary, Scheduler,
    SchedulerConfig, Stage, StageContext,
};
use std::sync::Arc;
use tracing::info;

use crate::config::IngestSettings;
use crate::inference::{
    AnalyzeRequest, CompressRequest, GenerateRequest, ImageData, InferenceClient, SaveRequest,
    SavedRecord, cancellable,
};
use crate::{Error, Result};

pub const ANALYZE: &str = "analyze";
pub const GENERATE: &str = "generate";
pub const COMPRESS: &str = "compress";
pub const SAVE: &str = "save";

/// One template to ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestItem {
    pub name: String,
    pub base_image: ImageData,
    #[serde(default)]
    pub reference_image: Option<ImageData>,
    #[serde(default)]
    pub constraints: String,
}

/// Output of one ingestion stage.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestArtifact {
    Description(String),
    Image(ImageData),
    Thumbnail(ImageData),
    Record(SavedRecord),
}

/// A failed item, ready to be shown with a retry action.
#[derive(Debug, Clone)]
pub struct IngestFailure {
    pub id: JobId,
    pub name: String,
    pub error: JobError,
    pub attempt: u32,
}

type IngestContext = StageContext<IngestItem, IngestArtifact>;

fn missing(stage: &str) -> BoxError {
    format!("missing {} output", stage).into()
}

struct AnalyzeStage {
    client: Arc<dyn InferenceClient>,
}

#[async_trait]
impl Stage<IngestItem, IngestArtifact> for AnalyzeStage {
    fn name(&self) -> &str {
        ANALYZE
    }

    async fn run(&self, ctx: IngestContext) -> std::result::Result<IngestArtifact, BoxError> {
        let item = ctx.input();
        let request = AnalyzeRequest {
            base_image: item.base_image.clone(),
            reference_image: item.reference_image.clone(),
            constraints: item.constraints.clone(),
        };
        let description = cancellable(ctx.cancellation(), self.client.analyze(&request)).await?;
        Ok(IngestArtifact::Description(description))
    }
}

struct GenerateStage {
    client: Arc<dyn InferenceClient>,
}

#[async_trait]
impl Stage<IngestItem, IngestArtifact> for GenerateStage {
    fn name(&self) -> &str {
        GENERATE
    }

    async fn run(&self, ctx: IngestContext) -> std::result::Result<IngestArtifact, BoxError> {
        let Some(IngestArtifact::Description(prompt)) = ctx.output_of(ANALYZE) else {
            return Err(missing(ANALYZE));
        };
        let request = GenerateRequest {
            prompt: prompt.clone(),
            base_image: Some(ctx.input().base_image.clone()),
            references: Vec::new(),
        };
        let image = cancellable(ctx.cancellation(), self.client.generate(&request)).await?;
        Ok(IngestArtifact::Image(image))
    }
}

struct CompressStage {
    client: Arc<dyn InferenceClient>,
    size: u32,
    quality: u8,
}

#[async_trait]
impl Stage<IngestItem, IngestArtifact> for CompressStage {
    fn name(&self) -> &str {
        COMPRESS
    }

    async fn run(&self, ctx: IngestContext) -> std::result::Result<IngestArtifact, BoxError> {
        let Some(IngestArtifact::Image(image)) = ctx.output_of(GENERATE) else {
            return Err(missing(GENERATE));
        };
        let request = CompressRequest {
            image: image.clone(),
            size: self.size,
            quality: self.quality,
        };
        let thumbnail = cancellable(ctx.cancellation(), self.client.compress(&request)).await?;
        Ok(IngestArtifact::Thumbnail(thumbnail))
    }
}

struct SaveStage {
    client: Arc<dyn InferenceClient>,
}

#[async_trait]
impl Stage<IngestItem, IngestArtifact> for SaveStage {
    fn name(&self) -> &str {
        SAVE
    }

    async fn run(&self, ctx: IngestContext) -> std::result::Result<IngestArtifact, BoxError> {
        let Some(IngestArtifact::Description(description)) = ctx.output_of(ANALYZE) else {
            return Err(missing(ANALYZE));
        };
        let Some(IngestArtifact::Thumbnail(thumbnail)) = ctx.output_of(COMPRESS) else {
            return Err(missing(COMPRESS));
        };
        let request = SaveRequest {
            name: ctx.input().name.clone(),
            description: description.clone(),
            thumbnail: thumbnail.clone(),
        };
        let record = cancellable(ctx.cancellation(), self.client.save(&request)).await?;
        Ok(IngestArtifact::Record(record))
    }
}

/// Session-scoped bulk ingestion queue.
#[derive(Clone)]
pub struct IngestionPipeline {
    scheduler: Scheduler<IngestItem, IngestArtifact>,
    max_items: usize,
}

impl IngestionPipeline {
    pub fn new(client: Arc<dyn InferenceClient>, settings: IngestSettings) -> Result<Self> {
        let pipeline = Pipeline::new()
            .add_stage(AnalyzeStage {
                client: client.clone(),
            })
            .add_stage(GenerateStage {
                client: client.clone(),
            })
            .add_stage(CompressStage {
                client: client.clone(),
                size: settings.thumbnail_size,
                quality: settings.thumbnail_quality,
            })
            .add_stage(SaveStage { client });

        let mut config = SchedulerConfig::new("ingest", settings.concurrency);
        config.start_paused = settings.start_paused;

        Ok(Self {
            scheduler: Scheduler::new(config, pipeline)?,
            max_items: settings.max_items,
        })
    }

    /// Queue items for ingestion.
    ///
    /// Rejected as a whole with [`Error::BatchTooLarge`] when the queue would
    /// hold more than `max_items` jobs afterwards.
    pub fn submit(&self, items: Vec<IngestItem>) -> Result<Vec<JobId>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(item) = items.iter().find(|item| item.name.trim().is_empty()) {
            return Err(Error::validation(format!(
                "Item with {} byte base image has no name",
                item.base_image.len()
            )));
        }

        let count = items.len();
        let labeled = items.into_iter().map(|item| (item.name.clone(), item));
        match self.scheduler.try_enqueue_labeled(labeled, self.max_items) {
            Ok(ids) => {
                info!(count, "Submitted ingestion batch");
                Ok(ids)
            }
            Err(EngineError::CapacityExceeded { requested, limit }) => Err(Error::BatchTooLarge {
                submitted: requested,
                limit,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.scheduler.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    /// Retry one failed item from its first stage.
    pub fn retry(&self, id: JobId) -> Result<()> {
        Ok(self.scheduler.retry(id)?)
    }

    /// Drop queued and finished items. Items already running still finish.
    pub fn clear(&self) -> usize {
        self.scheduler.clear()
    }

    /// Cancel running calls and empty the queue.
    pub async fn reset(&self) {
        self.scheduler.reset().await;
    }

    /// Records saved by items that completed every stage.
    pub fn records(&self) -> Vec<SavedRecord> {
        self.scheduler
            .jobs()
            .into_iter()
            .filter(|job| job.status() == &JobStatus::Succeeded)
            .filter_map(|job| match job.results().get(SAVE) {
                Some(IngestArtifact::Record(record)) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<IngestFailure> {
        self.scheduler
            .jobs()
            .into_iter()
            .filter_map(|job| {
                let error = job.error()?.clone();
                Some(IngestFailure {
                    id: job.id(),
                    name: job.input().name.clone(),
                    error,
                    attempt: job.attempt(),
                })
            })
            .collect()
    }

    pub fn progress(&self) -> ProgressSink {
        self.scheduler.progress()
    }

    pub fn summary(&self) -> ProgressSummary {
        self.scheduler.summary()
    }

    /// Wait until nothing is running and nothing can be admitted.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    pub fn scheduler(&self) -> &Scheduler<IngestItem, IngestArtifact> {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeInferenceClient, init_tracing, png};
    use std::time::Duration;

    fn item(name: &str) -> IngestItem {
        IngestItem {
            name: name.to_string(),
            base_image: png(b"base-image-bytes"),
            reference_image: Some(png(b"ref")),
            constraints: format!("keep {} layout", name),
        }
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            thumbnail_size: 4,
            ..IngestSettings::default()
        }
    }

    #[tokio::test]
    async fn test_item_runs_all_four_stages() {
        let client = FakeInferenceClient::new();
        let pipeline = IngestionPipeline::new(client.clone(), settings()).unwrap();

        pipeline.submit(vec![item("kitchen")]).unwrap();
        pipeline.wait_idle().await;

        let records = pipeline.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "kitchen");
        assert_eq!(records[0].description, "described: keep kitchen layout");

        let order: Vec<&str> = client.calls().iter().map(|(call, _)| *call).collect();
        assert_eq!(order, vec!["analyze", "generate", "compress", "save"]);

        let job = pipeline.scheduler().jobs().remove(0);
        match job.results().get(COMPRESS) {
            Some(IngestArtifact::Thumbnail(thumb)) => assert_eq!(thumb.len(), 4),
            other => panic!("unexpected compress output: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_capped_at_six() {
        let client = FakeInferenceClient::with_latency(Duration::from_millis(20));
        let pipeline = IngestionPipeline::new(client.clone(), settings()).unwrap();

        let items = (0..20).map(|i| item(&format!("room-{}", i))).collect();
        pipeline.submit(items).unwrap();
        pipeline.wait_idle().await;

        assert_eq!(pipeline.records().len(), 20);
        assert_eq!(client.peak_concurrency(), 6);
        assert_eq!(pipeline.scheduler().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_batch_limit() {
        let pipeline = IngestionPipeline::new(
            FakeInferenceClient::new(),
            IngestSettings {
                start_paused: true,
                ..settings()
            },
        )
        .unwrap();

        let first: Vec<_> = (0..60).map(|i| item(&format!("a{}", i))).collect();
        pipeline.submit(first).unwrap();

        let second: Vec<_> = (0..11).map(|i| item(&format!("b{}", i))).collect();
        match pipeline.submit(second) {
            Err(Error::BatchTooLarge { submitted, limit }) => {
                assert_eq!(submitted, 71);
                assert_eq!(limit, 70);
            }
            other => panic!("expected BatchTooLarge, got {:?}", other.map(|ids| ids.len())),
        }
        assert_eq!(pipeline.scheduler().len(), 60);

        let third: Vec<_> = (0..10).map(|i| item(&format!("c{}", i))).collect();
        assert_eq!(pipeline.submit(third).unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_submits_respect_limit() {
        let pipeline = IngestionPipeline::new(
            FakeInferenceClient::new(),
            IngestSettings {
                start_paused: true,
                ..settings()
            },
        )
        .unwrap();
        let barrier = std::sync::Barrier::new(2);

        let results: Vec<Result<Vec<JobId>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = ["left", "right"]
                .into_iter()
                .map(|side| {
                    let pipeline = pipeline.clone();
                    let barrier = &barrier;
                    scope.spawn(move || {
                        let batch = (0..40).map(|i| item(&format!("{}-{}", side, i))).collect();
                        barrier.wait();
                        pipeline.submit(batch)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(Error::BatchTooLarge { submitted: 80, limit: 70 })))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(rejected, 1);
        assert_eq!(pipeline.scheduler().len(), 40);
    }

    #[tokio::test]
    async fn test_unnamed_item_rejected() {
        let pipeline = IngestionPipeline::new(FakeInferenceClient::new(), settings()).unwrap();
        assert!(matches!(
            pipeline.submit(vec![item("  ")]),
            Err(Error::Validation(_))
        ));
        assert!(pipeline.scheduler().is_empty());
    }

    #[tokio::test]
    async fn test_failed_item_is_retried_from_analyze() {
        init_tracing();
        let client = FakeInferenceClient::new();
        client.fail_on("save", "attic");
        let pipeline = IngestionPipeline::new(client.clone(), settings()).unwrap();

        pipeline.submit(vec![item("attic"), item("porch")]).unwrap();
        pipeline.wait_idle().await;

        assert_eq!(pipeline.records().len(), 1);
        let failures = pipeline.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "attic");
        assert_eq!(failures[0].error.stage, SAVE);
        assert!(failures[0].error.message.contains("save failed for attic"));

        client.recover("save", "attic");
        pipeline.retry(failures[0].id).unwrap();
        pipeline.wait_idle().await;

        assert_eq!(pipeline.records().len(), 2);
        assert!(pipeline.failures().is_empty());
        // analyze ran once for porch and twice for attic.
        assert_eq!(client.count("analyze"), 3);
    }

    #[tokio::test]
    async fn test_reset_cancels_in_flight_calls() {
        let client = FakeInferenceClient::with_latency(Duration::from_secs(3600));
        let pipeline = IngestionPipeline::new(client.clone(), settings()).unwrap();

        pipeline
            .submit((0..8).map(|i| item(&format!("r{}", i))).collect())
            .unwrap();
        assert_eq!(pipeline.scheduler().in_flight(), 6);

        tokio::time::timeout(Duration::from_secs(5), pipeline.reset())
            .await
            .unwrap();
        assert_eq!(pipeline.scheduler().in_flight(), 0);
        assert!(pipeline.scheduler().is_empty());
    }
}
