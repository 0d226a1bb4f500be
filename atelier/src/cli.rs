//! Command-line interface.

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Deserialize;
use stage_engine::{CancellationToken, JobId, JobSnapshot, JobStatus, ProgressSink};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::generate::{BatchReport, GenerationBatcher, GenerationRequest};
use crate::inference::ImageData;
use crate::ingest::{IngestItem, IngestionPipeline};
use crate::{Error, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log filter directive, e.g. "atelier=debug,stage_engine=debug"
    #[arg(long, global = true, env = "ATELIER_LOG_FILTER")]
    pub log_filter: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest the templates listed in a JSON manifest
    Ingest {
        /// Manifest file: {"items": [{"name", "base_image", "reference_image", "constraints"}]}
        manifest: PathBuf,

        /// Queue everything, then wait for Enter before starting
        #[arg(long)]
        paused: bool,
    },

    /// Generate images from a prompt
    Generate {
        #[arg(short, long)]
        prompt: String,

        /// Number of images to generate
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Style reference image (repeatable)
        #[arg(short, long = "reference")]
        references: Vec<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = "out")]
        out: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct Manifest {
    items: Vec<ManifestItem>,
}

#[derive(Debug, Deserialize)]
struct ManifestItem {
    name: String,
    base_image: PathBuf,
    #[serde(default)]
    reference_image: Option<PathBuf>,
    #[serde(default)]
    constraints: String,
}

/// Read a manifest and the images it references. Relative image paths are
/// resolved against the manifest's directory.
pub async fn load_manifest(path: &Path) -> Result<Vec<IngestItem>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let manifest: Manifest = serde_json::from_str(&raw)?;
    let root = path.parent().unwrap_or_else(|| Path::new("."));

    let mut items = Vec::with_capacity(manifest.items.len());
    for entry in manifest.items {
        let reference_image = match &entry.reference_image {
            Some(reference) => Some(ImageData::from_file(&root.join(reference)).await?),
            None => None,
        };
        items.push(IngestItem {
            base_image: ImageData::from_file(&root.join(&entry.base_image)).await?,
            reference_image,
            name: entry.name,
            constraints: entry.constraints,
        });
    }
    Ok(items)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:>20.bold} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Renders one progress bar per job from a [`ProgressSink`].
pub struct ProgressView {
    multi: MultiProgress,
    bars: HashMap<JobId, ProgressBar>,
    /// Jobs that already existed when the view started; never drawn.
    skip: HashSet<JobId>,
}

impl Default for ProgressView {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressView {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            skip: HashSet::new(),
        }
    }

    /// Follow `sink` until every job in `ids` has settled or been removed.
    pub async fn follow(mut self, mut sink: ProgressSink, ids: &[JobId]) {
        self.skip_existing(&sink, ids);
        loop {
            sink.drain();
            self.sync(sink.jobs());
            let settled = ids
                .iter()
                .all(|id| sink.job(*id).is_none_or(|job| job.status.is_terminal()));
            if settled || sink.changed().await.is_none() {
                break;
            }
        }
        self.sync(sink.jobs());
    }

    /// Follow jobs created after `sink` was taken until `stop` is cancelled.
    pub async fn follow_until(mut self, mut sink: ProgressSink, stop: CancellationToken) {
        self.skip_existing(&sink, &[]);
        loop {
            sink.drain();
            self.sync(sink.jobs());
            tokio::select! {
                _ = stop.cancelled() => break,
                event = sink.changed() => {
                    if event.is_none() {
                        break;
                    }
                }
            }
        }
        sink.drain();
        self.sync(sink.jobs());
    }

    fn skip_existing(&mut self, sink: &ProgressSink, keep: &[JobId]) {
        self.skip = sink
            .jobs()
            .iter()
            .map(|job| job.id)
            .filter(|id| !keep.contains(id))
            .collect();
    }

    fn sync(&mut self, jobs: &[JobSnapshot]) {
        self.bars.retain(|id, bar| {
            let visible = jobs.iter().any(|job| job.id == *id);
            if !visible {
                bar.finish_and_clear();
            }
            visible
        });

        for job in jobs.iter().filter(|job| !self.skip.contains(&job.id)) {
            let bar = self.bars.entry(job.id).or_insert_with(|| {
                let bar = self
                    .multi
                    .add(ProgressBar::new(job.total_stages as u64).with_style(bar_style()));
                bar.set_prefix(job.display_name());
                bar
            });
            if bar.is_finished() {
                if job.status.is_terminal() {
                    continue;
                }
                bar.reset();
            }

            bar.set_position(job.stage_index as u64);
            match &job.status {
                JobStatus::Pending if job.attempt > 1 => {
                    bar.set_message(format!("queued (attempt {})", job.attempt))
                }
                JobStatus::Pending => bar.set_message("queued"),
                JobStatus::Running { stage } => bar.set_message(format!("{}...", stage)),
                JobStatus::Succeeded => bar.finish_with_message("done"),
                JobStatus::Failed => {
                    let message = job
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "failed".to_string());
                    bar.abandon_with_message(message);
                }
            }
        }
    }
}

async fn wait_for_enter() -> Result<()> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| ())
    })
    .await
    .map_err(|e| Error::Other(format!("stdin reader failed: {}", e)))??;
    Ok(())
}

/// Run an ingestion batch to completion and print the outcome.
///
/// Ctrl-C resets the pipeline, cancelling in-flight calls.
pub async fn run_ingest(
    pipeline: &IngestionPipeline,
    items: Vec<IngestItem>,
    paused: bool,
) -> Result<()> {
    if paused {
        pipeline.set_paused(true);
    }
    let sink = pipeline.progress();
    let ids = pipeline.submit(items)?;
    info!(count = ids.len(), "Ingestion queued");

    if paused {
        println!("{} items queued. Press Enter to start.", ids.len());
        wait_for_enter().await?;
        pipeline.set_paused(false);
    }

    let view = ProgressView::new().follow(sink, &ids);
    tokio::select! {
        _ = view => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling running items");
            pipeline.reset().await;
            return Err(Error::Cancelled);
        }
    }

    let records = pipeline.records();
    let failures = pipeline.failures();
    println!("Saved {} of {} templates", records.len(), ids.len());
    for record in &records {
        println!("  {}  {}", record.id, record.name);
    }
    if !failures.is_empty() {
        println!("Failed:");
        for failure in &failures {
            println!("  {}  {}", failure.name, failure.error);
        }
    }
    Ok(())
}

/// Generate `count` images for one prompt and write them to `out`.
///
/// Ctrl-C resets the batcher, cancelling in-flight requests.
pub async fn run_generate(
    batcher: &GenerationBatcher,
    prompt: String,
    count: usize,
    references: &[PathBuf],
    out: &Path,
) -> Result<BatchReport> {
    if count == 0 {
        return Err(Error::validation("count must be at least 1"));
    }
    if prompt.trim().is_empty() {
        return Err(Error::validation("prompt must not be empty"));
    }

    let mut reference_images = Vec::with_capacity(references.len());
    for path in references {
        reference_images.push(ImageData::from_file(path).await?);
    }
    let requests: Vec<GenerationRequest> = (0..count)
        .map(|_| GenerationRequest {
            prompt: prompt.clone(),
            references: reference_images.clone(),
        })
        .collect();

    let stop = CancellationToken::new();
    let view = tokio::spawn(ProgressView::new().follow_until(batcher.progress(), stop.clone()));
    let report = tokio::select! {
        report = batcher.run(requests) => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling running requests");
            batcher.reset().await;
            Err(Error::Cancelled)
        }
    };
    stop.cancel();
    if let Err(e) = view.await {
        warn!(error = %e, "Progress view stopped unexpectedly");
    }
    let report = report?;
    batcher.discard(&report);

    tokio::fs::create_dir_all(out).await?;
    for image in &report.succeeded {
        let path = out.join(format!("{:03}.{}", image.index, image.image.extension()));
        tokio::fs::write(&path, &image.image.data).await?;
        println!("{}", path.display());
    }
    for failure in &report.failed {
        println!("request {} failed: {}", failure.index, failure.error);
    }
    Ok(report)
}
