use anyhow::Context;
use atelier::cli::{self, Cli, Command};
use atelier::config::AppConfig;
use atelier::generate::GenerationBatcher;
use atelier::inference::{HttpInferenceClient, InferenceClient};
use atelier::ingest::IngestionPipeline;
use atelier::logging;
use clap::Parser;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let (logging, _guard) = logging::init_logging(&config.log_dir)?;
    if let Some(filter) = &cli.log_filter {
        logging.set_filter(filter)?;
    }
    logging.cleanup().await;

    let client: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(&config.api)?);

    match cli.command {
        Command::Ingest { manifest, paused } => {
            let items = cli::load_manifest(&manifest)
                .await
                .with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
            let pipeline = IngestionPipeline::new(client, config.ingest)?;
            cli::run_ingest(&pipeline, items, paused).await?;
        }
        Command::Generate {
            prompt,
            count,
            references,
            out,
        } => {
            let batcher = GenerationBatcher::new(client, config.generate)?;
            let report = cli::run_generate(&batcher, prompt, count, &references, &out).await?;
            if !report.is_complete() {
                anyhow::bail!(
                    "{} of {} images failed",
                    report.failed.len(),
                    report.total()
                );
            }
        }
    }

    tracing::info!("atelier finished");
    Ok(())
}
