//! Salesforest
//!
//! Chunked, checkpointed incremental training of a sales regression forest.
//! Rows are pulled from a Parquet table in bounded chunks, encoded concurrently
//! into calendar + categorical features, and applied to a growing random
//! forest by a single writer that checkpoints after every chunk.
//!
//! # Architecture
//!
//! - **Encode**: append-only label vocabularies and the chunk encoder
//! - **Model**: CART regression trees and a forest that grows by capacity
//! - **I/O**: Parquet chunk sources and the checkpoint blob, both on object_store
//! - **Pipeline**: bounded encode pool feeding the single-writer applier, with metrics
//! - **Validate**: held-out scoring of the trained model
//!
//! # Usage
//!
//! ```no_run
//! use salesforest::{run, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let (summary, validation) = run(&config).await?;
//!     println!("{}\n{}", summary, validation);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod data;
pub mod encode;
pub mod error;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod validate;

pub use config::{ApplyOrder, Config};
pub use data::{Chunk, EncodedChunk, FeatureRow, Row};
pub use encode::{ChunkEncoder, EncodeMode, Field, Vocabularies, Vocabulary};
pub use error::{Error, TrainingError};
pub use io::{Checkpoint, CheckpointStore, ChunkSource, LoadOutcome, MemoryChunkSource, ParquetChunkSource};
pub use model::{ForestParams, ForestRegressor, IncrementalRegressor};
pub use pipeline::{Metrics, OrchestratorConfig, TrainingOrchestrator, TrainingStage, TrainingSummary};
pub use validate::{predict_one, validate, ValidationResult};

use anyhow::{Context, Result};
use config::CheckpointConfig;
use std::sync::Arc;

/// Stream the configured source into the checkpointed model.
pub async fn run_training(config: &Config) -> Result<TrainingSummary> {
    let checkpoints = Arc::new(
        CheckpointStore::open(&config.checkpoint)
            .with_context(|| format!("Failed to open checkpoint {}", config.checkpoint.uri))?,
    );

    tracing::info!("Opening source {}", config.source.uri);
    let source = ParquetChunkSource::open(&config.source)
        .await
        .map_err(|e| TrainingError::new(TrainingStage::Dispatching, e))?;

    let orchestrator = TrainingOrchestrator::new(checkpoints, OrchestratorConfig::from_config(config));
    let summary = orchestrator.run(source).await?;
    Ok(summary)
}

/// Load the checkpoint a previous training run left behind.
pub async fn load_checkpoint(config: &CheckpointConfig) -> Result<Checkpoint> {
    let store = CheckpointStore::open(config)
        .with_context(|| format!("Failed to open checkpoint {}", config.uri))?;
    let outcome = store
        .load()
        .await
        .map_err(|e| TrainingError::new(TrainingStage::Restoring, e))?;
    match outcome {
        LoadOutcome::Restored(checkpoint) => Ok(*checkpoint),
        LoadOutcome::ColdStart => anyhow::bail!("No checkpoint found at {}", config.uri),
    }
}

/// Score the configured validation set against the stored checkpoint.
pub async fn run_validation(config: &Config) -> Result<ValidationResult> {
    let checkpoint = load_checkpoint(&config.checkpoint).await?;

    let mut rows = config.validation.inline_rows()?;
    if let Some(path) = &config.validation.path {
        let extra = read_all_rows(path, config)
            .await
            .with_context(|| format!("Failed to read validation rows from {}", path))?;
        rows.extend(extra);
    }
    tracing::info!("Validating {} rows", rows.len());

    let result = validate(&checkpoint.model, &checkpoint.vocabularies, &rows)
        .map_err(|e| TrainingError::new(TrainingStage::Validation, e))?;

    if let Some(path) = &config.validation.report_path {
        if let Err(e) = result.save_to_file(path) {
            tracing::warn!("Failed to save validation report to {}: {}", path, e);
        }
    }

    Ok(result)
}

/// Train, then validate.
pub async fn run(config: &Config) -> Result<(TrainingSummary, ValidationResult)> {
    config.validate()?;

    tracing::info!("Starting training run");
    let summary = run_training(config).await?;
    tracing::info!("Training complete: {}", summary);

    let result = run_validation(config).await?;
    tracing::info!(
        "Validation complete: {} rows, MAE {:.4}, RMSE {:.4}",
        result.len(),
        result.mae,
        result.rmse
    );
    Ok((summary, result))
}

/// Read a whole Parquet table with the source column mapping and no date filter.
async fn read_all_rows(uri: &str, config: &Config) -> Result<Vec<Row>> {
    let source_config = config::SourceConfig {
        uri: uri.to_string(),
        since: None,
        ..config.source.clone()
    };
    let mut source = ParquetChunkSource::open(&source_config).await?;
    let mut rows = Vec::new();
    while let Some(chunk) = source.next_chunk().await? {
        rows.extend(chunk.rows);
    }
    Ok(rows)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::parse_timestamp;

    fn local_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.checkpoint.uri = dir.path().join("model.ckpt").display().to_string();
        config.training.enable_metrics = false;
        config
    }

    #[tokio::test]
    async fn test_validation_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(&dir);

        let err = run_validation(&config).await.unwrap_err();
        assert!(err.to_string().contains("No checkpoint found"));
    }

    #[tokio::test]
    async fn test_validation_against_local_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config(&dir);
        config.validation.report_path = Some(dir.path().join("report.json").display().to_string());

        let row = |date: &str, location: &str, sku: &str, q: f64| {
            Row::new(parse_timestamp(date).unwrap(), location, sku, q)
        };
        let source = MemoryChunkSource::new(vec![
            vec![
                row("2024-01-01", "ESQUEL", "138202", 10.0),
                row("2024-01-02", "BARILOCHE", "609400", 5.0),
            ],
            vec![
                row("2024-02-01", "ESQUEL", "609400", 2.0),
                row("2024-02-02", "BARILOCHE", "138202", -1.0),
            ],
        ]);
        let checkpoints = Arc::new(CheckpointStore::open(&config.checkpoint).unwrap());
        TrainingOrchestrator::new(checkpoints, OrchestratorConfig::from_config(&config))
            .run(source)
            .await
            .unwrap();

        // The default rows include labels this model never saw
        let err = run_validation(&config).await.unwrap_err();
        assert!(err.to_string().contains("validation stage failed"));

        config.validation.rows.retain(|r| r.location == "ESQUEL" && r.sku == "138202");
        config.validation.rows.truncate(1);
        let result = run_validation(&config).await.unwrap();
        assert_eq!(result.len(), 1);
        assert!(dir.path().join("report.json").exists());

        let checkpoint = load_checkpoint(&config.checkpoint).await.unwrap();
        assert_eq!(checkpoint.model.capacity(), 120);
    }
}
