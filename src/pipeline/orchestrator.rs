//! Chunked, checkpointed training.
//!
//! ```text
//! ChunkSource ──▶ dispatcher ──▶ encode pool (buffered / buffer_unordered, spawn_blocking)
//!                                      │ EncodeOutcome
//!                                      ▼
//!                         applier task (single writer) ──▶ CheckpointStore
//!                                      │
//!                                      └── watch<Arc<Vocabularies>> ──▶ encode pool
//! ```

use crate::config::{ApplyOrder, Config};
use crate::data::Chunk;
use crate::encode::{ChunkEncoder, EncodeMode, Vocabularies};
use crate::error::{Error, Result, TrainingError};
use crate::io::{ChunkSource, CheckpointStore, LoadOutcome, TrainingProgress};
use crate::model::{ForestParams, ForestRegressor, IncrementalRegressor};
use crate::pipeline::applier::{Applier, ApplierConfig, ApplierReport, EncodeOutcome, TrainingContext};
use crate::pipeline::{Metrics, MetricsReporter, TrainingStage};
use futures::future::Either;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Chunks encoded concurrently
    pub pool_width: usize,

    pub apply_order: ApplyOrder,

    /// Per-chunk encoding deadline
    pub encode_timeout: Option<Duration>,

    /// Skip chunks a restored checkpoint has already applied
    pub resume: bool,

    /// Capacity of a cold-started model
    pub initial_capacity: usize,

    /// Capacity added per applied chunk
    pub capacity_increment: usize,

    pub forest: ForestParams,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    pub metrics_output_path: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_width: 2,
            apply_order: ApplyOrder::Submission,
            encode_timeout: None,
            resume: true,
            initial_capacity: 100,
            capacity_increment: 10,
            forest: ForestParams::default(),
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Build from the top-level configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool_width: config.training.pool_width,
            apply_order: config.training.apply_order,
            encode_timeout: config.training.encode_timeout_secs.map(Duration::from_secs),
            resume: config.training.resume,
            initial_capacity: config.model.initial_capacity,
            capacity_increment: config.model.capacity_increment,
            forest: config.model.to_params(),
            enable_metrics: config.training.enable_metrics,
            metrics_interval_secs: config.training.metrics_interval_secs,
            metrics_output_path: config.training.metrics_output_path.clone(),
        }
    }
}

/// Statistics from a training run.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Whether training continued from a checkpoint
    pub restored: bool,

    /// Chunks skipped because a previous run already applied them
    pub chunks_resumed: u64,

    /// Chunks applied during this run
    pub chunks_applied: u64,

    /// Empty chunks and chunks stranded behind a gap
    pub chunks_skipped: u64,

    /// Chunks whose encoding failed
    pub chunks_failed: u64,

    /// Rows applied during this run
    pub rows_applied: u64,

    pub capacity: usize,
    pub location_labels: usize,
    pub sku_labels: usize,

    /// Cumulative progress as stored in the checkpoint
    pub progress: TrainingProgress,
}

impl std::fmt::Display for TrainingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Applied: {} ({} rows), Skipped: {}, Failed: {}, Resumed past: {} | \
             Capacity: {} | Vocabularies: {} locations, {} SKUs | Total chunks applied: {}",
            self.chunks_applied,
            self.rows_applied,
            self.chunks_skipped,
            self.chunks_failed,
            self.chunks_resumed,
            self.capacity,
            self.location_labels,
            self.sku_labels,
            self.progress.chunks_applied
        )
    }
}

/// Items leaving the encode pool.
enum Dispatched {
    Encoded(EncodeOutcome),
    SourceFailed(Error),
}

/// Drives a training run: restore, dispatch, encode, apply, flush.
pub struct TrainingOrchestrator {
    checkpoints: Arc<CheckpointStore>,
    encoder: ChunkEncoder,
    metrics: Arc<Metrics>,
    config: OrchestratorConfig,
}

impl TrainingOrchestrator {
    /// Create an orchestrator writing to `checkpoints`.
    pub fn new(checkpoints: Arc<CheckpointStore>, config: OrchestratorConfig) -> Self {
        Self {
            checkpoints,
            encoder: ChunkEncoder::new(),
            metrics: Metrics::new(),
            config,
        }
    }

    /// Metrics collected by this orchestrator.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Train on every chunk of `source`.
    ///
    /// Chunk-local encoding failures are skipped. Any other failure stops
    /// dispatching and is returned tagged with its stage; chunks applied before
    /// it remain checkpointed.
    pub async fn run<S: ChunkSource>(&self, source: S) -> std::result::Result<TrainingSummary, TrainingError> {
        debug!("Stage -> {}", TrainingStage::Restoring);
        let context = match self
            .checkpoints
            .load()
            .await
            .map_err(|e| TrainingError::new(TrainingStage::Restoring, e))?
        {
            LoadOutcome::Restored(checkpoint) => TrainingContext::restored(*checkpoint),
            LoadOutcome::ColdStart => TrainingContext::fresh(ForestRegressor::new(
                self.config.forest,
                self.config.initial_capacity,
            )),
        };

        let resume_skip = self.resume_skip(&context);
        info!(
            "Starting training: {} (capacity {}, {} locations, {} SKUs), pool width {}, {:?} order",
            if context.restored { "restored checkpoint" } else { "cold start" },
            context.model.capacity(),
            context.vocabularies.location.len(),
            context.vocabularies.sku.len(),
            self.config.pool_width,
            self.config.apply_order
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(context.vocabularies.clone()));
        let (outcome_tx, outcome_rx) = mpsc::channel(self.config.pool_width.max(1) * 2);

        let applier = Applier::new(
            context,
            self.checkpoints.clone(),
            snapshot_tx,
            self.metrics.clone(),
            ApplierConfig {
                order: self.config.apply_order,
                capacity_increment: self.config.capacity_increment,
                first_sequence: resume_skip,
            },
        );
        let applier_handle = tokio::spawn(applier.run(outcome_rx));

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(self.metrics.clone(), self.config.metrics_interval_secs);
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        debug!("Stage -> {}", TrainingStage::Dispatching);
        let dispatched = self.dispatch(source, resume_skip, snapshot_rx, outcome_tx).await;

        // The applier drains and flushes once the dispatcher hangs up
        let applied = applier_handle.await.map_err(|e| {
            TrainingError::new(
                TrainingStage::Applying,
                Error::model(format!("applier task failed: {}", e)),
            )
        })?;

        // Shutdown metrics reporter
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        let report = applied?;
        dispatched?;
        debug!("Stage -> {}", TrainingStage::Done);

        let summary = summarize(report, resume_skip);
        info!("Training complete: {}", summary);

        if self.config.enable_metrics {
            let reporter = MetricsReporter::new(self.metrics.clone(), self.config.metrics_interval_secs);
            reporter.print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                if let Err(e) = self.metrics.snapshot().save_to_file(path) {
                    warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        Ok(summary)
    }

    /// Number of leading source chunks to skip.
    fn resume_skip(&self, context: &TrainingContext) -> u64 {
        if !context.restored || !self.config.resume {
            return 0;
        }
        match self.config.apply_order {
            ApplyOrder::Submission => {
                let skip = context.progress.next_sequence;
                if skip > 0 {
                    info!("Resuming: skipping {} chunks already applied", skip);
                }
                skip
            }
            ApplyOrder::Completion => {
                warn!("Resume skipping is disabled in completion order; re-reading the whole source");
                0
            }
        }
    }

    /// Pull chunks, encode them on the pool and forward completions to the applier.
    ///
    /// Each chunk is encoded against the vocabulary snapshot current when it is
    /// submitted. Returns once the source is exhausted, the source fails, or
    /// the applier stops accepting completions.
    async fn dispatch<S: ChunkSource>(
        &self,
        mut source: S,
        resume_skip: u64,
        snapshot: watch::Receiver<Arc<Vocabularies>>,
        outcomes: mpsc::Sender<EncodeOutcome>,
    ) -> std::result::Result<(), TrainingError> {
        let chunks = stream::unfold(Some(&mut source), move |state| async move {
            let source = state?;
            loop {
                match source.next_chunk().await {
                    Ok(Some(chunk)) if chunk.sequence < resume_skip => continue,
                    Ok(Some(chunk)) => return Some((Ok(chunk), Some(source))),
                    Ok(None) => return None,
                    // Nothing is read past a source failure
                    Err(e) => return Some((Err(e), None)),
                }
            }
        });

        let encoder = self.encoder;
        let timeout = self.config.encode_timeout;
        let metrics = self.metrics.clone();

        let pending = chunks.map(|item: Result<Chunk>| {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => return Either::Left(async move { Dispatched::SourceFailed(e) }),
            };
            metrics.add_chunk_dispatched();
            metrics.add_rows_read(chunk.len() as u64);
            let vocabs = snapshot.borrow().clone();
            let metrics = metrics.clone();
            Either::Right(async move {
                Dispatched::Encoded(encode_chunk(encoder, chunk, vocabs, timeout, metrics).await)
            })
        });

        // In submission order a slow chunk holds back everything after it, so
        // look-ahead is capped at the pool width instead of growing behind it
        let pool_width = self.config.pool_width.max(1);
        let mut encoded = Box::pin(match self.config.apply_order {
            ApplyOrder::Submission => Either::Left(pending.buffered(pool_width)),
            ApplyOrder::Completion => Either::Right(pending.buffer_unordered(pool_width)),
        });

        while let Some(item) = encoded.next().await {
            match item {
                Dispatched::SourceFailed(e) => {
                    return Err(TrainingError::new(TrainingStage::Dispatching, e));
                }
                Dispatched::Encoded(outcome) => {
                    if outcome.result.is_ok() {
                        self.metrics.add_chunk_encoded();
                    }
                    if outcomes.send(outcome).await.is_err() {
                        debug!("Applier stopped, halting dispatch");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Encode one chunk on the blocking pool, honoring the optional deadline.
async fn encode_chunk(
    encoder: ChunkEncoder,
    chunk: Chunk,
    vocabs: Arc<Vocabularies>,
    timeout: Option<Duration>,
    metrics: Arc<Metrics>,
) -> EncodeOutcome {
    let sequence = chunk.sequence;
    let rows = chunk.len();
    debug!("Stage -> {} (chunk {}, {} rows)", TrainingStage::Encoding, sequence, rows);

    let task = tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        let result = encoder.prepare(&chunk, &vocabs, EncodeMode::Training);
        (result, start.elapsed())
    });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                return EncodeOutcome {
                    sequence,
                    rows,
                    result: Err(Error::EncodeTimeout {
                        sequence,
                        timeout_ms: limit.as_millis() as u64,
                    }),
                };
            }
        },
        None => task.await,
    };

    let result = match joined {
        Ok((result, elapsed)) => {
            metrics.add_encode_time(elapsed);
            result
        }
        Err(e) => Err(Error::encoding(sequence, format!("encoder task failed: {}", e))),
    };
    EncodeOutcome {
        sequence,
        rows,
        result,
    }
}

fn summarize(report: ApplierReport, resume_skip: u64) -> TrainingSummary {
    let context = report.context;
    TrainingSummary {
        restored: context.restored,
        chunks_resumed: resume_skip,
        chunks_applied: report.chunks_applied,
        chunks_skipped: report.chunks_skipped,
        chunks_failed: report.chunks_failed,
        rows_applied: report.rows_applied,
        capacity: context.model.capacity(),
        location_labels: context.vocabularies.location.len(),
        sku_labels: context.vocabularies.sku.len(),
        progress: context.progress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_config_from_config() {
        let mut config = Config::default();
        config.training.pool_width = 8;
        config.training.apply_order = ApplyOrder::Completion;
        config.model.capacity_increment = 5;
        config.model.seed = 7;

        let oc = OrchestratorConfig::from_config(&config);
        assert_eq!(oc.pool_width, 8);
        assert_eq!(oc.apply_order, ApplyOrder::Completion);
        assert_eq!(oc.capacity_increment, 5);
        assert_eq!(oc.forest.seed, 7);
        assert_eq!(oc.initial_capacity, 100);
    }

    #[test]
    fn test_summary_display() {
        let summary = TrainingSummary {
            restored: false,
            chunks_resumed: 0,
            chunks_applied: 3,
            chunks_skipped: 1,
            chunks_failed: 1,
            rows_applied: 300,
            capacity: 130,
            location_labels: 4,
            sku_labels: 12,
            progress: TrainingProgress::default(),
        };
        let display = summary.to_string();
        assert!(display.contains("Applied: 3 (300 rows)"));
        assert!(display.contains("Capacity: 130"));
    }
}
