//! The single writer: applies encoded chunks to the model and checkpoints.
//!
//! The applier task exclusively owns the [`TrainingContext`]. Encoders never
//! see it; they only read the vocabulary snapshot the applier publishes after
//! each step.

use crate::config::ApplyOrder;
use crate::encode::{PreparedChunk, Vocabularies};
use crate::error::{Error, Result, TrainingError};
use crate::io::{Checkpoint, CheckpointStore, CheckpointView, TrainingProgress};
use crate::model::{ForestRegressor, IncrementalRegressor};
use crate::pipeline::{Metrics, TrainingStage};
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Mutable training state.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    pub model: ForestRegressor,
    pub vocabularies: Vocabularies,
    pub progress: TrainingProgress,

    /// Whether the state came from a checkpoint
    pub restored: bool,
}

impl TrainingContext {
    /// Fresh state for a cold start.
    pub fn fresh(model: ForestRegressor) -> Self {
        Self {
            model,
            vocabularies: Vocabularies::new(),
            progress: TrainingProgress::default(),
            restored: false,
        }
    }

    /// State restored from a checkpoint.
    pub fn restored(checkpoint: Checkpoint) -> Self {
        Self {
            model: checkpoint.model,
            vocabularies: checkpoint.vocabularies,
            progress: checkpoint.progress,
            restored: true,
        }
    }
}

/// A finished (or failed) encoding, sent from the pool to the applier.
#[derive(Debug)]
pub struct EncodeOutcome {
    pub sequence: u64,
    pub rows: usize,
    pub result: Result<PreparedChunk>,
}

/// Applier settings.
#[derive(Debug, Clone, Copy)]
pub struct ApplierConfig {
    pub order: ApplyOrder,
    pub capacity_increment: usize,

    /// First sequence number the dispatcher submits
    pub first_sequence: u64,
}

/// What the applier did during one run.
#[derive(Debug)]
pub struct ApplierReport {
    pub context: TrainingContext,
    pub chunks_applied: u64,
    pub chunks_skipped: u64,
    pub chunks_failed: u64,
    pub rows_applied: u64,
}

/// Result of one apply step, produced on a blocking thread.
struct Applied {
    context: TrainingContext,
    blob: Bytes,
    trees_added: usize,
    new_locations: usize,
    new_skus: usize,
    fit_time: Duration,
}

pub struct Applier {
    context: Option<TrainingContext>,
    checkpoints: Arc<CheckpointStore>,
    snapshot: watch::Sender<Arc<Vocabularies>>,
    metrics: Arc<Metrics>,
    config: ApplierConfig,

    /// Completions that arrived ahead of `next_admit` (submission order only)
    pending: BTreeMap<u64, EncodeOutcome>,
    next_admit: u64,

    applied: u64,
    skipped: u64,
    failed: u64,
    rows: u64,
}

impl Applier {
    pub fn new(
        context: TrainingContext,
        checkpoints: Arc<CheckpointStore>,
        snapshot: watch::Sender<Arc<Vocabularies>>,
        metrics: Arc<Metrics>,
        config: ApplierConfig,
    ) -> Self {
        Self {
            context: Some(context),
            checkpoints,
            snapshot,
            metrics,
            config,
            pending: BTreeMap::new(),
            next_admit: config.first_sequence,
            applied: 0,
            skipped: 0,
            failed: 0,
            rows: 0,
        }
    }

    /// Consume completions until the dispatcher hangs up, then flush.
    pub async fn run(
        mut self,
        mut outcomes: mpsc::Receiver<EncodeOutcome>,
    ) -> std::result::Result<ApplierReport, TrainingError> {
        while let Some(outcome) = outcomes.recv().await {
            self.receive(outcome).await?;
        }
        self.flush()
    }

    async fn receive(&mut self, outcome: EncodeOutcome) -> std::result::Result<(), TrainingError> {
        match self.config.order {
            ApplyOrder::Completion => self.admit(outcome).await,
            ApplyOrder::Submission => {
                debug!(
                    "Chunk {} completed, waiting for {} ({} buffered)",
                    outcome.sequence,
                    self.next_admit,
                    self.pending.len()
                );
                self.pending.insert(outcome.sequence, outcome);
                self.metrics.record_reorder_depth(self.pending.len() as u64);
                while let Some(next) = self.pending.remove(&self.next_admit) {
                    self.next_admit += 1;
                    self.admit(next).await?;
                }
                Ok(())
            }
        }
    }

    /// Apply one completion: skip it, or fit, checkpoint and publish.
    async fn admit(&mut self, outcome: EncodeOutcome) -> std::result::Result<(), TrainingError> {
        let sequence = outcome.sequence;
        let prepared = match outcome.result {
            Ok(prepared) => prepared,
            Err(e) if e.is_chunk_local() => {
                warn!("Skipping chunk {}: {}", sequence, e);
                println!("Chunk {} skipped ({} rows): {}", sequence, outcome.rows, e);
                self.metrics.add_chunk_failed();
                self.failed += 1;
                return Ok(());
            }
            Err(e) => return Err(TrainingError::new(TrainingStage::Encoding, e)),
        };

        if prepared.is_empty() {
            info!("Chunk {} is empty, skipping", sequence);
            self.metrics.add_chunk_skipped();
            self.skipped += 1;
            return Ok(());
        }

        let rows = prepared.len();
        let context = self
            .context
            .take()
            .ok_or_else(|| TrainingError::new(TrainingStage::Applying, Error::model("training context lost")))?;
        let increment = self.config.capacity_increment;

        let applied = tokio::task::spawn_blocking(move || apply(context, prepared, increment))
            .await
            .map_err(|e| {
                TrainingError::new(
                    TrainingStage::Applying,
                    Error::model(format!("apply task failed: {}", e)),
                )
            })??;
        self.metrics.add_fit_time(applied.fit_time);

        let start = Instant::now();
        let saved = self
            .checkpoints
            .save_encoded(applied.blob)
            .await
            .map_err(|e| TrainingError::new(TrainingStage::Checkpointing, e))?;
        self.metrics.add_checkpoint_time(start.elapsed());
        self.metrics.add_checkpoint_bytes(saved.bytes as u64);

        let context = applied.context;
        if applied.new_locations > 0 || applied.new_skus > 0 {
            self.snapshot
                .send_replace(Arc::new(context.vocabularies.clone()));
        }

        self.applied += 1;
        self.rows += rows as u64;
        self.metrics.add_chunk_applied();

        info!(
            "Applied chunk {}: {} rows, +{} trees, +{} locations, +{} SKUs, checkpoint {} bytes",
            sequence,
            rows,
            applied.trees_added,
            applied.new_locations,
            applied.new_skus,
            saved.bytes
        );
        println!(
            "Chunk {} applied: {} rows | capacity {} | {} locations, {} SKUs | {} rows total",
            sequence,
            rows,
            context.model.capacity(),
            context.vocabularies.location.len(),
            context.vocabularies.sku.len(),
            context.progress.rows_applied
        );

        self.context = Some(context);
        Ok(())
    }

    /// Discard completions stranded behind a sequence gap and hand back the context.
    fn flush(mut self) -> std::result::Result<ApplierReport, TrainingError> {
        debug!("Stage -> {}", TrainingStage::Flush);
        if !self.pending.is_empty() {
            let stranded: Vec<u64> = self.pending.keys().copied().collect();
            warn!(
                "Discarding {} completions after missing chunk {}: {:?}",
                stranded.len(),
                self.next_admit,
                stranded
            );
            for _ in &stranded {
                self.metrics.add_chunk_skipped();
            }
            self.skipped += stranded.len() as u64;
        }

        let context = self.context.take().ok_or_else(|| {
            TrainingError::new(TrainingStage::Flush, Error::model("training context lost"))
        })?;
        Ok(ApplierReport {
            context,
            chunks_applied: self.applied,
            chunks_skipped: self.skipped,
            chunks_failed: self.failed,
            rows_applied: self.rows,
        })
    }
}

/// Resolve labels, grow the model and serialize the next checkpoint.
///
/// Runs on a blocking thread. Progress is only bumped once the fit succeeded.
fn apply(
    mut context: TrainingContext,
    prepared: PreparedChunk,
    increment: usize,
) -> std::result::Result<Applied, TrainingError> {
    let sequence = prepared.sequence();
    let (encoded, growth) = prepared.resolve(&mut context.vocabularies);

    let new_capacity = context.model.capacity() + increment;
    let start = Instant::now();
    let report = context
        .model
        .fit_incremental(&encoded, new_capacity)
        .map_err(|e| TrainingError::new(TrainingStage::Applying, e))?;
    let fit_time = start.elapsed();

    let progress = &mut context.progress;
    progress.chunks_applied += 1;
    progress.rows_applied += encoded.len() as u64;
    progress.next_sequence = progress.next_sequence.max(sequence + 1);
    progress.updated_at = Some(Utc::now());

    let blob = CheckpointView::new(&context.model, &context.vocabularies, &context.progress)
        .encode()
        .map_err(|e| TrainingError::new(TrainingStage::Checkpointing, e))?;

    Ok(Applied {
        context,
        blob,
        trees_added: report.trees_added,
        new_locations: growth.locations,
        new_skus: growth.skus,
        fit_time,
    })
}
