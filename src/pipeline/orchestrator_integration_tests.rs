//! End-to-end tests for the training orchestrator.
//!
//! Tests cover:
//! 1. Vocabulary growth and capacity across chunks
//! 2. Pool width does not change the result in submission order
//! 3. Failed, timed-out and empty chunks are skipped
//! 4. A slow chunk does not let completions pile up behind it
//! 5. Resume after a source failure
//! 6. Corrupt checkpoints and failed checkpoint writes are fatal

use crate::config::ApplyOrder;
use crate::data::{parse_timestamp, Chunk, Row};
use crate::encode::{ChunkEncoder, Vocabularies};
use crate::error::Error;
use crate::io::{Checkpoint, CheckpointStore, LoadOutcome, MemoryChunkSource};
use crate::model::IncrementalRegressor;
use crate::pipeline::{OrchestratorConfig, TrainingOrchestrator, TrainingStage};
use crate::validate::validate;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    CopyOptions, GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
    PutMultipartOptions, PutOptions, PutPayload, PutResult,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn row(date: &str, location: &str, sku: &str, quantity: f64) -> Row {
    Row::new(parse_timestamp(date).unwrap(), location, sku, quantity)
}

fn memory_checkpoints() -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::new(
        Arc::new(InMemory::new()),
        Path::from("checkpoints/model.ckpt"),
    ))
}

fn test_config(pool_width: usize, apply_order: ApplyOrder) -> OrchestratorConfig {
    OrchestratorConfig {
        pool_width,
        apply_order,
        enable_metrics: false,
        ..Default::default()
    }
}

async fn load(checkpoints: &CheckpointStore) -> Checkpoint {
    match checkpoints.load().await.unwrap() {
        LoadOutcome::Restored(checkpoint) => *checkpoint,
        LoadOutcome::ColdStart => panic!("expected a checkpoint"),
    }
}

/// Deterministic synthetic sales spread over a few labels.
fn synthetic_chunks(chunks: usize, rows_per_chunk: usize) -> Vec<Vec<Row>> {
    let locations = ["ESQUEL", "BARILOCHE", "TRELEW", "USHUAIA", "RIO GALLEGOS"];
    let skus = ["138202", "609400", "100001", "100002", "100003", "100004"];
    (0..chunks)
        .map(|c| {
            (0..rows_per_chunk)
                .map(|r| {
                    let i = c * rows_per_chunk + r;
                    let day = 1 + (i % 28);
                    let month = 1 + (i / 28) % 12;
                    let date = format!("2024-{:02}-{:02}", month, day);
                    // Later chunks introduce later labels
                    let location = locations[(i * 7 + c) % (2 + c.min(3))];
                    let sku = skus[(i * 3) % (2 + c.min(4))];
                    let quantity = ((i * 37) % 23) as f64 - 5.0;
                    row(&date, location, sku, quantity)
                })
                .collect()
        })
        .collect()
}

fn sorted_labels(vocabs: &Vocabularies) -> (Vec<String>, Vec<String>) {
    let mut locations = vocabs.location.labels().to_vec();
    let mut skus = vocabs.sku.labels().to_vec();
    locations.sort();
    skus.sort();
    (locations, skus)
}

/// A chunk whose encoding takes far longer than a one-row chunk.
fn heavy_chunk(rows: usize, distinct_locations: usize) -> Vec<Row> {
    let ts = parse_timestamp("2024-03-01").unwrap();
    (0..rows)
        .map(|i| {
            let location = format!("L{}", i % distinct_locations);
            Row::new(ts, location, "138202", (i % 17) as f64)
        })
        .collect()
}

/// In-memory store whose `fail_on`-th put (1-based) fails.
#[derive(Debug)]
struct FailingPutStore {
    inner: InMemory,
    puts: AtomicUsize,
    fail_on: usize,
}

impl FailingPutStore {
    fn new(fail_on: usize) -> Self {
        Self {
            inner: InMemory::new(),
            puts: AtomicUsize::new(0),
            fail_on,
        }
    }
}

impl fmt::Display for FailingPutStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FailingPutStore(fail_on={})", self.fail_on)
    }
}

#[async_trait]
impl ObjectStore for FailingPutStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(object_store::Error::Generic {
                store: "FailingPutStore",
                source: format!("put {} rejected", n).into(),
            });
        }
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOptions,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    fn delete_stream(
        &self,
        locations: BoxStream<'static, object_store::Result<Path>>,
    ) -> BoxStream<'static, object_store::Result<Path>> {
        self.inner.delete_stream(locations)
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy_opts(&self, from: &Path, to: &Path, options: CopyOptions) -> object_store::Result<()> {
        self.inner.copy_opts(from, to, options).await
    }
}

#[tokio::test]
async fn test_two_chunks_grow_vocabularies_and_capacity() {
    let checkpoints = memory_checkpoints();
    let source = MemoryChunkSource::new(vec![
        vec![row("2024-01-01", "ESQUEL", "138202", 10.0)],
        vec![row("2024-01-02", "BARILOCHE", "609400", 5.0)],
    ]);

    let orchestrator =
        TrainingOrchestrator::new(checkpoints.clone(), test_config(2, ApplyOrder::Submission));
    let summary = orchestrator.run(source).await.unwrap();

    assert!(!summary.restored);
    assert_eq!(summary.chunks_applied, 2);
    assert_eq!(summary.rows_applied, 2);
    assert_eq!(summary.capacity, 120);
    assert_eq!(summary.progress.next_sequence, 2);

    let checkpoint = load(&checkpoints).await;
    assert_eq!(checkpoint.model.capacity(), 120);
    assert_eq!(checkpoint.vocabularies.location.lookup("ESQUEL"), Some(0));
    assert_eq!(checkpoint.vocabularies.location.lookup("BARILOCHE"), Some(1));
    assert_eq!(checkpoint.vocabularies.sku.lookup("138202"), Some(0));
    assert_eq!(checkpoint.vocabularies.sku.lookup("609400"), Some(1));

    let rows = vec![row("2024-07-17", "ESQUEL", "138202", -2.88)];
    let result = validate(&checkpoint.model, &checkpoint.vocabularies, &rows).unwrap();
    let scored = &result.rows[0];
    assert!((scored.residual - (-2.88 - scored.prediction)).abs() < 1e-12);
    assert!((5.0..=10.0).contains(&scored.prediction));

    let metrics = orchestrator.metrics().snapshot();
    assert_eq!(metrics.chunks_applied, 2);
    assert_eq!(metrics.rows_read, 2);
}

#[tokio::test]
async fn test_pool_width_does_not_change_submission_order_result() {
    let chunks = synthetic_chunks(8, 20);
    let held_out: Vec<Row> = chunks.iter().flat_map(|c| c.iter().take(2).cloned()).collect();

    let mut results = Vec::new();
    for width in [1, 4] {
        let checkpoints = memory_checkpoints();
        let orchestrator =
            TrainingOrchestrator::new(checkpoints.clone(), test_config(width, ApplyOrder::Submission));
        orchestrator
            .run(MemoryChunkSource::new(chunks.clone()))
            .await
            .unwrap();

        let checkpoint = load(&checkpoints).await;
        let encoded = ChunkEncoder::new()
            .encode_known(&Chunk::new(0, held_out.clone()), &checkpoint.vocabularies)
            .unwrap();
        let predictions = checkpoint.model.predict(encoded.features.view()).unwrap();
        results.push((checkpoint, predictions));
    }

    let (narrow, narrow_predictions) = &results[0];
    let (wide, wide_predictions) = &results[1];
    assert_eq!(narrow.vocabularies, wide.vocabularies);
    assert_eq!(narrow.model.capacity(), 180);
    assert_eq!(wide.model.capacity(), 180);
    assert_eq!(narrow_predictions, wide_predictions);
}

#[tokio::test]
async fn test_completion_order_learns_same_labels() {
    let chunks = synthetic_chunks(6, 15);

    let submission = memory_checkpoints();
    TrainingOrchestrator::new(submission.clone(), test_config(1, ApplyOrder::Submission))
        .run(MemoryChunkSource::new(chunks.clone()))
        .await
        .unwrap();

    let completion = memory_checkpoints();
    let summary = TrainingOrchestrator::new(completion.clone(), test_config(4, ApplyOrder::Completion))
        .run(MemoryChunkSource::new(chunks))
        .await
        .unwrap();
    assert_eq!(summary.chunks_applied, 6);

    let a = load(&submission).await;
    let b = load(&completion).await;
    assert_eq!(sorted_labels(&a.vocabularies), sorted_labels(&b.vocabularies));
    assert_eq!(a.model.capacity(), b.model.capacity());
    assert_eq!(b.progress.chunks_applied, 6);
}

#[tokio::test]
async fn test_failed_chunk_is_skipped() {
    let checkpoints = memory_checkpoints();
    let source = MemoryChunkSource::new(vec![
        vec![row("2024-01-01", "ESQUEL", "138202", 10.0)],
        vec![row("2024-01-02", "TRELEW", "100001", f64::NAN)],
        vec![row("2024-01-03", "BARILOCHE", "609400", 5.0)],
    ]);

    let summary = TrainingOrchestrator::new(checkpoints.clone(), test_config(2, ApplyOrder::Submission))
        .run(source)
        .await
        .unwrap();

    assert_eq!(summary.chunks_applied, 2);
    assert_eq!(summary.chunks_failed, 1);
    assert_eq!(summary.capacity, 120);

    let checkpoint = load(&checkpoints).await;
    assert!(!checkpoint.vocabularies.location.contains("TRELEW"));
    assert_eq!(checkpoint.vocabularies.location.lookup("BARILOCHE"), Some(1));
    assert_eq!(checkpoint.progress.next_sequence, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_chunk_is_skipped_without_stalling() {
    let checkpoints = memory_checkpoints();
    let source = MemoryChunkSource::new(vec![
        vec![row("2024-01-01", "ESQUEL", "138202", 10.0)],
        heavy_chunk(400_000, 400_000),
        vec![row("2024-01-03", "BARILOCHE", "609400", 5.0)],
    ]);
    let config = OrchestratorConfig {
        encode_timeout: Some(Duration::from_millis(5)),
        ..test_config(2, ApplyOrder::Submission)
    };

    let summary = TrainingOrchestrator::new(checkpoints.clone(), config)
        .run(source)
        .await
        .unwrap();

    assert_eq!(summary.chunks_applied, 2);
    assert_eq!(summary.chunks_failed, 1);
    assert_eq!(summary.capacity, 120);
    assert_eq!(summary.location_labels, 2);

    let checkpoint = load(&checkpoints).await;
    assert_eq!(checkpoint.progress.next_sequence, 3);
    assert_eq!(checkpoint.vocabularies.location.lookup("BARILOCHE"), Some(1));
    assert!(!checkpoint.vocabularies.location.contains("L0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_chunk_keeps_reorder_buffer_bounded() {
    let mut chunks = vec![heavy_chunk(5_000, 500)];
    chunks.extend(synthetic_chunks(30, 1));

    let mut config = test_config(4, ApplyOrder::Submission);
    config.forest.tree.max_depth = Some(3);
    let orchestrator = TrainingOrchestrator::new(memory_checkpoints(), config);
    let summary = orchestrator.run(MemoryChunkSource::new(chunks)).await.unwrap();

    assert_eq!(summary.chunks_applied, 31);
    assert_eq!(summary.capacity, 100 + 31 * 10);
    // Completions reach the applier in sequence, so nothing waits behind chunk 0
    assert_eq!(orchestrator.metrics().snapshot().reorder_peak, 1);
}

#[tokio::test]
async fn test_empty_chunk_does_not_grow_capacity() {
    let checkpoints = memory_checkpoints();
    let source = MemoryChunkSource::new(vec![
        vec![row("2024-01-01", "ESQUEL", "138202", 10.0)],
        Vec::new(),
        vec![row("2024-01-03", "BARILOCHE", "609400", 5.0)],
    ]);

    let summary = TrainingOrchestrator::new(checkpoints, test_config(1, ApplyOrder::Submission))
        .run(source)
        .await
        .unwrap();

    assert_eq!(summary.chunks_applied, 2);
    assert_eq!(summary.chunks_skipped, 1);
    assert_eq!(summary.capacity, 120);
}

#[tokio::test]
async fn test_resume_after_source_failure() {
    let checkpoints = memory_checkpoints();
    let chunks = synthetic_chunks(4, 10);

    let err = TrainingOrchestrator::new(checkpoints.clone(), test_config(1, ApplyOrder::Submission))
        .run(MemoryChunkSource::new(chunks.clone()).with_failure_at(2))
        .await
        .unwrap_err();
    assert_eq!(err.stage, TrainingStage::Dispatching);
    assert!(matches!(err.source, Error::SourceConnectivity(_)));

    let partial = load(&checkpoints).await;
    assert_eq!(partial.progress.chunks_applied, 2);
    assert_eq!(partial.progress.next_sequence, 2);
    assert_eq!(partial.model.capacity(), 120);

    let summary = TrainingOrchestrator::new(checkpoints.clone(), test_config(1, ApplyOrder::Submission))
        .run(MemoryChunkSource::new(chunks))
        .await
        .unwrap();
    assert!(summary.restored);
    assert_eq!(summary.chunks_resumed, 2);
    assert_eq!(summary.chunks_applied, 2);
    assert_eq!(summary.capacity, 140);
    assert_eq!(summary.progress.chunks_applied, 4);
    assert_eq!(summary.progress.next_sequence, 4);
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_fatal() {
    let checkpoints = memory_checkpoints();
    checkpoints
        .save_encoded(Bytes::from_static(b"not a checkpoint"))
        .await
        .unwrap();

    let err = TrainingOrchestrator::new(checkpoints, test_config(2, ApplyOrder::Submission))
        .run(MemoryChunkSource::new(vec![vec![row("2024-01-01", "ESQUEL", "138202", 1.0)]]))
        .await
        .unwrap_err();
    assert_eq!(err.stage, TrainingStage::Restoring);
    assert!(matches!(err.source, Error::CheckpointCorrupt { .. }));
}

#[tokio::test]
async fn test_checkpoint_write_failure_is_fatal_and_keeps_last_good() {
    let store = Arc::new(FailingPutStore::new(3));
    let checkpoints = Arc::new(CheckpointStore::new(
        store.clone(),
        Path::from("checkpoints/model.ckpt"),
    ));

    let err = TrainingOrchestrator::new(checkpoints.clone(), test_config(1, ApplyOrder::Submission))
        .run(MemoryChunkSource::new(synthetic_chunks(4, 10)))
        .await
        .unwrap_err();
    assert_eq!(err.stage, TrainingStage::Checkpointing);
    assert!(matches!(err.source, Error::CheckpointStorage(_)));
    assert_eq!(store.puts.load(Ordering::SeqCst), 3);

    let last_good = load(&checkpoints).await;
    assert_eq!(last_good.progress.chunks_applied, 2);
    assert_eq!(last_good.progress.next_sequence, 2);
    assert_eq!(last_good.model.capacity(), 120);
}
