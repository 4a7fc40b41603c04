//! Training progress counters and periodic reporting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a training run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Rows pulled from the source
    pub rows_read: AtomicU64,

    /// Chunks handed to the encoder pool
    pub chunks_dispatched: AtomicU64,

    /// Chunks encoded successfully
    pub chunks_encoded: AtomicU64,

    /// Chunks fitted into the model and checkpointed
    pub chunks_applied: AtomicU64,

    /// Chunks skipped (empty, or dropped behind a sequence gap)
    pub chunks_skipped: AtomicU64,

    /// Chunks whose encoding failed or timed out
    pub chunks_failed: AtomicU64,

    /// Bytes written across all checkpoint saves
    pub checkpoint_bytes: AtomicU64,

    /// Most completions held in the reorder buffer at once
    pub reorder_peak: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-component timing (in microseconds for precision)
    /// Time spent encoding, summed across workers
    pub encode_us: AtomicU64,

    /// Time spent growing trees
    pub fit_us: AtomicU64,

    /// Time spent serializing and writing checkpoints
    pub checkpoint_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record rows read from the source.
    pub fn add_rows_read(&self, rows: u64) {
        self.rows_read.fetch_add(rows, Ordering::Relaxed);
    }

    /// Record a dispatched chunk.
    pub fn add_chunk_dispatched(&self) {
        self.chunks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an encoded chunk.
    pub fn add_chunk_encoded(&self) {
        self.chunks_encoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an applied chunk.
    pub fn add_chunk_applied(&self) {
        self.chunks_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a skipped chunk.
    pub fn add_chunk_skipped(&self) {
        self.chunks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed chunk.
    pub fn add_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record checkpoint bytes written.
    pub fn add_checkpoint_bytes(&self, bytes: u64) {
        self.checkpoint_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record the reorder buffer depth, keeping the peak.
    pub fn record_reorder_depth(&self, depth: u64) {
        self.reorder_peak.fetch_max(depth, Ordering::Relaxed);
    }

    /// Record time spent encoding.
    pub fn add_encode_time(&self, duration: Duration) {
        self.encode_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent fitting.
    pub fn add_fit_time(&self, duration: Duration) {
        self.fit_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent checkpointing.
    pub fn add_checkpoint_time(&self, duration: Duration) {
        self.checkpoint_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Rows read per second.
    pub fn rows_per_second(&self) -> f64 {
        let rows = self.rows_read.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            rows as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rows_read: self.rows_read.load(Ordering::Relaxed),
            chunks_dispatched: self.chunks_dispatched.load(Ordering::Relaxed),
            chunks_encoded: self.chunks_encoded.load(Ordering::Relaxed),
            chunks_applied: self.chunks_applied.load(Ordering::Relaxed),
            chunks_skipped: self.chunks_skipped.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            checkpoint_bytes: self.checkpoint_bytes.load(Ordering::Relaxed),
            reorder_peak: self.reorder_peak.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            rows_per_second: self.rows_per_second(),
            encode_secs: self.encode_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            fit_secs: self.fit_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            checkpoint_secs: self.checkpoint_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub rows_read: u64,
    pub chunks_dispatched: u64,
    pub chunks_encoded: u64,
    pub chunks_applied: u64,
    pub chunks_skipped: u64,
    pub chunks_failed: u64,
    pub checkpoint_bytes: u64,
    pub reorder_peak: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub rows_per_second: f64,
    /// Encoding time (seconds, summed across workers)
    pub encode_secs: f64,
    pub fit_secs: f64,
    pub checkpoint_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Chunks dispatched but not yet applied, skipped or failed.
    pub fn in_flight(&self) -> u64 {
        self.chunks_dispatched
            .saturating_sub(self.chunks_applied + self.chunks_skipped + self.chunks_failed)
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.encode_secs + self.fit_secs + self.checkpoint_secs;
        let (encode_pct, fit_pct, ckpt_pct) = if total > 0.0 {
            (
                self.encode_secs / total * 100.0,
                self.fit_secs / total * 100.0,
                self.checkpoint_secs / total * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Chunks: {} applied, {} skipped, {} failed, {} in flight | \
             Rows: {} @ {:.0}/s | Checkpoints: {:.1} MB | Elapsed: {:.1}s | \
             Time: encode {:.0}% | fit {:.0}% | checkpoint {:.0}%",
            self.chunks_applied,
            self.chunks_skipped,
            self.chunks_failed,
            self.in_flight(),
            self.rows_read,
            self.rows_per_second,
            self.checkpoint_bytes as f64 / (1024.0 * 1024.0),
            self.elapsed.as_secs_f64(),
            encode_pct,
            fit_pct,
            ckpt_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("{}", self.metrics.snapshot());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Training Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Rows read: {}", snapshot.rows_read);
        println!("Chunks dispatched: {}", snapshot.chunks_dispatched);
        println!("Chunks applied: {}", snapshot.chunks_applied);
        println!("Chunks skipped: {}", snapshot.chunks_skipped);
        println!("Chunks failed: {}", snapshot.chunks_failed);
        println!(
            "Checkpoint data written: {:.2} MB",
            snapshot.checkpoint_bytes as f64 / (1024.0 * 1024.0)
        );
        println!("Read rate: {:.0} rows/s", snapshot.rows_per_second);

        let total = snapshot.encode_secs + snapshot.fit_secs + snapshot.checkpoint_secs;
        if total > 0.0 {
            println!("\n--- Component Time Breakdown ---");
            println!("Encode:      {:>7.1}s ({:>5.1}%)", snapshot.encode_secs, snapshot.encode_secs / total * 100.0);
            println!("Fit:         {:>7.1}s ({:>5.1}%)", snapshot.fit_secs, snapshot.fit_secs / total * 100.0);
            println!("Checkpoint:  {:>7.1}s ({:>5.1}%)", snapshot.checkpoint_secs, snapshot.checkpoint_secs / total * 100.0);
        }
        println!("========================\n");
    }
}
