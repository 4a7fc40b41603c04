//! Durable model + vocabulary snapshots.
//!
//! A checkpoint is one object in an [`ObjectStore`]:
//!
//! ```text
//! +----------+----------------------+-----------------------------+
//! | SFCKPT01 | SHA-256(body) 32 B   | body = gzip(JSON checkpoint)|
//! +----------+----------------------+-----------------------------+
//! ```
//!
//! Every save is a single `put`, so readers observe either the previous or the
//! new checkpoint and never a partial one.

use crate::config::CheckpointConfig;
use crate::encode::Vocabularies;
use crate::error::{Error, Result};
use crate::io::store::open_object;
use crate::model::{ForestRegressor, IncrementalRegressor};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::sync::Arc;

/// Leading bytes of every checkpoint blob.
pub const CHECKPOINT_MAGIC: &[u8; 8] = b"SFCKPT01";

/// Version of the JSON body layout.
pub const FORMAT_VERSION: u32 = 1;

const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = CHECKPOINT_MAGIC.len() + DIGEST_LEN;

/// Training bookkeeping stored alongside the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Chunks successfully applied to the model
    pub chunks_applied: u64,

    /// Rows across all applied chunks
    pub rows_applied: u64,

    /// Source sequence number a resumed run starts from
    pub next_sequence: u64,

    /// When the checkpoint was last written
    pub updated_at: Option<DateTime<Utc>>,
}

/// A restored checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub model: ForestRegressor,
    pub vocabularies: Vocabularies,
    pub progress: TrainingProgress,
}

impl Checkpoint {
    /// Create a checkpoint at the current format version.
    pub fn new(model: ForestRegressor, vocabularies: Vocabularies, progress: TrainingProgress) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            model,
            vocabularies,
            progress,
        }
    }

    /// Borrow as a serializable view.
    pub fn view(&self) -> CheckpointView<'_> {
        CheckpointView::new(&self.model, &self.vocabularies, &self.progress)
    }
}

/// Borrowed form of [`Checkpoint`] used for writing without cloning the model.
#[derive(Debug, Serialize)]
pub struct CheckpointView<'a> {
    format_version: u32,
    model: &'a ForestRegressor,
    vocabularies: &'a Vocabularies,
    progress: &'a TrainingProgress,
}

impl<'a> CheckpointView<'a> {
    pub fn new(
        model: &'a ForestRegressor,
        vocabularies: &'a Vocabularies,
        progress: &'a TrainingProgress,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            model,
            vocabularies,
            progress,
        }
    }

    /// Serialize into the on-store blob format.
    pub fn encode(&self) -> Result<Bytes> {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut gz, self).map_err(|e| Error::CheckpointEncode(e.to_string()))?;
        let body = gz
            .finish()
            .map_err(|e| Error::CheckpointEncode(e.to_string()))?;

        let digest = Sha256::digest(&body);
        let mut blob = Vec::with_capacity(HEADER_LEN + body.len());
        blob.extend_from_slice(CHECKPOINT_MAGIC);
        blob.extend_from_slice(&digest);
        blob.extend_from_slice(&body);
        Ok(Bytes::from(blob))
    }
}

/// Decode a checkpoint blob read from `location`.
pub fn decode_checkpoint(blob: &[u8], location: &str) -> Result<Checkpoint> {
    if blob.len() < HEADER_LEN {
        return Err(Error::corrupt(
            location,
            format!("blob is {} bytes, shorter than the header", blob.len()),
        ));
    }
    let (magic, rest) = blob.split_at(CHECKPOINT_MAGIC.len());
    if magic != CHECKPOINT_MAGIC {
        return Err(Error::corrupt(location, "bad magic"));
    }
    let (digest, body) = rest.split_at(DIGEST_LEN);
    if Sha256::digest(body).as_slice() != digest {
        return Err(Error::corrupt(location, "checksum mismatch"));
    }

    let checkpoint: Checkpoint = serde_json::from_reader(GzDecoder::new(body))
        .map_err(|e| Error::corrupt(location, format!("undecodable body: {}", e)))?;
    if checkpoint.format_version != FORMAT_VERSION {
        return Err(Error::corrupt(
            location,
            format!("unsupported format version {}", checkpoint.format_version),
        ));
    }
    Ok(checkpoint)
}

/// Result of [`CheckpointStore::load`].
#[derive(Debug)]
pub enum LoadOutcome {
    /// A checkpoint was found and decoded
    Restored(Box<Checkpoint>),
    /// No checkpoint exists yet
    ColdStart,
}

/// Receipt for a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedCheckpoint {
    pub bytes: usize,
}

/// Summary of a stored checkpoint for display.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub location: String,
    pub blob_bytes: usize,
    pub format_version: u32,
    pub capacity: usize,
    pub trees: usize,
    pub location_labels: usize,
    pub sku_labels: usize,
    pub progress: TrainingProgress,
}

impl fmt::Display for CheckpointSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Checkpoint:       {}", self.location)?;
        writeln!(f, "  Size:           {} bytes", self.blob_bytes)?;
        writeln!(f, "  Format version: {}", self.format_version)?;
        writeln!(f, "  Capacity:       {} ({} trees)", self.capacity, self.trees)?;
        writeln!(f, "  Locations:      {}", self.location_labels)?;
        writeln!(f, "  SKUs:           {}", self.sku_labels)?;
        writeln!(f, "  Chunks applied: {}", self.progress.chunks_applied)?;
        writeln!(f, "  Rows applied:   {}", self.progress.rows_applied)?;
        writeln!(f, "  Next sequence:  {}", self.progress.next_sequence)?;
        match self.progress.updated_at {
            Some(ts) => write!(f, "  Updated at:     {}", ts.to_rfc3339()),
            None => write!(f, "  Updated at:     never"),
        }
    }
}

/// Reads and writes the single checkpoint object.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
    path: Path,
    location: String,
}

impl CheckpointStore {
    /// Wrap an object in an existing store.
    pub fn new(store: Arc<dyn ObjectStore>, path: Path) -> Self {
        let location = path.to_string();
        Self {
            store,
            path,
            location,
        }
    }

    /// Open the checkpoint named in the configuration.
    pub fn open(config: &CheckpointConfig) -> anyhow::Result<Self> {
        let (store, path) = open_object(&config.uri, config.credentials.as_ref())?;
        Ok(Self {
            store,
            path,
            location: config.uri.clone(),
        })
    }

    /// Human-readable location of the checkpoint.
    pub fn location(&self) -> &str {
        &self.location
    }

    async fn fetch(&self) -> Result<Option<Bytes>> {
        match self.store.get(&self.path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the checkpoint, or report a cold start if none exists.
    ///
    /// A blob that exists but cannot be decoded is an error, never a cold start.
    pub async fn load(&self) -> Result<LoadOutcome> {
        match self.fetch().await? {
            None => {
                tracing::info!("No checkpoint at {}, cold start", self.location);
                Ok(LoadOutcome::ColdStart)
            }
            Some(blob) => {
                let checkpoint = decode_checkpoint(&blob, &self.location)?;
                tracing::info!(
                    "Restored checkpoint from {} ({} bytes, {} chunks applied)",
                    self.location,
                    blob.len(),
                    checkpoint.progress.chunks_applied
                );
                Ok(LoadOutcome::Restored(Box::new(checkpoint)))
            }
        }
    }

    /// Serialize and write a checkpoint.
    pub async fn save(&self, view: &CheckpointView<'_>) -> Result<SavedCheckpoint> {
        let blob = view.encode()?;
        self.save_encoded(blob).await
    }

    /// Write a blob produced by [`CheckpointView::encode`].
    pub async fn save_encoded(&self, blob: Bytes) -> Result<SavedCheckpoint> {
        let bytes = blob.len();
        self.store
            .put(&self.path, PutPayload::from_bytes(blob))
            .await?;
        tracing::debug!("Wrote checkpoint {} ({} bytes)", self.location, bytes);
        Ok(SavedCheckpoint { bytes })
    }

    /// Whether a checkpoint object exists.
    pub async fn exists(&self) -> Result<bool> {
        match self.store.head(&self.path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Load and summarize the checkpoint, if any.
    pub async fn describe(&self) -> Result<Option<CheckpointSummary>> {
        let Some(blob) = self.fetch().await? else {
            return Ok(None);
        };
        let checkpoint = decode_checkpoint(&blob, &self.location)?;
        Ok(Some(CheckpointSummary {
            location: self.location.clone(),
            blob_bytes: blob.len(),
            format_version: checkpoint.format_version,
            capacity: checkpoint.model.capacity(),
            trees: checkpoint.model.tree_count(),
            location_labels: checkpoint.vocabularies.location.len(),
            sku_labels: checkpoint.vocabularies.sku.len(),
            progress: checkpoint.progress,
        }))
    }
}
