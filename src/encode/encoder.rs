//! Chunk encoding: calendar features plus vocabulary ids.
//!
//! Encoding is split in two halves so the expensive part can run on the
//! worker pool without touching shared state:
//!
//! - [`ChunkEncoder::prepare`] runs concurrently against a read-only
//!   vocabulary snapshot. Labels already in the snapshot get their final id
//!   (ids never move), unseen labels are left pending.
//! - [`PreparedChunk::resolve`] runs in the single-writer apply step. It
//!   appends the pending labels to the authoritative vocabularies and fills
//!   in their ids.
//!
//! A stale snapshot can therefore only leave more labels pending; it can never
//! produce a wrong id.

use super::vocabulary::{Field, Vocabularies, Vocabulary};
use crate::data::{CalendarFields, Chunk, EncodedChunk, FeatureRow};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Whether encoding may grow the vocabularies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Unseen labels are appended to the vocabularies.
    Training,
    /// Unseen labels are an error; vocabularies are never modified.
    Inference,
}

/// Where a label's id comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Id already present in the snapshot
    Known(u32),
    /// Index into the chunk's pending label list
    Pending(usize),
}

/// Per-field label slots collected while preparing a chunk.
struct LabelColumn<'a> {
    snapshot: &'a Vocabulary,
    slots: Vec<Slot>,
    pending: Vec<String>,
    pending_index: HashMap<String, usize>,
}

impl<'a> LabelColumn<'a> {
    fn new(snapshot: &'a Vocabulary, capacity: usize) -> Self {
        Self {
            snapshot,
            slots: Vec::with_capacity(capacity),
            pending: Vec::new(),
            pending_index: HashMap::new(),
        }
    }

    fn push(&mut self, label: &str) {
        let slot = match self.snapshot.lookup(label) {
            Some(id) => Slot::Known(id),
            None => {
                let next = self.pending.len();
                let idx = *self.pending_index.entry(label.to_string()).or_insert(next);
                if idx == next {
                    self.pending.push(label.to_string());
                }
                Slot::Pending(idx)
            }
        };
        self.slots.push(slot);
    }
}

/// A chunk whose calendar fields and known label ids are computed, with
/// unseen labels still pending.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    sequence: u64,
    calendar: Vec<CalendarFields>,
    location: Vec<Slot>,
    sku: Vec<Slot>,
    targets: Vec<f64>,
    pending_location: Vec<String>,
    pending_sku: Vec<String>,
}

/// Labels appended to the vocabularies while resolving a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelGrowth {
    pub locations: usize,
    pub skus: usize,
}

impl PreparedChunk {
    /// Source sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the chunk has no records.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Labels of `field` that were not in the snapshot, in first-encountered order.
    pub fn pending_labels(&self, field: Field) -> &[String] {
        match field {
            Field::Location => &self.pending_location,
            Field::Sku => &self.pending_sku,
        }
    }

    /// Assign ids to pending labels and build the feature matrix.
    ///
    /// Must only be called by the single writer that owns `vocabs`. Pending
    /// labels that another chunk has added since the snapshot was taken keep
    /// the id they already have.
    pub fn resolve(self, vocabs: &mut Vocabularies) -> (EncodedChunk, LabelGrowth) {
        let before = (vocabs.location.len(), vocabs.sku.len());
        let location_ids = assign(&self.location, &self.pending_location, &mut vocabs.location);
        let sku_ids = assign(&self.sku, &self.pending_sku, &mut vocabs.sku);
        let growth = LabelGrowth {
            locations: vocabs.location.len() - before.0,
            skus: vocabs.sku.len() - before.1,
        };
        (self.build(location_ids, sku_ids), growth)
    }

    /// Build the feature matrix without growing any vocabulary.
    ///
    /// Fails with [`Error::UnknownLabel`] if a pending label is still unknown
    /// to `vocabs`.
    pub fn resolve_known(self, vocabs: &Vocabularies) -> Result<EncodedChunk> {
        let location_ids = lookup(&self.location, &self.pending_location, &vocabs.location)
            .map_err(|label| label.in_field(Field::Location))?;
        let sku_ids = lookup(&self.sku, &self.pending_sku, &vocabs.sku)
            .map_err(|label| label.in_field(Field::Sku))?;
        Ok(self.build(location_ids, sku_ids))
    }

    fn build(self, location_ids: Vec<u32>, sku_ids: Vec<u32>) -> EncodedChunk {
        let rows: Vec<FeatureRow> = self
            .calendar
            .iter()
            .zip(location_ids.iter().zip(sku_ids.iter()))
            .map(|(calendar, (&location_id, &sku_id))| FeatureRow {
                calendar: *calendar,
                location_id,
                sku_id,
            })
            .collect();
        EncodedChunk::from_rows(self.sequence, &rows, self.targets)
    }
}

fn assign(slots: &[Slot], pending: &[String], vocab: &mut Vocabulary) -> Vec<u32> {
    let pending_ids: Vec<u32> = pending.iter().map(|label| vocab.insert(label)).collect();
    slots
        .iter()
        .map(|slot| match *slot {
            Slot::Known(id) => id,
            Slot::Pending(idx) => pending_ids[idx],
        })
        .collect()
}

fn lookup(
    slots: &[Slot],
    pending: &[String],
    vocab: &Vocabulary,
) -> std::result::Result<Vec<u32>, super::vocabulary::UnknownLabel> {
    let pending_ids = vocab.transform(pending)?;
    Ok(slots
        .iter()
        .map(|slot| match *slot {
            Slot::Known(id) => id,
            Slot::Pending(idx) => pending_ids[idx],
        })
        .collect())
}

/// Converts raw chunks into numeric features.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkEncoder;

impl ChunkEncoder {
    /// Create an encoder.
    pub fn new() -> Self {
        Self
    }

    /// First half of encoding; safe to run concurrently across chunks.
    ///
    /// Derives calendar fields, trims incidental whitespace from labels and
    /// resolves every label already present in `snapshot`. In training mode a
    /// non-finite target fails the whole chunk.
    pub fn prepare(
        &self,
        chunk: &Chunk,
        snapshot: &Vocabularies,
        mode: EncodeMode,
    ) -> Result<PreparedChunk> {
        let n = chunk.len();
        let mut calendar = Vec::with_capacity(n);
        let mut targets = Vec::with_capacity(n);
        let mut location = LabelColumn::new(&snapshot.location, n);
        let mut sku = LabelColumn::new(&snapshot.sku, n);

        for (i, row) in chunk.rows.iter().enumerate() {
            if mode == EncodeMode::Training && !row.quantity.is_finite() {
                return Err(Error::encoding(
                    chunk.sequence,
                    format!("row {} has non-finite target {}", i, row.quantity),
                ));
            }
            calendar.push(CalendarFields::from_timestamp(&row.timestamp));
            location.push(row.location.trim());
            sku.push(row.sku.trim());
            targets.push(row.quantity);
        }

        Ok(PreparedChunk {
            sequence: chunk.sequence,
            calendar,
            location: location.slots,
            sku: sku.slots,
            targets,
            pending_location: location.pending,
            pending_sku: sku.pending,
        })
    }

    /// Encode a chunk in one step.
    ///
    /// In training mode the returned vocabularies are `vocabs` grown to cover
    /// the chunk; in inference mode they are returned unchanged and any unseen
    /// label fails with [`Error::UnknownLabel`].
    pub fn encode(
        &self,
        chunk: &Chunk,
        vocabs: &Vocabularies,
        mode: EncodeMode,
    ) -> Result<(EncodedChunk, Vocabularies)> {
        let prepared = self.prepare(chunk, vocabs, mode)?;
        match mode {
            EncodeMode::Training => {
                let mut grown = vocabs.clone();
                let (encoded, _) = prepared.resolve(&mut grown);
                Ok((encoded, grown))
            }
            EncodeMode::Inference => Ok((prepared.resolve_known(vocabs)?, vocabs.clone())),
        }
    }

    /// Inference-path encoding that borrows the vocabularies.
    pub fn encode_known(&self, chunk: &Chunk, vocabs: &Vocabularies) -> Result<EncodedChunk> {
        self.prepare(chunk, vocabs, EncodeMode::Inference)?
            .resolve_known(vocabs)
    }
}
