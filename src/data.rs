//! Row, chunk and feature types shared by the source, encoder and validator.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Number of model input features.
pub const NUM_FEATURES: usize = 6;

/// Feature column names in matrix order.
pub const FEATURE_NAMES: [&str; NUM_FEATURES] =
    ["year", "month", "day", "day_of_week", "location_id", "sku_id"];

/// A single raw sales record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Sale date-time (no time zone)
    pub timestamp: NaiveDateTime,

    /// Customer location label, possibly padded with whitespace
    pub location: String,

    /// Product SKU label
    pub sku: String,

    /// Net quantity sold (the regression target)
    pub quantity: f64,
}

impl Row {
    /// Create a row.
    pub fn new(
        timestamp: NaiveDateTime,
        location: impl Into<String>,
        sku: impl Into<String>,
        quantity: f64,
    ) -> Self {
        Self {
            timestamp,
            location: location.into(),
            sku: sku.into(),
            quantity,
        }
    }

    /// Create a row stamped at midnight of `date`.
    pub fn on_date(
        date: NaiveDate,
        location: impl Into<String>,
        sku: impl Into<String>,
        quantity: f64,
    ) -> Self {
        Self::new(date.and_time(chrono::NaiveTime::MIN), location, sku, quantity)
    }
}

/// A bounded batch of rows pulled from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Zero-based position of this chunk in the source
    pub sequence: u64,

    /// Rows in source order
    pub rows: Vec<Row>,
}

impl Chunk {
    /// Create a chunk.
    pub fn new(sequence: u64, rows: Vec<Row>) -> Self {
        Self { sequence, rows }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the chunk has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Calendar fields derived from a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalendarFields {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    /// 0 = Monday, 6 = Sunday
    pub day_of_week: u32,
}

impl CalendarFields {
    /// Derive calendar fields from a timestamp.
    pub fn from_timestamp(ts: &NaiveDateTime) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
            day: ts.day(),
            day_of_week: ts.weekday().num_days_from_monday(),
        }
    }
}

/// One encoded feature tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureRow {
    #[serde(flatten)]
    pub calendar: CalendarFields,
    pub location_id: u32,
    pub sku_id: u32,
}

impl FeatureRow {
    /// Feature values in matrix column order.
    pub fn to_array(&self) -> [f64; NUM_FEATURES] {
        [
            self.calendar.year as f64,
            self.calendar.month as f64,
            self.calendar.day as f64,
            self.calendar.day_of_week as f64,
            self.location_id as f64,
            self.sku_id as f64,
        ]
    }

    /// Rebuild a feature row from a matrix row.
    pub fn from_view(row: ArrayView1<'_, f64>) -> Self {
        Self {
            calendar: CalendarFields {
                year: row[0] as i32,
                month: row[1] as u32,
                day: row[2] as u32,
                day_of_week: row[3] as u32,
            },
            location_id: row[4] as u32,
            sku_id: row[5] as u32,
        }
    }
}

/// A chunk rewritten as a numeric feature matrix and target vector.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Source sequence number of the chunk
    pub sequence: u64,

    /// Feature matrix, one row per record, [`NUM_FEATURES`] columns
    pub features: Array2<f64>,

    /// Regression targets, aligned with `features` rows
    pub targets: Array1<f64>,
}

impl EncodedChunk {
    /// Build from feature rows and targets.
    pub fn from_rows(sequence: u64, rows: &[FeatureRow], targets: Vec<f64>) -> Self {
        debug_assert_eq!(rows.len(), targets.len());
        let mut features = Array2::zeros((rows.len(), NUM_FEATURES));
        for (mut out, row) in features.outer_iter_mut().zip(rows) {
            for (slot, value) in out.iter_mut().zip(row.to_array()) {
                *slot = value;
            }
        }
        Self {
            sequence,
            features,
            targets: Array1::from(targets),
        }
    }

    /// Number of encoded records.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the chunk has no records.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Feature tuple for record `i`.
    pub fn feature_row(&self, i: usize) -> FeatureRow {
        FeatureRow::from_view(self.features.row(i))
    }
}

/// Parse a timestamp written as a date or a date-time.
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]`
/// and `DD/MM/YYYY`.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date.and_time(chrono::NaiveTime::MIN));
        }
    }
    None
}
