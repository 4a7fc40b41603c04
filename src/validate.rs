//! Held-out scoring of a trained model.

use crate::data::{Chunk, FeatureRow, Row, FEATURE_NAMES};
use crate::encode::{ChunkEncoder, Vocabularies};
use crate::error::{Error, Result};
use crate::model::IncrementalRegressor;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

/// One scored row.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRow {
    pub timestamp: NaiveDateTime,
    pub location: String,
    pub sku: String,
    pub features: FeatureRow,
    pub target: f64,
    pub prediction: f64,
    /// `target - prediction`
    pub residual: f64,
}

/// Scored rows plus aggregate error.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub rows: Vec<ValidationRow>,
    pub mae: f64,
    pub rmse: f64,
    pub mean_residual: f64,
}

impl ValidationResult {
    fn from_rows(rows: Vec<ValidationRow>) -> Self {
        let n = rows.len() as f64;
        let (mae, rmse, mean_residual) = if rows.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let abs: f64 = rows.iter().map(|r| r.residual.abs()).sum();
            let sq: f64 = rows.iter().map(|r| r.residual * r.residual).sum();
            let sum: f64 = rows.iter().map(|r| r.residual).sum();
            (abs / n, (sq / n).sqrt(), sum / n)
        };
        Self {
            rows,
            mae,
            rmse,
            mean_residual,
        }
    }

    /// Number of scored rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were scored.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Save the report to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Validation report saved to {}", path);
        Ok(())
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<10} {:<20} {:>10}", "date", "location", "sku")?;
        for name in FEATURE_NAMES {
            write!(f, " {:>w$}", name, w = feature_width(name))?;
        }
        writeln!(f, " {:>10} {:>10} {:>10}", "target", "prediction", "residual")?;

        for row in &self.rows {
            write!(
                f,
                "{:<10} {:<20} {:>10}",
                row.timestamp.date(),
                row.location,
                row.sku
            )?;
            for (name, value) in FEATURE_NAMES.iter().zip(row.features.to_array()) {
                write!(f, " {:>w$}", value as i64, w = feature_width(name))?;
            }
            writeln!(
                f,
                " {:>10.4} {:>10.4} {:>10.4}",
                row.target, row.prediction, row.residual
            )?;
        }
        write!(
            f,
            "rows: {} | MAE: {:.4} | RMSE: {:.4} | mean residual: {:.4}",
            self.rows.len(),
            self.mae,
            self.rmse,
            self.mean_residual
        )
    }
}

fn feature_width(name: &str) -> usize {
    name.len().max(5)
}

/// Score `rows` against `model`.
///
/// Encoding uses the inference path: any label missing from `vocabs` fails
/// with [`Error::UnknownLabel`] and the vocabularies are never modified.
pub fn validate<M>(model: &M, vocabs: &Vocabularies, rows: &[Row]) -> Result<ValidationResult>
where
    M: IncrementalRegressor + ?Sized,
{
    if rows.is_empty() {
        return Ok(ValidationResult::from_rows(Vec::new()));
    }

    let chunk = Chunk::new(0, rows.to_vec());
    let encoded = ChunkEncoder::new().encode_known(&chunk, vocabs)?;
    let predictions = model.predict(encoded.features.view())?;

    let scored = chunk
        .rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            let prediction = predictions[i];
            ValidationRow {
                timestamp: row.timestamp,
                location: row.location.trim().to_string(),
                sku: row.sku.trim().to_string(),
                features: encoded.feature_row(i),
                target: row.quantity,
                prediction,
                residual: row.quantity - prediction,
            }
        })
        .collect();

    Ok(ValidationResult::from_rows(scored))
}

/// Predict a single point.
pub fn predict_one<M>(
    model: &M,
    vocabs: &Vocabularies,
    timestamp: NaiveDateTime,
    location: &str,
    sku: &str,
) -> Result<f64>
where
    M: IncrementalRegressor + ?Sized,
{
    let chunk = Chunk::new(0, vec![Row::new(timestamp, location, sku, f64::NAN)]);
    let encoded = ChunkEncoder::new().encode_known(&chunk, vocabs)?;
    let predictions = model.predict(encoded.features.view())?;
    predictions
        .first()
        .copied()
        .ok_or_else(|| Error::model("model returned no prediction"))
}
