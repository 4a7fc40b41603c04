//! Incremental regression models.
//!
//! The training core only talks to [`IncrementalRegressor`]; the shipped
//! implementation is [`ForestRegressor`].

mod forest;
mod tree;

pub use forest::{ForestParams, ForestRegressor};
pub use tree::{RegressionTree, TreeParams};

use crate::data::EncodedChunk;
use crate::error::Result;
use ndarray::{Array1, ArrayView2};

/// Outcome of one incremental fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitReport {
    /// Ensemble members added by this fit
    pub trees_added: usize,

    /// Capacity after the fit
    pub capacity: usize,

    /// Rows the new members were grown on
    pub samples: usize,
}

/// A regressor that can be extended one chunk at a time.
pub trait IncrementalRegressor: Send + Sync {
    /// Current target ensemble size.
    fn capacity(&self) -> usize;

    /// Grow the model to `new_capacity` using only `chunk`.
    ///
    /// `new_capacity` must be strictly greater than [`capacity`](Self::capacity);
    /// otherwise the fit is rejected and the model is left unchanged. Members
    /// grown by earlier fits are never discarded.
    fn fit_incremental(&mut self, chunk: &EncodedChunk, new_capacity: usize) -> Result<FitReport>;

    /// Point predictions, one per feature row.
    fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Array1<f64>>;

    /// Whether at least one fit has succeeded.
    fn is_fitted(&self) -> bool;
}
