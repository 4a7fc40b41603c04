//! Warm-startable random forest regressor.

use super::tree::{RegressionTree, TreeParams};
use super::{FitReport, IncrementalRegressor};
use crate::data::EncodedChunk;
use crate::error::{Error, Result};
use ndarray::{Array1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Forest hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    /// Per-tree growth limits
    pub tree: TreeParams,

    /// Draw a bootstrap sample for each tree
    pub bootstrap: bool,

    /// Base seed; tree `i` is grown from a seed derived from this and `i`
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            tree: TreeParams::default(),
            bootstrap: true,
            seed: 42,
        }
    }
}

/// Random forest whose ensemble only ever grows.
///
/// `capacity` is the target ensemble size. Each incremental fit raises it and
/// grows the missing trees from the given chunk alone; trees from earlier
/// fits are kept as they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestRegressor {
    params: ForestParams,
    capacity: usize,
    trees: Vec<RegressionTree>,
    n_features: Option<usize>,
}

impl ForestRegressor {
    /// Create an unfitted forest with an initial target capacity.
    pub fn new(params: ForestParams, initial_capacity: usize) -> Self {
        Self {
            params,
            capacity: initial_capacity,
            trees: Vec::new(),
            n_features: None,
        }
    }

    /// Hyper-parameters.
    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    /// Number of fitted trees.
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Feature count seen at the first fit.
    pub fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    /// Seed for the tree at ensemble position `index`.
    fn tree_seed(&self, index: usize) -> u64 {
        self.params.seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    fn grow_tree(&self, index: usize, chunk: &EncodedChunk) -> RegressionTree {
        let mut rng = StdRng::seed_from_u64(self.tree_seed(index));
        let n = chunk.len();
        let samples: Vec<usize> = if self.params.bootstrap {
            (0..n).map(|_| rng.random_range(0..n)).collect()
        } else {
            (0..n).collect()
        };
        RegressionTree::fit(
            chunk.features.view(),
            chunk.targets.view(),
            samples,
            &self.params.tree,
            &mut rng,
        )
    }
}

impl IncrementalRegressor for ForestRegressor {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn fit_incremental(&mut self, chunk: &EncodedChunk, new_capacity: usize) -> Result<FitReport> {
        if new_capacity <= self.capacity {
            return Err(Error::model(format!(
                "new capacity {} must exceed current capacity {}",
                new_capacity, self.capacity
            )));
        }
        if chunk.is_empty() {
            return Err(Error::model(format!(
                "chunk {} has no rows to fit",
                chunk.sequence
            )));
        }
        let n_features = chunk.features.ncols();
        if let Some(expected) = self.n_features {
            if expected != n_features {
                return Err(Error::model(format!(
                    "chunk {} has {} features, model expects {}",
                    chunk.sequence, n_features, expected
                )));
            }
        }

        let start = self.trees.len();
        let new_trees: Vec<RegressionTree> = (start..new_capacity)
            .into_par_iter()
            .map(|index| self.grow_tree(index, chunk))
            .collect();

        let trees_added = new_trees.len();
        self.trees.extend(new_trees);
        self.capacity = new_capacity;
        self.n_features = Some(n_features);

        debug!(
            "Chunk {}: grew {} trees on {} rows (capacity {})",
            chunk.sequence,
            trees_added,
            chunk.len(),
            new_capacity
        );

        Ok(FitReport {
            trees_added,
            capacity: new_capacity,
            samples: chunk.len(),
        })
    }

    fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        let Some(expected) = self.n_features else {
            return Err(Error::model("model has not been fitted"));
        };
        if features.ncols() != expected {
            return Err(Error::model(format!(
                "expected {} features, got {}",
                expected,
                features.ncols()
            )));
        }

        let n_trees = self.trees.len() as f64;
        let predictions: Vec<f64> = (0..features.nrows())
            .into_par_iter()
            .map(|i| {
                let row = features.row(i);
                self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees
            })
            .collect();
        Ok(Array1::from(predictions))
    }

    fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }
}
