//! CART regression tree with variance-reduction splits.

use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Growth limits for a single tree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    /// Maximum depth; `None` grows until leaves are pure or too small
    pub max_depth: Option<usize>,

    /// Minimum samples a node needs to be considered for a split
    pub min_samples_split: usize,

    /// Minimum samples on each side of a split
    pub min_samples_leaf: usize,

    /// Features drawn at random per split; `None` considers all of them
    pub max_features: Option<usize>,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A fitted regression tree stored as a flat node array; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

/// Best split found for a node.
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    score: f64,
}

impl RegressionTree {
    /// Fit a tree on the rows of `features` listed in `samples`.
    ///
    /// `samples` may contain repeats (bootstrap draws). It must not be empty.
    pub fn fit(
        features: ArrayView2<'_, f64>,
        targets: ArrayView1<'_, f64>,
        samples: Vec<usize>,
        params: &TreeParams,
        rng: &mut StdRng,
    ) -> Self {
        let n_features = features.ncols();
        let mut nodes = vec![Node::Leaf { value: 0.0 }];
        let mut stack = vec![(0usize, samples, 0usize)];

        while let Some((slot, samples, depth)) = stack.pop() {
            let value = mean(&samples, targets);
            let can_split = samples.len() >= params.min_samples_split.max(2)
                && params.max_depth.is_none_or(|max| depth < max)
                && !is_constant(&samples, targets);

            let split = if can_split {
                let candidates = candidate_features(n_features, params.max_features, rng);
                best_split(features, targets, &samples, &candidates, params.min_samples_leaf)
            } else {
                None
            };

            let Some(split) = split else {
                nodes[slot] = Node::Leaf { value };
                continue;
            };

            let (left_samples, right_samples): (Vec<usize>, Vec<usize>) = samples
                .into_iter()
                .partition(|&i| features[[i, split.feature]] <= split.threshold);

            let left = nodes.len();
            nodes.push(Node::Leaf { value: 0.0 });
            let right = nodes.len();
            nodes.push(Node::Leaf { value: 0.0 });
            nodes[slot] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };

            stack.push((right, right_samples, depth + 1));
            stack.push((left, left_samples, depth + 1));
        }

        Self { nodes }
    }

    /// Predict a single feature row.
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    /// Number of nodes, leaves included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Length of the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((idx, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            if let Node::Split { left, right, .. } = self.nodes[idx] {
                stack.push((left, depth + 1));
                stack.push((right, depth + 1));
            }
        }
        max_depth
    }
}

fn mean(samples: &[usize], targets: ArrayView1<'_, f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&i| targets[i]).sum::<f64>() / samples.len() as f64
}

fn is_constant(samples: &[usize], targets: ArrayView1<'_, f64>) -> bool {
    let first = targets[samples[0]];
    samples.iter().all(|&i| targets[i] == first)
}

fn candidate_features(n_features: usize, max_features: Option<usize>, rng: &mut StdRng) -> Vec<usize> {
    match max_features {
        Some(k) if k > 0 && k < n_features => {
            let mut picked = rand::seq::index::sample(rng, n_features, k).into_vec();
            picked.sort_unstable();
            picked
        }
        _ => (0..n_features).collect(),
    }
}

/// Exhaustive search for the split maximising variance reduction.
///
/// Scores are `sum_l^2 / n_l + sum_r^2 / n_r`, which orders splits the same
/// way as the drop in squared error. Ties keep the earliest candidate.
fn best_split(
    features: ArrayView2<'_, f64>,
    targets: ArrayView1<'_, f64>,
    samples: &[usize],
    candidates: &[usize],
    min_samples_leaf: usize,
) -> Option<SplitCandidate> {
    let n = samples.len();
    let min_leaf = min_samples_leaf.max(1);
    if n < 2 * min_leaf {
        return None;
    }

    let total: f64 = samples.iter().map(|&i| targets[i]).sum();
    let parent_score = total * total / n as f64;
    let mut best: Option<SplitCandidate> = None;
    let mut column: Vec<(f64, f64)> = Vec::with_capacity(n);

    for &feature in candidates {
        column.clear();
        column.extend(samples.iter().map(|&i| (features[[i, feature]], targets[i])));
        column.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut left_sum = 0.0;
        for split_at in 1..n {
            left_sum += column[split_at - 1].1;
            if split_at < min_leaf || n - split_at < min_leaf {
                continue;
            }
            let (lo, hi) = (column[split_at - 1].0, column[split_at].0);
            if lo >= hi {
                continue;
            }
            let right_sum = total - left_sum;
            let nl = split_at as f64;
            let nr = (n - split_at) as f64;
            let score = left_sum * left_sum / nl + right_sum * right_sum / nr;
            if score <= parent_score + 1e-12 {
                continue;
            }
            if best.as_ref().is_none_or(|b| score > b.score) {
                best = Some(SplitCandidate {
                    feature,
                    threshold: lo + (hi - lo) / 2.0,
                    score,
                });
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use rand::SeedableRng;

    fn fit_all(features: &Array2<f64>, targets: &[f64], params: &TreeParams) -> RegressionTree {
        let targets = ndarray::Array1::from(targets.to_vec());
        let mut rng = StdRng::seed_from_u64(7);
        RegressionTree::fit(
            features.view(),
            targets.view(),
            (0..features.nrows()).collect(),
            params,
            &mut rng,
        )
    }

    #[test]
    fn test_single_split_separates_groups() {
        let x = array![[0.0, 5.0], [1.0, 5.0], [2.0, 5.0], [3.0, 5.0]];
        let tree = fit_all(&x, &[1.0, 1.0, 9.0, 9.0], &TreeParams::default());

        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.predict_row(array![0.5, 5.0].view()), 1.0);
        assert_eq!(tree.predict_row(array![2.5, 0.0].view()), 9.0);
        // Threshold sits halfway between 1.0 and 2.0
        assert_eq!(tree.predict_row(array![1.5, 0.0].view()), 1.0);
        assert_eq!(tree.predict_row(array![1.51, 0.0].view()), 9.0);
    }

    #[test]
    fn test_constant_target_is_single_leaf() {
        let x = array![[0.0], [1.0], [2.0]];
        let tree = fit_all(&x, &[4.0, 4.0, 4.0], &TreeParams::default());

        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.predict_row(array![10.0].view()), 4.0);
    }

    #[test]
    fn test_max_depth_limits_growth() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0], [5.0], [6.0], [7.0]];
        let y = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];

        let full = fit_all(&x, &y, &TreeParams::default());
        assert_eq!(full.predict_row(array![3.0].view()), 3.0);

        let stump = fit_all(
            &x,
            &y,
            &TreeParams {
                max_depth: Some(1),
                ..TreeParams::default()
            },
        );
        assert_eq!(stump.depth(), 1);
        assert_eq!(stump.predict_row(array![0.0].view()), 1.5);
        assert_eq!(stump.predict_row(array![7.0].view()), 5.5);
    }

    #[test]
    fn test_min_samples_leaf_respected() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let params = TreeParams {
            min_samples_leaf: 2,
            ..TreeParams::default()
        };
        // The best unconstrained split would isolate the outlier
        let tree = fit_all(&x, &[0.0, 0.0, 0.0, 100.0], &params);

        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.predict_row(array![3.0].view()), 50.0);
    }

    #[test]
    fn test_single_sample_is_leaf() {
        let x = array![[2024.0, 7.0]];
        let tree = fit_all(&x, &[-2.88], &TreeParams::default());
        assert_eq!(tree.predict_row(array![0.0, 0.0].view()), -2.88);
    }
}
