//! Histogram-binned regression trees.
//!
//! Features are bucketed once per fit into at most `max_bins` quantile bins
//! plus one bin for missing values. Splits are searched over bin boundaries
//! with both directions tried for the missing bin; the fitted tree stores raw
//! thresholds so prediction needs no binning.

use serde::{Deserialize, Serialize};

use crate::model::FeatureMatrix;

const MISSING_BIN: u8 = u8::MAX;

/// Largest supported bin count (one code is reserved for missing).
pub const MAX_BINS: usize = MISSING_BIN as usize - 1;

/// Binned copy of a feature matrix, stored column-major.
#[derive(Debug, Clone)]
pub struct BinnedFeatures {
    thresholds: Vec<Vec<f64>>,
    bins: Vec<Vec<u8>>,
}

impl BinnedFeatures {
    pub fn new(x: &FeatureMatrix, max_bins: usize) -> Self {
        let max_bins = max_bins.clamp(2, MAX_BINS);
        let mut thresholds = Vec::with_capacity(x.n_cols());
        let mut bins = Vec::with_capacity(x.n_cols());

        for j in 0..x.n_cols() {
            let mut observed: Vec<f64> = (0..x.n_rows())
                .map(|i| x.get(i, j))
                .filter(|v| v.is_finite())
                .collect();
            observed.sort_by(f64::total_cmp);
            let cuts = bin_thresholds(&observed, max_bins);

            let column = (0..x.n_rows())
                .map(|i| {
                    let v = x.get(i, j);
                    if v.is_finite() {
                        cuts.partition_point(|t| *t < v) as u8
                    } else {
                        MISSING_BIN
                    }
                })
                .collect();

            thresholds.push(cuts);
            bins.push(column);
        }

        Self { thresholds, bins }
    }

    fn n_bins(&self, feature: usize) -> usize {
        self.thresholds[feature].len() + 1
    }

    /// Whether row `row` falls left of the split at `bin` on `feature`.
    fn goes_left(&self, feature: usize, bin: usize, missing_left: bool, row: usize) -> bool {
        match self.bins[feature][row] {
            MISSING_BIN => missing_left,
            b => b as usize <= bin,
        }
    }
}

/// Upper bin edges: a value `v` falls in bin `b` when
/// `edges[b - 1] < v <= edges[b]`.
fn bin_thresholds(sorted: &[f64], max_bins: usize) -> Vec<f64> {
    let mut unique = sorted.to_vec();
    unique.dedup();

    match unique.len() {
        0 => Vec::new(),
        // Lets a constant feature still separate observed from missing.
        1 => unique,
        n if n <= max_bins => unique.windows(2).map(|w| w[0] + (w[1] - w[0]) / 2.0).collect(),
        _ => {
            let top = unique[unique.len() - 1];
            let mut edges: Vec<f64> = Vec::with_capacity(max_bins);
            for k in 1..max_bins {
                let v = sorted[k * sorted.len() / max_bins];
                if v < top && edges.last().is_none_or(|last| v > *last) {
                    edges.push(v);
                }
            }
            edges
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        missing_left: bool,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    missing_left,
                    left,
                    right,
                } => {
                    let v = row[*feature];
                    let go_left = if v.is_finite() {
                        v <= *threshold
                    } else {
                        *missing_left
                    };
                    idx = if go_left { *left } else { *right };
                }
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

#[derive(Debug, Clone, Copy)]
struct Split {
    feature: usize,
    bin: usize,
    missing_left: bool,
    gain: f64,
}

/// Grows one tree on a sample subset, fitting `gradients` by squared error.
pub struct TreeBuilder<'a> {
    pub binned: &'a BinnedFeatures,
    pub gradients: &'a [f64],
    pub features: &'a [usize],
    pub params: TreeParams,
}

impl TreeBuilder<'_> {
    /// `leaf_value` turns the rows reaching a leaf into its output.
    pub fn build<F>(&self, samples: Vec<usize>, leaf_value: F) -> RegressionTree
    where
        F: Fn(&[usize]) -> f64,
    {
        let mut nodes = Vec::new();
        self.grow(samples, 0, &mut nodes, &leaf_value);
        RegressionTree { nodes }
    }

    fn grow<F>(&self, samples: Vec<usize>, depth: usize, nodes: &mut Vec<Node>, leaf_value: &F) -> usize
    where
        F: Fn(&[usize]) -> f64,
    {
        let idx = nodes.len();
        nodes.push(Node::Leaf { value: 0.0 });

        let splittable = depth < self.params.max_depth
            && samples.len() >= 2 * self.params.min_samples_leaf.max(1);
        let split = if splittable {
            self.best_split(&samples)
        } else {
            None
        };

        let Some(split) = split else {
            nodes[idx] = Node::Leaf {
                value: leaf_value(&samples),
            };
            return idx;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = samples.into_iter().partition(|&row| {
            self.binned
                .goes_left(split.feature, split.bin, split.missing_left, row)
        });

        let left = self.grow(left, depth + 1, nodes, leaf_value);
        let right = self.grow(right, depth + 1, nodes, leaf_value);
        nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: self.binned.thresholds[split.feature][split.bin],
            missing_left: split.missing_left,
            left,
            right,
        };
        idx
    }

    fn best_split(&self, samples: &[usize]) -> Option<Split> {
        let n = samples.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        let total: f64 = samples.iter().map(|&i| self.gradients[i]).sum();
        let parent = total * total / n as f64;

        let mut best: Option<Split> = None;

        for &feature in self.features {
            let n_bins = self.binned.n_bins(feature);
            if n_bins < 2 {
                continue;
            }

            let mut hist_sum = vec![0.0; n_bins];
            let mut hist_count = vec![0usize; n_bins];
            let (mut missing_sum, mut missing_count) = (0.0, 0usize);
            for &row in samples {
                let g = self.gradients[row];
                match self.binned.bins[feature][row] {
                    MISSING_BIN => {
                        missing_sum += g;
                        missing_count += 1;
                    }
                    b => {
                        hist_sum[b as usize] += g;
                        hist_count[b as usize] += 1;
                    }
                }
            }

            let (mut cum_sum, mut cum_count) = (0.0, 0usize);
            for bin in 0..n_bins - 1 {
                cum_sum += hist_sum[bin];
                cum_count += hist_count[bin];

                for missing_left in [false, true] {
                    if missing_left && missing_count == 0 {
                        continue;
                    }
                    let (left_sum, left_count) = if missing_left {
                        (cum_sum + missing_sum, cum_count + missing_count)
                    } else {
                        (cum_sum, cum_count)
                    };
                    let right_count = n - left_count;
                    if left_count < min_leaf || right_count < min_leaf {
                        continue;
                    }
                    let right_sum = total - left_sum;
                    let gain = left_sum * left_sum / left_count as f64
                        + right_sum * right_sum / right_count as f64
                        - parent;

                    if gain > 1e-12 && best.is_none_or(|b| gain > b.gain) {
                        best = Some(Split {
                            feature,
                            bin,
                            missing_left,
                            gain,
                        });
                    }
                }
            }
        }

        best
    }
}
