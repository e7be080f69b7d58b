//! Gradient-boosted trees under the pinball (quantile) loss.
//!
//! Each round fits a tree to the negative pinball gradient (`alpha` where
//! the current prediction is below the label, `alpha - 1` otherwise) and
//! sets every leaf to the alpha-quantile of the residuals that reach it.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, PipelineError};
use crate::model::tree::{BinnedFeatures, MAX_BINS, RegressionTree, TreeBuilder, TreeParams};
use crate::model::{FeatureMatrix, QuantileLearner, QuantileModel};

/// GBM hyperparameters. Identical across the three quantile levels of a scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GbmParams {
    /// Number of boosting rounds (trees)
    pub n_estimators: usize,
    /// Shrinkage applied to every tree
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Fraction of rows drawn (without replacement) per round
    pub subsample: f64,
    /// Fraction of features considered per tree
    pub colsample: f64,
    pub max_bins: usize,
    pub seed: u64,
}

impl Default for GbmParams {
    fn default() -> Self {
        Self {
            n_estimators: 300,
            learning_rate: 0.05,
            max_depth: 5,
            min_samples_leaf: 20,
            subsample: 0.8,
            colsample: 0.8,
            max_bins: 64,
            seed: 42,
        }
    }
}

impl GbmParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::Config(msg));

        if self.n_estimators == 0 {
            return fail("model.n_estimators must be positive".into());
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return fail(format!(
                "model.learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if self.min_samples_leaf == 0 {
            return fail("model.min_samples_leaf must be positive".into());
        }
        for (name, value) in [("subsample", self.subsample), ("colsample", self.colsample)] {
            if !(value > 0.0 && value <= 1.0) {
                return fail(format!("model.{name} must be in (0, 1], got {value}"));
            }
        }
        if !(2..=MAX_BINS).contains(&self.max_bins) {
            return fail(format!(
                "model.max_bins must be in 2..={MAX_BINS}, got {}",
                self.max_bins
            ));
        }
        Ok(())
    }
}

/// Fits [`GbmQuantileModel`]s.
#[derive(Debug, Clone, Default)]
pub struct GbmQuantileLearner {
    params: GbmParams,
}

impl GbmQuantileLearner {
    pub fn new(params: GbmParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &GbmParams {
        &self.params
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbmQuantileModel {
    quantile: f64,
    n_features: usize,
    init: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

impl GbmQuantileModel {
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        self.init
            + self.learning_rate * self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }
}

impl QuantileLearner for GbmQuantileLearner {
    type Model = GbmQuantileModel;

    fn fit(&self, x: &FeatureMatrix, y: &[f64], alpha: f64) -> Result<GbmQuantileModel, ModelError> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(ModelError::InvalidData(format!(
                "quantile must be in (0, 1), got {alpha}"
            )));
        }
        if x.n_rows() != y.len() {
            return Err(ModelError::InvalidData(format!(
                "{} feature rows but {} labels",
                x.n_rows(),
                y.len()
            )));
        }
        if y.is_empty() {
            return Err(ModelError::TrainingFailed("no training rows".into()));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::InvalidData("labels must be finite".into()));
        }

        let p = &self.params;
        let n = y.len();
        let n_cols = x.n_cols();
        let binned = BinnedFeatures::new(x, p.max_bins);
        let tree_params = TreeParams {
            max_depth: p.max_depth,
            min_samples_leaf: p.min_samples_leaf,
        };

        let init = quantile(&mut y.to_vec(), alpha);
        let mut raw = vec![init; n];
        let mut gradients = vec![0.0; n];
        let mut rng = StdRng::seed_from_u64(p.seed);

        let n_rows_per_round = ((n as f64 * p.subsample).round() as usize).clamp(1, n);
        let n_cols_per_tree = ((n_cols as f64 * p.colsample).ceil() as usize).min(n_cols);

        let mut trees = Vec::with_capacity(p.n_estimators);
        for _ in 0..p.n_estimators {
            for i in 0..n {
                gradients[i] = if y[i] > raw[i] { alpha } else { alpha - 1.0 };
            }

            let mut samples: Vec<usize> = if n_rows_per_round < n {
                index::sample(&mut rng, n, n_rows_per_round).into_vec()
            } else {
                (0..n).collect()
            };
            samples.sort_unstable();

            let mut features: Vec<usize> = if n_cols_per_tree < n_cols {
                index::sample(&mut rng, n_cols, n_cols_per_tree).into_vec()
            } else {
                (0..n_cols).collect()
            };
            features.sort_unstable();

            let tree = {
                let residual_quantile = |rows: &[usize]| {
                    let mut residuals: Vec<f64> = rows.iter().map(|&i| y[i] - raw[i]).collect();
                    quantile(&mut residuals, alpha)
                };
                TreeBuilder {
                    binned: &binned,
                    gradients: &gradients,
                    features: &features,
                    params: tree_params,
                }
                .build(samples, residual_quantile)
            };

            for (i, value) in raw.iter_mut().enumerate() {
                *value += p.learning_rate * tree.predict_row(x.row(i));
            }
            trees.push(tree);
        }

        Ok(GbmQuantileModel {
            quantile: alpha,
            n_features: n_cols,
            init,
            learning_rate: p.learning_rate,
            trees,
        })
    }
}

impl QuantileModel for GbmQuantileModel {
    fn quantile(&self) -> f64 {
        self.quantile
    }

    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
        if x.n_cols() != self.n_features {
            return Err(ModelError::PredictionFailed(format!(
                "model expects {} features, got {}",
                self.n_features,
                x.n_cols()
            )));
        }
        Ok((0..x.n_rows()).map(|i| self.predict_row(x.row(i))).collect())
    }
}

/// Linear-interpolated `q`-quantile. Sorts `values` in place; 0.0 when empty.
fn quantile(values: &mut [f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let pos = q * (values.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (pos - lo as f64)
}
