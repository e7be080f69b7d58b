//! Forward-chaining (expanding window) cross-validation.

use tracing::debug;

use crate::error::ModelError;
use crate::metrics::SkillScores;
use crate::model::{FeatureMatrix, QuantileLearner, QuantileModel};

/// Quantile level used as the cross-validation proxy.
pub const PROXY_QUANTILE: f64 = 0.5;

/// One fold: train on `[0, train_end)`, test on `[test_start, test_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationSplit {
    pub train_end: usize,
    pub test_start: usize,
    pub test_end: usize,
}

/// `splits` equally sized test blocks at the end of the series, each trained
/// on everything before it. Empty when there is too little data for a
/// non-empty training set and test block.
pub fn forward_chaining_splits(data_len: usize, splits: usize) -> Vec<ValidationSplit> {
    if splits == 0 {
        return Vec::new();
    }
    let test_size = data_len / (splits + 1);
    if test_size == 0 {
        return Vec::new();
    }

    let first_test = data_len - splits * test_size;
    (0..splits)
        .map(|k| {
            let test_start = first_test + k * test_size;
            ValidationSplit {
                train_end: test_start,
                test_start,
                test_end: test_start + test_size,
            }
        })
        .collect()
}

/// Held-out predictions of every fold, concatenated in time order.
#[derive(Debug, Clone, Default)]
pub struct OutOfFold {
    pub observed: Vec<f64>,
    pub predicted: Vec<f64>,
}

impl OutOfFold {
    /// Scores the pooled predictions once, not per fold.
    pub fn scores(&self) -> SkillScores {
        SkillScores::compute(&self.observed, &self.predicted)
    }
}

/// Fits the median model on each expanding window and predicts the block
/// after it. Fails when `y` is too short to produce a single fold.
pub fn cross_validate<L: QuantileLearner>(
    learner: &L,
    x: &FeatureMatrix,
    y: &[f64],
    splits: usize,
) -> Result<OutOfFold, ModelError> {
    let plan = forward_chaining_splits(y.len(), splits);
    if plan.is_empty() {
        return Err(ModelError::TrainingFailed(format!(
            "{} rows are too few for {} cross-validation folds",
            y.len(),
            splits
        )));
    }
    let mut out = OutOfFold::default();

    for (fold, split) in plan.iter().enumerate() {
        let train_rows: Vec<usize> = (0..split.train_end).collect();
        let test_rows: Vec<usize> = (split.test_start..split.test_end).collect();

        let model = learner.fit(
            &x.select_rows(&train_rows),
            &y[..split.train_end],
            PROXY_QUANTILE,
        )?;
        let predicted = model.predict(&x.select_rows(&test_rows))?;

        debug!(
            fold,
            train = split.train_end,
            test = test_rows.len(),
            "Cross-validation fold"
        );
        out.observed
            .extend_from_slice(&y[split.test_start..split.test_end]);
        out.predicted.extend(predicted);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::gbm::{GbmParams, GbmQuantileLearner};

    #[test]
    fn test_splits_match_expanding_window_layout() {
        let splits = forward_chaining_splits(10, 3);
        assert_eq!(
            splits,
            vec![
                ValidationSplit {
                    train_end: 4,
                    test_start: 4,
                    test_end: 6
                },
                ValidationSplit {
                    train_end: 6,
                    test_start: 6,
                    test_end: 8
                },
                ValidationSplit {
                    train_end: 8,
                    test_start: 8,
                    test_end: 10
                },
            ]
        );
    }

    #[test]
    fn test_splits_never_test_before_training() {
        for n in [7, 120, 499, 1000] {
            for k in [2, 3, 5] {
                for s in forward_chaining_splits(n, k) {
                    assert!(s.train_end > 0);
                    assert!(s.test_start >= s.train_end);
                    assert!(s.test_end <= n);
                }
            }
        }
    }

    #[test]
    fn test_too_little_data_yields_no_splits() {
        assert!(forward_chaining_splits(3, 5).is_empty());
        assert!(forward_chaining_splits(10, 0).is_empty());
    }

    #[test]
    fn test_cross_validate_pools_all_folds() {
        let n = 120;
        let x = FeatureMatrix::new(n, 1, (0..n).map(|i| (i % 4) as f64).collect()).unwrap();
        let y: Vec<f64> = (0..n).map(|i| (i % 4) as f64 * 2.0).collect();
        let learner = GbmQuantileLearner::new(GbmParams {
            n_estimators: 60,
            learning_rate: 0.3,
            min_samples_leaf: 2,
            subsample: 1.0,
            ..GbmParams::default()
        });

        let oof = cross_validate(&learner, &x, &y, 3).unwrap();
        assert_eq!(oof.observed.len(), 90);
        assert_eq!(oof.predicted.len(), 90);
        assert_eq!(oof.observed[..], y[30..]);

        let scores = oof.scores();
        assert!(scores.mae.unwrap() < 0.5);
        assert!(scores.nse.unwrap() > 0.8);
    }

    #[test]
    fn test_cross_validate_without_folds_fails() {
        let x = FeatureMatrix::new(3, 1, vec![1.0, 2.0, 3.0]).unwrap();
        let learner = GbmQuantileLearner::new(GbmParams::default());
        match cross_validate(&learner, &x, &[1.0, 2.0, 3.0], 5) {
            Err(ModelError::TrainingFailed(msg)) => assert!(msg.contains("3 rows")),
            other => panic!("expected a training failure, got {other:?}"),
        }
    }
}
