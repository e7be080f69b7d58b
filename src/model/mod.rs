//! Quantile regression capability.
//!
//! The trainer, hindcaster and publisher only see the [`QuantileLearner`] /
//! [`QuantileModel`] pair, so the regression algorithm can be swapped
//! without touching them. [`gbm`] provides the default implementation.

pub mod gbm;
pub mod tree;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ModelError;

/// Row-major feature matrix. Missing values are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    pub fn new(n_rows: usize, n_cols: usize, data: Vec<f64>) -> Result<Self, ModelError> {
        if data.len() != n_rows * n_cols {
            return Err(ModelError::InvalidData(format!(
                "expected {} values for {}x{} matrix, got {}",
                n_rows * n_cols,
                n_rows,
                n_cols,
                data.len()
            )));
        }
        Ok(Self {
            n_rows,
            n_cols,
            data,
        })
    }

    /// Builds a matrix from rows of optional values.
    pub fn from_rows(rows: &[Vec<Option<f64>>], n_cols: usize) -> Result<Self, ModelError> {
        let mut data = Vec::with_capacity(rows.len() * n_cols);
        for row in rows {
            if row.len() != n_cols {
                return Err(ModelError::InvalidData(format!(
                    "row has {} values, expected {}",
                    row.len(),
                    n_cols
                )));
            }
            data.extend(row.iter().map(|v| v.unwrap_or(f64::NAN)));
        }
        Self::new(rows.len(), n_cols, data)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_cols..(i + 1) * self.n_cols]
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n_cols + j]
    }

    /// Copies the given rows, in the given order, into a new matrix.
    pub fn select_rows(&self, rows: &[usize]) -> FeatureMatrix {
        let mut data = Vec::with_capacity(rows.len() * self.n_cols);
        for &i in rows {
            data.extend_from_slice(self.row(i));
        }
        FeatureMatrix {
            n_rows: rows.len(),
            n_cols: self.n_cols,
            data,
        }
    }
}

/// Something that can fit a model for one quantile level.
pub trait QuantileLearner: Send + Sync {
    type Model: QuantileModel;

    fn fit(&self, x: &FeatureMatrix, y: &[f64], quantile: f64) -> Result<Self::Model, ModelError>;
}

/// A fitted quantile model. Columns are bound by position only.
pub trait QuantileModel: Serialize + DeserializeOwned + Send + Sync {
    fn quantile(&self) -> f64;

    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>, ModelError>;
}
