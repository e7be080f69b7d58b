//! Error types shared across the pipeline.
//!
//! Library code returns these typed errors; the binary wraps them in
//! `anyhow` with context at the call sites.

use thiserror::Error;

/// Errors raised by a quantile regressor during fit or predict.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Training failed: {0}")]
    TrainingFailed(String),

    #[error("Prediction failed: {0}")]
    PredictionFailed(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Errors raised by the pipeline stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Fatal: the configuration cannot drive a run.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fatal: nothing to ingest.
    #[error("No input files found in {0}")]
    NoInput(String),

    #[error("Column '{0}' not found")]
    MissingColumn(String),

    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    /// A scope's artifact lists features the table does not provide.
    #[error("Feature mismatch for {scope}: missing {missing:?}")]
    FeatureMismatch { scope: String, missing: Vec<String> },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
