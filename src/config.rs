//! Pipeline configuration.
//!
//! Stored as a TOML file on disk:
//! ```toml
//! raster = "15min"
//! target_col = "q_cms"
//! horizon_steps = [24, 48, 96]
//! training_mode = "per_station"
//! min_samples = 120
//!
//! [[exogenous]]
//! name = "icon"
//! path = "data/raw/icon_forecast.csv"
//! ```
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::model::gbm::GbmParams;
use crate::raster::RasterSpec;

/// Whether one model triple is trained across all stations or per station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    Global,
    PerStation,
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingMode::Global => write!(f, "global"),
            TrainingMode::PerStation => write!(f, "per_station"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_dir: PathBuf,
    pub features: PathBuf,
    pub artifacts: PathBuf,
    pub hindcast_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            features: PathBuf::from("data/processed/features.csv"),
            artifacts: PathBuf::from("artifacts"),
            hindcast_dir: PathBuf::from("data/processed/hindcast"),
            metrics_dir: PathBuf::from("data/processed/metrics"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Lag offsets, in raster steps.
    pub lags: Vec<usize>,
    /// Trailing window sizes, in raster steps.
    pub rolls: Vec<usize>,
    /// Columns whose rolling windows are sums rather than means.
    pub sum_columns: Vec<String>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lags: vec![1, 2, 4, 8, 12, 24, 48],
            rolls: vec![4, 8, 24],
            sum_columns: vec!["rain_mm".to_string(), "icon_rr_mm".to_string()],
        }
    }
}

/// Inclusive plausibility range for one column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite()
            && self.min.is_none_or(|min| value >= min)
            && self.max.is_none_or(|max| value <= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// Longest interior run of missing values filled by interpolation.
    pub max_gap: usize,
    pub bounds: BTreeMap<String, Bounds>,
}

impl Default for QcConfig {
    fn default() -> Self {
        let non_negative = Bounds {
            min: Some(0.0),
            max: None,
        };
        let bounds = BTreeMap::from([
            ("q_cms".to_string(), non_negative),
            ("h_cm".to_string(), non_negative),
            ("rain_mm".to_string(), non_negative),
            ("icon_rr_mm".to_string(), non_negative),
            (
                "sm_pct".to_string(),
                Bounds {
                    min: Some(0.0),
                    max: Some(100.0),
                },
            ),
            (
                "temp_c".to_string(),
                Bounds {
                    min: Some(-60.0),
                    max: Some(60.0),
                },
            ),
        ]);
        Self {
            max_gap: 8,
            bounds,
        }
    }
}

/// Forward-chaining cross-validation split counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CvConfig {
    pub small_splits: usize,
    pub large_splits: usize,
    /// Sample count at and above which `large_splits` is used.
    pub large_threshold: usize,
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            small_splits: 3,
            large_splits: 5,
            large_threshold: 500,
        }
    }
}

impl CvConfig {
    pub fn splits_for(&self, samples: usize) -> usize {
        if samples < self.large_threshold {
            self.small_splits
        } else {
            self.large_splits
        }
    }
}

/// An auxiliary covariate source merged on `(ts, station_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExogenousSource {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Rolling window sizes, in points.
    pub windows: Vec<usize>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { windows: vec![96] }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub output: PathBuf,
    /// Base URL messages are POSTed under.
    pub endpoint: Option<String>,
    /// Name of the environment variable holding a bearer token.
    pub token_env: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("artifacts/forecast_latest.json"),
            endpoint: None,
            token_env: None,
            s3_bucket: None,
            s3_prefix: "forecasts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub raster: RasterSpec,
    pub target_col: String,
    pub horizon_steps: Vec<usize>,
    pub training_mode: TrainingMode,
    /// Minimum labeled rows for a scope to be trained.
    pub min_samples: usize,
    /// Scope tasks run at once.
    pub concurrency: usize,
    pub paths: PathsConfig,
    pub features: FeatureConfig,
    pub qc: QcConfig,
    pub cv: CvConfig,
    pub model: GbmParams,
    pub exogenous: Vec<ExogenousSource>,
    pub evaluation: EvaluationConfig,
    pub publish: PublishConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raster: RasterSpec::default(),
            target_col: "q_cms".to_string(),
            horizon_steps: vec![24, 48, 96],
            training_mode: TrainingMode::Global,
            min_samples: 120,
            concurrency: 4,
            paths: PathsConfig::default(),
            features: FeatureConfig::default(),
            qc: QcConfig::default(),
            cv: CvConfig::default(),
            model: GbmParams::default(),
            exogenous: Vec::new(),
            evaluation: EvaluationConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads and validates the config at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(PipelineError::Config(msg.to_string()));

        if self.target_col.trim().is_empty() {
            return fail("target_col must not be empty");
        }
        if self.horizon_steps.is_empty() {
            return fail("horizon_steps must list at least one horizon");
        }
        if self.horizon_steps.contains(&0) {
            return fail("horizon_steps must be positive");
        }
        if self.features.lags.contains(&0) || self.features.rolls.contains(&0) {
            return fail("lags and rolling windows must be positive");
        }
        if self.concurrency == 0 {
            return fail("concurrency must be at least 1");
        }
        if self.cv.small_splits < 2 || self.cv.large_splits < 2 {
            return fail("cross-validation needs at least 2 splits");
        }
        if self.min_samples <= self.cv.small_splits.max(self.cv.large_splits) {
            return fail("min_samples must exceed the cross-validation split count");
        }
        if self.evaluation.windows.contains(&0) {
            return fail("evaluation windows must be positive");
        }
        self.model.validate()
    }

    pub fn horizon_minutes(&self, horizon_steps: usize) -> i64 {
        horizon_steps as i64 * self.raster.minutes()
    }

    /// Paths of all configured exogenous sources, enabled or not. These are
    /// never read as base series.
    pub fn exogenous_paths(&self) -> Vec<PathBuf> {
        self.exogenous.iter().map(|s| s.path.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config.raster.seconds(), 900);
        assert_eq!(config.target_col, "q_cms");
        assert_eq!(config.horizon_steps, vec![24, 48, 96]);
        assert_eq!(config.training_mode, TrainingMode::Global);
        assert_eq!(config.min_samples, 120);
    }

    #[test]
    fn test_parses_full_document() {
        let config = PipelineConfig::from_toml(
            r#"
            raster = "1h"
            target_col = "h_cm"
            horizon_steps = [1, 6]
            training_mode = "per_station"
            min_samples = 50

            [features]
            lags = [1, 2]
            rolls = [3]

            [cv]
            small_splits = 2

            [[exogenous]]
            name = "soil"
            path = "data/raw/soil_moisture.csv"
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.raster.minutes(), 60);
        assert_eq!(config.training_mode, TrainingMode::PerStation);
        assert_eq!(config.horizon_minutes(6), 360);
        assert_eq!(config.features.rolls, vec![3]);
        assert_eq!(config.cv.small_splits, 2);
        assert_eq!(config.cv.large_splits, 5);
        assert!(!config.exogenous[0].enabled);
    }

    #[test]
    fn test_unknown_training_mode_is_fatal() {
        let err = PipelineConfig::from_toml(r#"training_mode = "federated""#).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("federated"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(PipelineConfig::from_toml("horizon_steps = []").is_err());
        assert!(PipelineConfig::from_toml("horizon_steps = [0]").is_err());
        assert!(PipelineConfig::from_toml(r#"raster = "fortnightly""#).is_err());
        assert!(PipelineConfig::from_toml("[model]\nlearning_rate = 0.0").is_err());
    }

    #[test]
    fn test_min_samples_must_exceed_split_count() {
        let err = PipelineConfig::from_toml("min_samples = 5").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("min_samples"));

        assert!(PipelineConfig::from_toml("min_samples = 6").is_ok());
        assert!(PipelineConfig::from_toml("min_samples = 6\n[cv]\nlarge_splits = 6").is_err());
    }

    #[test]
    fn test_cv_split_count_adapts_to_volume() {
        let cv = CvConfig::default();
        assert_eq!(cv.splits_for(200), 3);
        assert_eq!(cv.splits_for(499), 3);
        assert_eq!(cv.splits_for(500), 5);
    }

    #[test]
    fn test_bounds_contains() {
        let b = Bounds {
            min: Some(0.0),
            max: Some(100.0),
        };
        assert!(b.contains(0.0));
        assert!(b.contains(100.0));
        assert!(!b.contains(-0.1));
        assert!(!b.contains(f64::NAN));
    }
}
