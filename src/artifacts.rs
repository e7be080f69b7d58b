//! On-disk model artifacts.
//!
//! Global scopes live under `{root}/{H}/`, per-station scopes under
//! `{root}/{station}/{H}/`. A scope directory holds the three gzip-compressed
//! quantile models, `meta.json`, and finally the `metrics.json` checkpoint,
//! which is written last and marks the scope as complete.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::TrainingMode;
use crate::error::{ModelError, Result};
use crate::metrics::SkillScores;
use crate::model::{FeatureMatrix, QuantileModel};
use crate::output;
use crate::raster::RasterSpec;

pub const META_FILE: &str = "meta.json";
pub const CHECKPOINT_FILE: &str = "metrics.json";
pub const REPORT_FILE: &str = "report.json";
pub const STATUS_FILE: &str = "training_status.json";

/// The quantile levels of a model triple, with their file labels.
pub const QUANTILES: [(&str, f64); 3] = [("p10", 0.1), ("p50", 0.5), ("p90", 0.9)];

/// A `(horizon[, station])` combination with its own model triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    pub horizon_steps: usize,
    /// `None` for the global scope of a horizon.
    pub station_id: Option<String>,
}

impl Scope {
    pub fn global(horizon_steps: usize) -> Self {
        Self {
            horizon_steps,
            station_id: None,
        }
    }

    pub fn station(station_id: &str, horizon_steps: usize) -> Self {
        Self {
            horizon_steps,
            station_id: Some(station_id.to_string()),
        }
    }

    /// The scope that serves `station_id` at `horizon_steps` under `mode`.
    pub fn for_station(mode: TrainingMode, station_id: &str, horizon_steps: usize) -> Self {
        match mode {
            TrainingMode::Global => Self::global(horizon_steps),
            TrainingMode::PerStation => Self::station(station_id, horizon_steps),
        }
    }

    /// Training report key: `global_{H}` or `{station}_{H}`.
    pub fn key(&self) -> String {
        match &self.station_id {
            Some(station) => format!("{station}_{}", self.horizon_steps),
            None => format!("global_{}", self.horizon_steps),
        }
    }

    pub fn mode(&self) -> TrainingMode {
        if self.station_id.is_some() {
            TrainingMode::PerStation
        } else {
            TrainingMode::Global
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Metadata persisted next to a model triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    /// Model input columns, in matrix order.
    pub features: Vec<String>,
    pub raster: RasterSpec,
    pub target_col: String,
    pub horizon_steps: usize,
    pub mode: TrainingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
}

/// Raw predictions of a model triple. The levels are not forced to be
/// ordered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuantilePredictions {
    pub p10: Vec<f64>,
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
}

impl QuantilePredictions {
    /// Rows where the band is not ordered `p10 <= p50 <= p90`.
    pub fn crossings(&self) -> usize {
        self.p10
            .iter()
            .zip(&self.p50)
            .zip(&self.p90)
            .filter(|((lo, mid), hi)| lo > mid || mid > hi)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelTriple<M> {
    pub p10: M,
    pub p50: M,
    pub p90: M,
}

impl<M: QuantileModel> ModelTriple<M> {
    pub fn predict(&self, x: &FeatureMatrix) -> std::result::Result<QuantilePredictions, ModelError> {
        Ok(QuantilePredictions {
            p10: self.p10.predict(x)?,
            p50: self.p50.predict(x)?,
            p90: self.p90.predict(x)?,
        })
    }
}

impl<M> ModelTriple<M> {
    /// The model stored under a `QUANTILES` label.
    pub fn by_label(&self, label: &str) -> Option<&M> {
        match label {
            "p10" => Some(&self.p10),
            "p50" => Some(&self.p50),
            "p90" => Some(&self.p90),
            _ => None,
        }
    }
}

/// A loaded scope: metadata plus its models.
#[derive(Debug, Clone)]
pub struct ScopeArtifacts<M> {
    pub meta: ModelMeta,
    pub models: ModelTriple<M>,
}

fn model_file(label: &str) -> String {
    format!("model_{label}.json.gz")
}

fn write_model<M: QuantileModel>(path: &Path, model: &M) -> Result<()> {
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(path)?), Compression::default());
    serde_json::to_writer(&mut encoder, model)?;
    encoder.finish()?.flush()?;
    Ok(())
}

fn read_model<M: QuantileModel>(path: &Path) -> Result<M> {
    let decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    Ok(serde_json::from_reader(decoder)?)
}

/// Artifact directory tree rooted at `paths.artifacts`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scope_dir(&self, scope: &Scope) -> PathBuf {
        let horizon = scope.horizon_steps.to_string();
        match &scope.station_id {
            Some(station) => self.root.join(station).join(horizon),
            None => self.root.join(horizon),
        }
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join(REPORT_FILE)
    }

    /// Skipped and failed scopes of the last training run.
    pub fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    /// Replaces everything stored for `scope`. The checkpoint of a previous
    /// run is removed first so an interrupted save never looks complete.
    pub fn save<M: QuantileModel>(
        &self,
        scope: &Scope,
        meta: &ModelMeta,
        models: &ModelTriple<M>,
    ) -> Result<()> {
        let dir = self.scope_dir(scope);
        fs::create_dir_all(&dir)?;
        let checkpoint = dir.join(CHECKPOINT_FILE);
        if checkpoint.exists() {
            fs::remove_file(&checkpoint)?;
        }

        for (label, _) in QUANTILES {
            let model = models.by_label(label).ok_or_else(|| {
                ModelError::InvalidData(format!("unknown quantile label {label}"))
            })?;
            write_model(&dir.join(model_file(label)), model)?;
        }
        output::write_json(&dir.join(META_FILE), meta)?;

        debug!(scope = %scope, dir = %dir.display(), "Saved models");
        Ok(())
    }

    /// Loads a scope, or `None` when it has no complete set of files.
    pub fn load<M: QuantileModel>(&self, scope: &Scope) -> Result<Option<ScopeArtifacts<M>>> {
        if !self.has_models(scope) {
            return Ok(None);
        }
        let dir = self.scope_dir(scope);
        let meta: ModelMeta = output::read_json(&dir.join(META_FILE))?;
        let models = ModelTriple {
            p10: read_model(&dir.join(model_file("p10")))?,
            p50: read_model(&dir.join(model_file("p50")))?,
            p90: read_model(&dir.join(model_file("p90")))?,
        };
        Ok(Some(ScopeArtifacts { meta, models }))
    }

    pub fn load_meta(&self, scope: &Scope) -> Result<Option<ModelMeta>> {
        let path = self.scope_dir(scope).join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        output::read_json(&path).map(Some)
    }

    pub fn has_models(&self, scope: &Scope) -> bool {
        let dir = self.scope_dir(scope);
        dir.join(META_FILE).is_file()
            && QUANTILES
                .iter()
                .all(|(label, _)| dir.join(model_file(label)).is_file())
    }

    pub fn write_checkpoint(&self, scope: &Scope, scores: &SkillScores) -> Result<()> {
        output::write_json(&self.scope_dir(scope).join(CHECKPOINT_FILE), scores)
    }

    /// Checkpointed scores of a scope whose models are all present.
    pub fn read_checkpoint(&self, scope: &Scope) -> Result<Option<SkillScores>> {
        let path = self.scope_dir(scope).join(CHECKPOINT_FILE);
        if !path.is_file() || !self.has_models(scope) {
            return Ok(None);
        }
        let scores = output::read_json(&path)?;
        info!(scope = %scope, "Found checkpoint");
        Ok(Some(scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QuantileLearner;
    use crate::model::gbm::{GbmParams, GbmQuantileLearner, GbmQuantileModel};

    fn meta(features: Vec<String>, station_id: Option<String>) -> ModelMeta {
        ModelMeta {
            features,
            raster: RasterSpec::parse("15min").unwrap(),
            target_col: "q_cms".into(),
            horizon_steps: 4,
            mode: if station_id.is_some() {
                TrainingMode::PerStation
            } else {
                TrainingMode::Global
            },
            station_id,
        }
    }

    fn triple() -> ModelTriple<GbmQuantileModel> {
        let learner = GbmQuantileLearner::new(GbmParams {
            n_estimators: 5,
            min_samples_leaf: 1,
            ..GbmParams::default()
        });
        let x = FeatureMatrix::new(4, 2, vec![1.0, 0.0, 2.0, 0.0, 3.0, 1.0, 4.0, 1.0]).unwrap();
        let y = [1.0, 2.0, 3.0, 4.0];
        ModelTriple {
            p10: learner.fit(&x, &y, 0.1).unwrap(),
            p50: learner.fit(&x, &y, 0.5).unwrap(),
            p90: learner.fit(&x, &y, 0.9).unwrap(),
        }
    }

    #[test]
    fn test_scope_keys_and_layout() {
        let store = ArtifactStore::new("artifacts");
        let global = Scope::global(24);
        let station = Scope::station("S1", 24);
        assert_eq!(global.key(), "global_24");
        assert_eq!(station.key(), "S1_24");
        assert_eq!(store.scope_dir(&global), PathBuf::from("artifacts/24"));
        assert_eq!(store.scope_dir(&station), PathBuf::from("artifacts/S1/24"));
        assert_eq!(
            Scope::for_station(TrainingMode::Global, "S1", 24),
            global
        );
    }

    #[test]
    fn test_meta_round_trip_preserves_feature_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let scope = Scope::station("S1", 4);
        let features: Vec<String> = ["rain_mm", "q_cms_lag1", "q_cms_roll4", "doy", "hod"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let meta = meta(features.clone(), Some("S1".into()));

        store.save(&scope, &meta, &triple()).unwrap();
        let loaded: ScopeArtifacts<GbmQuantileModel> = store.load(&scope).unwrap().unwrap();
        assert_eq!(loaded.meta.features, features);
        assert_eq!(loaded.meta, meta);
        assert_eq!(loaded.models, triple());
    }

    #[test]
    fn test_global_meta_omits_station() {
        let json = serde_json::to_value(meta(vec!["doy".into()], None)).unwrap();
        assert!(json.get("station_id").is_none());
        assert_eq!(json["mode"], "global");
        assert_eq!(json["raster"], "15min");
    }

    #[test]
    fn test_missing_scope_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let loaded: Option<ScopeArtifacts<GbmQuantileModel>> =
            store.load(&Scope::global(8)).unwrap();
        assert!(loaded.is_none());
        assert!(store.load_meta(&Scope::global(8)).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_requires_models_and_is_cleared_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let scope = Scope::global(4);
        let scores = SkillScores {
            mae: Some(0.5),
            ..SkillScores::default()
        };

        store.write_checkpoint(&scope, &scores).unwrap();
        assert!(store.read_checkpoint(&scope).unwrap().is_none());

        store.save(&scope, &meta(vec![], None), &triple()).unwrap();
        store.write_checkpoint(&scope, &scores).unwrap();
        assert_eq!(store.read_checkpoint(&scope).unwrap(), Some(scores));

        store.save(&scope, &meta(vec![], None), &triple()).unwrap();
        assert!(store.read_checkpoint(&scope).unwrap().is_none());
    }

    #[test]
    fn test_crossings_are_counted_not_fixed() {
        let preds = QuantilePredictions {
            p10: vec![1.0, 5.0],
            p50: vec![2.0, 3.0],
            p90: vec![3.0, 1.0],
        };
        assert_eq!(preds.crossings(), 1);
        assert_eq!(preds.p10[1], 5.0);
    }

    #[test]
    fn test_by_label_knows_only_the_three_quantiles() {
        let models = ModelTriple {
            p10: 1,
            p50: 5,
            p90: 9,
        };
        assert_eq!(models.by_label("p10"), Some(&1));
        assert_eq!(models.by_label("p90"), Some(&9));
        assert_eq!(models.by_label("p95"), None);
        assert_eq!(models.by_label(""), None);
    }
}
