//! Quantile model training per scope.
//!
//! Every scope moves through `pending -> cross_validating -> full_fit ->
//! persisted`, or ends early as skipped (too few labeled rows) or failed.
//! A failed scope is recorded in the report and never stops the others.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::artifacts::{ArtifactStore, ModelMeta, ModelTriple, QUANTILES, Scope};
use crate::config::{PipelineConfig, TrainingMode};
use crate::cv;
use crate::error::Result;
use crate::features::feature_names;
use crate::frame::{FeatureTable, StationFrame};
use crate::labels::build_dataset;
use crate::metrics::SkillScores;
use crate::model::QuantileLearner;
use crate::output;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Pending,
    CrossValidating,
    FullFit,
    Persisted,
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeState::Pending => "pending",
            ScopeState::CrossValidating => "cross_validating",
            ScopeState::FullFit => "full_fit",
            ScopeState::Persisted => "persisted",
        };
        write!(f, "{name}")
    }
}

fn enter(scope: &Scope, state: ScopeState) {
    debug!(scope = %scope, state = %state, "Scope state");
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScopeOutcome {
    Trained(SkillScores),
    /// Taken from a checkpoint of an earlier run.
    Resumed(SkillScores),
    Skipped { rows: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedScope {
    pub scope: String,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedScope {
    pub scope: String,
    pub reason: String,
}

/// Scopes left out of `report.json`, written to `training_status.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    #[serde(default)]
    pub skipped: Vec<SkippedScope>,
    #[serde(default)]
    pub failed: Vec<FailedScope>,
}

/// Walk-forward scores per trained scope key, plus the scopes that were not
/// trained. Only `scores` goes into `report.json`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    pub scores: BTreeMap<String, SkillScores>,
    pub skipped: Vec<SkippedScope>,
    pub failed: Vec<FailedScope>,
}

impl TrainingReport {
    pub fn record(&mut self, scope: &Scope, outcome: ScopeOutcome) {
        match outcome {
            ScopeOutcome::Trained(scores) | ScopeOutcome::Resumed(scores) => {
                self.scores.insert(scope.key(), scores);
            }
            ScopeOutcome::Skipped { rows } => self.skipped.push(SkippedScope {
                scope: scope.key(),
                rows,
            }),
            ScopeOutcome::Failed { reason } => self.failed.push(FailedScope {
                scope: scope.key(),
                reason,
            }),
        }
    }

    pub fn status(&self) -> TrainingStatus {
        TrainingStatus {
            skipped: self.skipped.clone(),
            failed: self.failed.clone(),
        }
    }

    /// Writes `report.json` (scope key to scores) and the status sidecar.
    pub fn write(&self, store: &ArtifactStore) -> Result<()> {
        output::write_json(&store.report_path(), &self.scores)?;
        output::write_json(&store.status_path(), &self.status())
    }
}

/// Scopes to train: one per horizon, times one per station in per-station
/// mode.
pub fn plan_scopes(mode: TrainingMode, station_ids: &[String], horizons: &[usize]) -> Vec<Scope> {
    match mode {
        TrainingMode::Global => horizons.iter().map(|&h| Scope::global(h)).collect(),
        TrainingMode::PerStation => horizons
            .iter()
            .flat_map(|&h| station_ids.iter().map(move |sid| Scope::station(sid, h)))
            .collect(),
    }
}

/// The station series a scope trains on.
pub fn scope_frames<'a>(table: &'a FeatureTable, scope: &Scope) -> Vec<&'a StationFrame> {
    match &scope.station_id {
        Some(station_id) => table.get(station_id).into_iter().collect(),
        None => table.frames().collect(),
    }
}

/// Trains and persists one scope. Regression failures come back as
/// [`ScopeOutcome::Failed`]; other errors are returned.
pub fn train_scope<L: QuantileLearner>(
    learner: &L,
    table: &FeatureTable,
    scope: &Scope,
    features: &[String],
    config: &PipelineConfig,
    store: &ArtifactStore,
) -> Result<ScopeOutcome> {
    enter(scope, ScopeState::Pending);
    let frames = scope_frames(table, scope);
    let dataset = build_dataset(
        &frames,
        features,
        &config.target_col,
        scope.horizon_steps,
        &config.raster,
    )?;

    // The sample floor is a per-station policy; a global scope trains on
    // whatever labeled rows exist.
    if scope.station_id.is_some() && dataset.len() < config.min_samples {
        return Ok(ScopeOutcome::Skipped {
            rows: dataset.len(),
        });
    }

    enter(scope, ScopeState::CrossValidating);
    let splits = config.cv.splits_for(dataset.len());
    let scores = match cv::cross_validate(learner, &dataset.x, &dataset.y, splits) {
        Ok(oof) => oof.scores(),
        Err(e) => {
            return Ok(ScopeOutcome::Failed {
                reason: e.to_string(),
            });
        }
    };
    debug!(scope = %scope, splits, ?scores, "Cross-validation done");

    enter(scope, ScopeState::FullFit);
    let mut fitted = Vec::with_capacity(QUANTILES.len());
    for (label, quantile) in QUANTILES {
        match learner.fit(&dataset.x, &dataset.y, quantile) {
            Ok(model) => fitted.push(model),
            Err(e) => {
                return Ok(ScopeOutcome::Failed {
                    reason: format!("{label}: {e}"),
                });
            }
        }
    }
    let mut fitted = fitted.into_iter();
    let (Some(p10), Some(p50), Some(p90)) = (fitted.next(), fitted.next(), fitted.next()) else {
        return Ok(ScopeOutcome::Failed {
            reason: "incomplete model triple".to_string(),
        });
    };
    let models = ModelTriple { p10, p50, p90 };

    let meta = ModelMeta {
        features: features.to_vec(),
        raster: config.raster.clone(),
        target_col: config.target_col.clone(),
        horizon_steps: scope.horizon_steps,
        mode: scope.mode(),
        station_id: scope.station_id.clone(),
    };
    store.save(scope, &meta, &models)?;
    store.write_checkpoint(scope, &scores)?;
    enter(scope, ScopeState::Persisted);

    info!(
        scope = %scope,
        rows = dataset.len(),
        mae = ?scores.mae,
        nse = ?scores.nse,
        "Scope trained"
    );
    Ok(ScopeOutcome::Trained(scores))
}

/// Trains every scope, at most `concurrency` at a time, and writes
/// `report.json` and `training_status.json`. With `resume`, scopes with a
/// checkpoint are not retrained.
#[tracing::instrument(skip_all, fields(mode = %config.training_mode, resume = resume))]
pub async fn run<L>(
    config: Arc<PipelineConfig>,
    table: Arc<FeatureTable>,
    learner: Arc<L>,
    store: Arc<ArtifactStore>,
    resume: bool,
) -> anyhow::Result<TrainingReport>
where
    L: QuantileLearner + 'static,
{
    let features = Arc::new(feature_names(
        &table.column_names(),
        &config.target_col,
        &config.features,
    ));
    let scopes = plan_scopes(
        config.training_mode,
        &table.station_ids(),
        &config.horizon_steps,
    );
    info!(
        scopes = scopes.len(),
        features = features.len(),
        "Starting training"
    );

    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let mut tasks = Vec::with_capacity(scopes.len());

    for scope in scopes {
        let sem = semaphore.clone();
        let config = config.clone();
        let table = table.clone();
        let learner = learner.clone();
        let store = store.clone();
        let features = features.clone();
        let task_scope = scope.clone();

        let span = info_span!("train_scope", scope = %scope);
        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire_owned().await?;
                let span = Span::current();
                let outcome = tokio::task::spawn_blocking(move || {
                    span.in_scope(|| {
                        if resume {
                            if let Some(scores) = store.read_checkpoint(&task_scope)? {
                                return Ok(ScopeOutcome::Resumed(scores));
                            }
                        }
                        train_scope(
                            learner.as_ref(),
                            &table,
                            &task_scope,
                            &features,
                            &config,
                            &store,
                        )
                    })
                })
                .await??;
                Ok::<_, anyhow::Error>(outcome)
            }
            .instrument(span),
        );
        tasks.push((scope, task));
    }

    let mut report = TrainingReport::default();
    for (scope, task) in tasks {
        let outcome = match task.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ScopeOutcome::Failed {
                reason: format!("{e:#}"),
            },
            Err(e) => ScopeOutcome::Failed {
                reason: format!("task aborted: {e}"),
            },
        };
        match &outcome {
            ScopeOutcome::Skipped { rows } => {
                warn!(
                    scope = %scope,
                    rows,
                    min_samples = config.min_samples,
                    "Insufficient rows, scope skipped"
                );
            }
            ScopeOutcome::Failed { reason } => {
                error!(scope = %scope, reason = %reason, "Scope failed");
            }
            ScopeOutcome::Resumed(_) => info!(scope = %scope, "Scope resumed from checkpoint"),
            ScopeOutcome::Trained(_) => {}
        }
        report.record(&scope, outcome);
    }

    let path = store.report_path();
    report
        .write(&store)
        .with_context(|| format!("writing training report to {}", path.display()))?;
    info!(
        trained = report.scores.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        path = %path.display(),
        "Training finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfig;
    use crate::error::ModelError;
    use crate::features;
    use crate::model::gbm::{GbmParams, GbmQuantileLearner, GbmQuantileModel};
    use crate::model::FeatureMatrix;
    use chrono::{Duration, TimeZone, Utc};

    fn station(sid: &str, n: usize, scale: f64) -> StationFrame {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let mut f = StationFrame::new(sid);
        f.ts = (0..n as i64)
            .map(|i| start + Duration::minutes(15 * i))
            .collect();
        f.set_column(
            "q_cms",
            (0..n)
                .map(|i| Some(scale * (5.0 + (i as f64 / 8.0).sin())))
                .collect(),
        );
        f.set_column(
            "rain_mm",
            (0..n).map(|i| Some((i % 7) as f64 * 0.1)).collect(),
        );
        f
    }

    fn config(dir: &std::path::Path, mode: TrainingMode) -> PipelineConfig {
        let mut config = PipelineConfig {
            training_mode: mode,
            horizon_steps: vec![2],
            min_samples: 60,
            concurrency: 2,
            features: FeatureConfig {
                lags: vec![1, 2],
                rolls: vec![4],
                sum_columns: vec!["rain_mm".into()],
            },
            model: GbmParams {
                n_estimators: 10,
                min_samples_leaf: 5,
                ..GbmParams::default()
            },
            ..PipelineConfig::default()
        };
        config.paths.artifacts = dir.join("artifacts");
        config
    }

    fn table(frames: Vec<StationFrame>, config: &PipelineConfig) -> FeatureTable {
        features::build(
            FeatureTable::from_frames(frames),
            &config.target_col,
            &config.features,
            &config.raster,
        )
        .unwrap()
    }

    /// Fails whenever a label exceeds `limit`.
    struct PickyLearner {
        inner: GbmQuantileLearner,
        limit: f64,
    }

    impl QuantileLearner for PickyLearner {
        type Model = GbmQuantileModel;

        fn fit(
            &self,
            x: &FeatureMatrix,
            y: &[f64],
            quantile: f64,
        ) -> std::result::Result<GbmQuantileModel, ModelError> {
            if y.iter().any(|v| *v > self.limit) {
                return Err(ModelError::TrainingFailed("label out of range".into()));
            }
            self.inner.fit(x, y, quantile)
        }
    }

    #[test]
    fn test_plan_scopes() {
        let stations = vec!["A".to_string(), "B".to_string()];
        assert_eq!(
            plan_scopes(TrainingMode::Global, &stations, &[4, 8]),
            vec![Scope::global(4), Scope::global(8)]
        );
        assert_eq!(plan_scopes(TrainingMode::PerStation, &stations, &[4, 8]).len(), 4);
    }

    fn is_scope_key(key: &str) -> bool {
        key.rsplit_once('_')
            .is_some_and(|(prefix, h)| !prefix.is_empty() && h.parse::<usize>().is_ok())
    }

    #[test]
    fn test_report_file_holds_only_scope_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let mut report = TrainingReport::default();
        report.record(&Scope::global(4), ScopeOutcome::Trained(SkillScores::default()));
        report.record(&Scope::station("B", 4), ScopeOutcome::Skipped { rows: 3 });
        report.record(
            &Scope::station("C", 4),
            ScopeOutcome::Failed {
                reason: "boom".into(),
            },
        );
        report.write(&store).unwrap();

        let json: serde_json::Map<String, serde_json::Value> =
            output::read_json(&store.report_path()).unwrap();
        assert_eq!(json.keys().collect::<Vec<_>>(), vec!["global_4"]);
        assert!(json.keys().all(|k| is_scope_key(k)));
        assert!(json["global_4"].get("MAE").is_some());
        let scores: BTreeMap<String, SkillScores> =
            output::read_json(&store.report_path()).unwrap();
        assert_eq!(scores, report.scores);

        let status: TrainingStatus = output::read_json(&store.status_path()).unwrap();
        assert_eq!(status.skipped[0].scope, "B_4");
        assert_eq!(status.skipped[0].rows, 3);
        assert_eq!(status.failed[0].scope, "C_4");
    }

    #[test]
    fn test_train_scope_persists_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), TrainingMode::Global);
        let table = table(vec![station("A", 150, 1.0)], &config);
        let store = ArtifactStore::new(&config.paths.artifacts);
        let features = feature_names(&table.column_names(), "q_cms", &config.features);
        let learner = GbmQuantileLearner::new(config.model.clone());

        let outcome =
            train_scope(&learner, &table, &Scope::global(2), &features, &config, &store).unwrap();
        assert!(matches!(outcome, ScopeOutcome::Trained(_)));

        let meta = store.load_meta(&Scope::global(2)).unwrap().unwrap();
        assert_eq!(meta.features, features);
        assert_eq!(meta.mode, TrainingMode::Global);
        assert!(store.read_checkpoint(&Scope::global(2)).unwrap().is_some());
    }

    #[test]
    fn test_train_scope_skips_small_scope() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), TrainingMode::PerStation);
        let table = table(vec![station("A", 30, 1.0)], &config);
        let store = ArtifactStore::new(&config.paths.artifacts);
        let features = feature_names(&table.column_names(), "q_cms", &config.features);
        let learner = GbmQuantileLearner::new(config.model.clone());

        let outcome = train_scope(
            &learner,
            &table,
            &Scope::station("A", 2),
            &features,
            &config,
            &store,
        )
        .unwrap();
        assert_eq!(outcome, ScopeOutcome::Skipped { rows: 28 });
        assert!(!store.has_models(&Scope::station("A", 2)));
    }

    #[test]
    fn test_global_scope_trains_below_min_samples() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), TrainingMode::Global);
        let table = table(vec![station("A", 50, 1.0)], &config);
        let store = ArtifactStore::new(&config.paths.artifacts);
        let features = feature_names(&table.column_names(), "q_cms", &config.features);
        let learner = GbmQuantileLearner::new(config.model.clone());

        // 48 labeled rows, under min_samples, still enough for three folds.
        let outcome =
            train_scope(&learner, &table, &Scope::global(2), &features, &config, &store).unwrap();
        assert!(matches!(outcome, ScopeOutcome::Trained(_)));
        assert!(store.has_models(&Scope::global(2)));
    }

    #[test]
    fn test_global_scope_without_folds_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), TrainingMode::Global);
        let table = table(vec![station("A", 5, 1.0)], &config);
        let store = ArtifactStore::new(&config.paths.artifacts);
        let features = feature_names(&table.column_names(), "q_cms", &config.features);
        let learner = GbmQuantileLearner::new(config.model.clone());

        let outcome =
            train_scope(&learner, &table, &Scope::global(2), &features, &config, &store).unwrap();
        assert!(matches!(outcome, ScopeOutcome::Failed { .. }));
        assert!(!store.has_models(&Scope::global(2)));
    }

    #[tokio::test]
    async fn test_run_isolates_failed_scope() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), TrainingMode::PerStation);
        let table = table(
            vec![
                station("A", 150, 1.0),
                station("B", 150, 1000.0),
                station("C", 20, 1.0),
            ],
            &config,
        );
        let learner = PickyLearner {
            inner: GbmQuantileLearner::new(config.model.clone()),
            limit: 100.0,
        };
        let store = Arc::new(ArtifactStore::new(&config.paths.artifacts));

        let report = run(
            Arc::new(config),
            Arc::new(table),
            Arc::new(learner),
            store.clone(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.scores.keys().collect::<Vec<_>>(), vec!["A_2"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].scope, "B_2");
        assert_eq!(report.skipped[0].scope, "C_2");

        let on_disk: serde_json::Map<String, serde_json::Value> =
            output::read_json(&store.report_path()).unwrap();
        assert!(on_disk.keys().all(|k| is_scope_key(k)));
        assert_eq!(on_disk.len(), 1);
        let status: TrainingStatus = output::read_json(&store.status_path()).unwrap();
        assert_eq!(status, report.status());
    }

    #[tokio::test]
    async fn test_resume_reuses_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config(dir.path(), TrainingMode::Global));
        let table = Arc::new(table(vec![station("A", 150, 1.0)], &config));
        let store = Arc::new(ArtifactStore::new(&config.paths.artifacts));

        let first = run(
            config.clone(),
            table.clone(),
            Arc::new(GbmQuantileLearner::new(config.model.clone())),
            store.clone(),
            false,
        )
        .await
        .unwrap();

        // Every fit would fail now, so the scores can only come from the
        // checkpoint.
        let failing = PickyLearner {
            inner: GbmQuantileLearner::new(config.model.clone()),
            limit: -1.0,
        };
        let resumed = run(config, table, Arc::new(failing), store, true)
            .await
            .unwrap();

        assert!(resumed.failed.is_empty());
        assert_eq!(resumed.scores, first.scores);
    }
}
