//! Replays persisted models over historical features.

use anyhow::Context;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::artifacts::{ArtifactStore, Scope, ScopeArtifacts};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::evaluation::types::HindcastRecord;
use crate::frame::{FeatureTable, StationFrame};
use crate::labels::{build_dataset, missing_features};
use crate::model::QuantileModel;
use crate::output;

pub fn hindcast_file(dir: &Path, station_id: &str, horizon_steps: usize) -> PathBuf {
    dir.join(format!("hindcast_{station_id}_{horizon_steps}.csv"))
}

/// Predicts every labeled row of `frame` with the scope's models, using the
/// feature columns in the order recorded at fit time. Rows without a
/// realized future value are dropped.
pub fn hindcast_station<M: QuantileModel>(
    frame: &StationFrame,
    artifacts: &ScopeArtifacts<M>,
) -> Result<Vec<HindcastRecord>> {
    let meta = &artifacts.meta;
    let missing = missing_features(frame, &meta.features);
    if !missing.is_empty() {
        return Err(PipelineError::FeatureMismatch {
            scope: format!("{}_{}", frame.station_id, meta.horizon_steps),
            missing,
        });
    }

    let dataset = build_dataset(
        &[frame],
        &meta.features,
        &meta.target_col,
        meta.horizon_steps,
        &meta.raster,
    )?;
    if dataset.is_empty() {
        return Ok(Vec::new());
    }

    let predictions = artifacts.models.predict(&dataset.x)?;
    let crossings = predictions.crossings();
    if crossings > 0 {
        debug!(
            station_id = %frame.station_id,
            horizon_steps = meta.horizon_steps,
            crossings,
            "Quantile band crossings passed through"
        );
    }

    let horizon_minutes = meta.horizon_steps as i64 * meta.raster.minutes();
    Ok((0..dataset.len())
        .map(|i| HindcastRecord {
            ts: dataset.ts[i],
            station_id: frame.station_id.clone(),
            horizon_steps: meta.horizon_steps,
            horizon_minutes,
            p10: predictions.p10[i],
            p50: predictions.p50[i],
            p90: predictions.p90[i],
            y_true: dataset.y[i],
        })
        .collect())
}

/// What a hindcast pass produced.
#[derive(Debug, Default)]
pub struct HindcastSummary {
    pub written: Vec<PathBuf>,
    /// Scope keys without trained models.
    pub missing: Vec<String>,
    pub failed: Vec<String>,
}

/// Hindcasts every station for every horizon that has artifacts and writes
/// `hindcast_{station}_{H}.csv` tables.
#[tracing::instrument(skip_all, fields(horizons = ?horizons))]
pub async fn run<M>(
    config: Arc<PipelineConfig>,
    table: Arc<FeatureTable>,
    store: Arc<ArtifactStore>,
    horizons: &[usize],
) -> anyhow::Result<HindcastSummary>
where
    M: QuantileModel + 'static,
{
    let mut summary = HindcastSummary::default();
    let mut loaded: BTreeMap<Scope, Arc<ScopeArtifacts<M>>> = BTreeMap::new();
    let mut jobs = Vec::new();

    for &horizon in horizons {
        for station_id in table.station_ids() {
            let scope = Scope::for_station(config.training_mode, &station_id, horizon);
            if !loaded.contains_key(&scope) {
                match store.load::<M>(&scope) {
                    Ok(Some(artifacts)) => {
                        loaded.insert(scope.clone(), Arc::new(artifacts));
                    }
                    Ok(None) => {
                        warn!(
                            scope = %scope,
                            station_id = %station_id,
                            "No trained models, skipping"
                        );
                        summary.missing.push(format!("{station_id}_{horizon}"));
                        continue;
                    }
                    Err(e) => {
                        error!(scope = %scope, error = %e, "Failed to load models");
                        summary.failed.push(format!("{station_id}_{horizon}"));
                        continue;
                    }
                }
            }
            if let Some(artifacts) = loaded.get(&scope) {
                jobs.push((station_id, horizon, artifacts.clone()));
            }
        }
    }

    std::fs::create_dir_all(&config.paths.hindcast_dir)
        .with_context(|| format!("creating {}", config.paths.hindcast_dir.display()))?;

    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let mut tasks = Vec::with_capacity(jobs.len());
    for (station_id, horizon, artifacts) in jobs {
        let sem = semaphore.clone();
        let table = table.clone();
        let out_path = hindcast_file(&config.paths.hindcast_dir, &station_id, horizon);
        let key = format!("{station_id}_{horizon}");

        let span = info_span!("hindcast", station_id = %station_id, horizon_steps = horizon);
        let path = out_path.clone();
        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire_owned().await?;
                let span = Span::current();
                let rows = tokio::task::spawn_blocking(move || {
                    span.in_scope(|| -> Result<usize> {
                        let Some(frame) = table.get(&station_id) else {
                            return Ok(0);
                        };
                        let records = hindcast_station(frame, &artifacts)?;
                        output::write_records(&out_path, &records)?;
                        Ok(records.len())
                    })
                })
                .await??;
                Ok::<_, anyhow::Error>(rows)
            }
            .instrument(span),
        );
        tasks.push((key, path, task));
    }

    for (key, path, task) in tasks {
        match task.await {
            Ok(Ok(rows)) => {
                info!(scope = %key, rows, path = %path.display(), "Hindcast written");
                summary.written.push(path);
            }
            Ok(Err(e)) => {
                error!(scope = %key, error = %format!("{e:#}"), "Hindcast failed");
                summary.failed.push(key);
            }
            Err(e) => {
                error!(scope = %key, error = %e, "Hindcast task aborted");
                summary.failed.push(key);
            }
        }
    }

    info!(
        written = summary.written.len(),
        missing = summary.missing.len(),
        failed = summary.failed.len(),
        "Hindcast finished"
    );
    Ok(summary)
}
