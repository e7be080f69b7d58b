//! Rolling skill over hindcast tables.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::evaluation::types::{HindcastRecord, MetricRecord};
use crate::metrics;
use crate::output;

pub fn metrics_file(dir: &Path, station_id: &str, horizon_steps: usize, window: usize) -> PathBuf {
    dir.join(format!("metrics_{station_id}_{horizon_steps}_w{window}.csv"))
}

/// Scores of one window of hindcast rows. Every score is `None` when the
/// window cannot define it, including an empty window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowScores {
    pub mae: Option<f64>,
    pub nse: Option<f64>,
    pub kge: Option<f64>,
    pub coverage: Option<f64>,
}

pub fn window_scores(records: &[HindcastRecord]) -> WindowScores {
    let obs: Vec<f64> = records.iter().map(|r| r.y_true).collect();
    let median: Vec<f64> = records.iter().map(|r| r.p50).collect();
    let lower: Vec<f64> = records.iter().map(|r| r.p10).collect();
    let upper: Vec<f64> = records.iter().map(|r| r.p90).collect();

    WindowScores {
        mae: metrics::mae(&obs, &median),
        nse: metrics::nse(&obs, &median),
        kge: metrics::kge(&obs, &median),
        coverage: metrics::coverage(&obs, &lower, &upper),
    }
}

/// One metric row per full trailing window of `window` records, stamped with
/// the last timestamp in the window. Records are ordered by time first.
pub fn rolling_metrics(records: &[HindcastRecord], window: usize) -> Vec<MetricRecord> {
    if window == 0 || records.len() < window {
        return Vec::new();
    }
    let mut sorted = records.to_vec();
    sorted.sort_by_key(|r| r.ts);

    sorted
        .windows(window)
        .map(|slice| {
            let last = &slice[window - 1];
            let scores = window_scores(slice);
            MetricRecord {
                ts: last.ts,
                station_id: last.station_id.clone(),
                horizon_steps: last.horizon_steps,
                window,
                mae: scores.mae,
                nse: scores.nse,
                kge: scores.kge,
                coverage: scores.coverage,
            }
        })
        .collect()
}

/// `hindcast_*.csv` files in `dir`, sorted by name.
pub fn hindcast_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_hindcast = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("hindcast_") && n.ends_with(".csv"));
        if is_hindcast && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Computes rolling metrics for every hindcast table and window, writing one
/// `metrics_{station}_{H}_w{W}.csv` per pair. A directory without hindcast
/// tables is an error.
#[tracing::instrument(skip_all, fields(hindcast_dir = %hindcast_dir.display(), windows = ?windows))]
pub fn run(hindcast_dir: &Path, metrics_dir: &Path, windows: &[usize]) -> Result<Vec<PathBuf>> {
    let files = hindcast_files(hindcast_dir)?;
    if files.is_empty() {
        return Err(PipelineError::NoInput(hindcast_dir.display().to_string()));
    }
    let mut written = Vec::new();

    for path in files {
        let records: Vec<HindcastRecord> = output::read_records(&path)?;
        let Some(first) = records.first() else {
            warn!(path = %path.display(), "Empty hindcast table, skipping");
            continue;
        };
        let (station_id, horizon) = (first.station_id.clone(), first.horizon_steps);

        for &window in windows {
            let rows = rolling_metrics(&records, window);
            let out = metrics_file(metrics_dir, &station_id, horizon, window);
            output::write_records(&out, &rows)?;
            info!(
                station_id = %station_id,
                horizon_steps = horizon,
                window,
                rows = rows.len(),
                "Rolling metrics written"
            );
            written.push(out);
        }
    }

    Ok(written)
}
