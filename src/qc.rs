//! Quality control: plausibility bounds, short-gap interpolation and
//! removal of rows without a target.

use tracing::{debug, info};

use crate::config::QcConfig;
use crate::error::{PipelineError, Result};
use crate::frame::{FeatureTable, StationFrame};
use crate::raster::{RasterIndex, RasterSpec};

/// Fills interior runs of at most `max_gap` missing values by linear
/// interpolation between the observed neighbours. Longer runs and runs
/// touching either end of the series stay missing.
pub fn interpolate_gaps(values: &[Option<f64>], max_gap: usize) -> Vec<Option<f64>> {
    let mut out = values.to_vec();
    let mut last_observed: Option<usize> = None;

    for (i, value) in values.iter().enumerate() {
        let Some(right) = value else {
            continue;
        };
        if let Some(left) = last_observed {
            let gap = i - left - 1;
            if gap > 0 && gap <= max_gap {
                if let Some(left_value) = values[left] {
                    let step = (right - left_value) / (gap + 1) as f64;
                    for (k, cell) in out[left + 1..i].iter_mut().enumerate() {
                        *cell = Some(left_value + step * (k + 1) as f64);
                    }
                }
            }
        }
        last_observed = Some(i);
    }
    out
}

/// Counts of what QC changed for one station.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QcSummary {
    pub out_of_bounds: usize,
    pub filled: usize,
    pub dropped: usize,
}

/// Cleans one station's series. Gap lengths are measured on the raster, so
/// rows missing from the frame count as gaps too.
pub fn clean_station(
    mut frame: StationFrame,
    config: &QcConfig,
    target_col: &str,
    raster: &RasterSpec,
) -> Result<(StationFrame, QcSummary)> {
    let mut summary = QcSummary::default();
    let index = RasterIndex::new(&frame, raster)?;
    let names: Vec<String> = frame.column_names().map(str::to_string).collect();

    for name in &names {
        let Some(values) = frame.column_mut(name) else {
            continue;
        };
        if let Some(bounds) = config.bounds.get(name) {
            for value in values.iter_mut() {
                if value.is_some_and(|v| !bounds.contains(v)) {
                    *value = None;
                    summary.out_of_bounds += 1;
                }
            }
        }

        let dense = interpolate_gaps(&index.densify(values), config.max_gap);
        for (row, value) in values.iter_mut().enumerate() {
            if value.is_none() {
                *value = dense[index.position(row)];
                summary.filled += usize::from(value.is_some());
            }
        }
    }

    let keep: Vec<bool> = frame
        .column(target_col)
        .ok_or_else(|| PipelineError::MissingColumn(target_col.to_string()))?
        .iter()
        .map(Option::is_some)
        .collect();
    summary.dropped = keep.iter().filter(|k| !**k).count();
    frame.retain_rows(&keep);

    Ok((frame, summary))
}

/// Runs QC over every station independently.
#[tracing::instrument(skip_all, fields(stations = table.station_count()))]
pub fn run(
    table: FeatureTable,
    config: &QcConfig,
    target_col: &str,
    raster: &RasterSpec,
) -> Result<FeatureTable> {
    if !table.has_column(target_col) {
        return Err(PipelineError::MissingColumn(target_col.to_string()));
    }

    let mut total = QcSummary::default();
    let mut cleaned = FeatureTable::default();
    for frame in table.into_frames() {
        let station_id = frame.station_id.clone();
        let (frame, summary) = clean_station(frame, config, target_col, raster)?;
        debug!(station_id = %station_id, ?summary, "QC station");
        total.out_of_bounds += summary.out_of_bounds;
        total.filled += summary.filled;
        total.dropped += summary.dropped;
        if !frame.is_empty() {
            cleaned.insert(frame);
        }
    }

    info!(
        out_of_bounds = total.out_of_bounds,
        filled = total.filled,
        dropped = total.dropped,
        rows = cleaned.total_rows(),
        "QC done"
    );
    Ok(cleaned)
}
