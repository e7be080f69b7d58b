//! Horizon labels and the labeled design matrix built from them.

use chrono::{DateTime, Utc};

use crate::error::{PipelineError, Result};
use crate::frame::StationFrame;
use crate::model::FeatureMatrix;
use crate::raster::{RasterIndex, RasterSpec};

/// Target value `horizon` raster steps after each row, within the station.
/// Missing when that slot is absent, has no target, or lies past the end.
pub fn horizon_labels(
    frame: &StationFrame,
    target_col: &str,
    horizon: usize,
    raster: &RasterSpec,
) -> Result<Vec<Option<f64>>> {
    let target = frame
        .column(target_col)
        .ok_or_else(|| PipelineError::MissingColumn(target_col.to_string()))?;
    let index = RasterIndex::new(frame, raster)?;
    let dense = index.densify(target);

    Ok((0..frame.len())
        .map(|row| dense.get(index.position(row) + horizon).copied().flatten())
        .collect())
}

/// Columns of `features` that `frame` lacks.
pub fn missing_features(frame: &StationFrame, features: &[String]) -> Vec<String> {
    features
        .iter()
        .filter(|name| !frame.has_column(name))
        .cloned()
        .collect()
}

/// Labeled rows of one or more stations, in matrix row order.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub x: FeatureMatrix,
    pub y: Vec<f64>,
    pub ts: Vec<DateTime<Utc>>,
    pub station_ids: Vec<String>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// Collects the rows of `frames` that have a label for `horizon`, with the
/// feature columns in exactly the order of `features`. Rows are ordered by
/// `(ts, station_id)` so that a walk-forward split over several stations
/// never trains on a later timestamp than it tests on.
pub fn build_dataset(
    frames: &[&StationFrame],
    features: &[String],
    target_col: &str,
    horizon: usize,
    raster: &RasterSpec,
) -> Result<Dataset> {
    let mut rows: Vec<(DateTime<Utc>, &str, Vec<Option<f64>>, f64)> = Vec::new();

    for frame in frames {
        let columns = features
            .iter()
            .map(|name| {
                frame.column(name).ok_or_else(|| PipelineError::FeatureMismatch {
                    scope: frame.station_id.clone(),
                    missing: vec![name.clone()],
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let labels = horizon_labels(frame, target_col, horizon, raster)?;
        for (row, label) in labels.into_iter().enumerate() {
            let Some(label) = label else {
                continue;
            };
            let values = columns.iter().map(|c| c[row]).collect();
            rows.push((frame.ts[row], frame.station_id.as_str(), values, label));
        }
    }

    rows.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let mut matrix = Vec::with_capacity(rows.len());
    let mut dataset_ts = Vec::with_capacity(rows.len());
    let mut station_ids = Vec::with_capacity(rows.len());
    let mut y = Vec::with_capacity(rows.len());
    for (ts, station_id, values, label) in rows {
        dataset_ts.push(ts);
        station_ids.push(station_id.to_string());
        matrix.push(values);
        y.push(label);
    }

    Ok(Dataset {
        x: FeatureMatrix::from_rows(&matrix, features.len())?,
        y,
        ts: dataset_ts,
        station_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ramp(station: &str, n: usize, offset_steps: i64) -> StationFrame {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut f = StationFrame::new(station);
        f.ts = (0..n as i64)
            .map(|i| start + Duration::minutes(15 * (i + offset_steps)))
            .collect();
        f.set_column("q_cms", (0..n).map(|v| Some(v as f64)).collect());
        f.set_column("x", (0..n).map(|v| Some(10.0 * v as f64)).collect());
        f
    }

    #[test]
    fn test_ramp_labels_shift_by_horizon() {
        let raster = RasterSpec::parse("15min").unwrap();
        let f = ramp("A", 200, 0);
        let labels = horizon_labels(&f, "q_cms", 4, &raster).unwrap();

        assert_eq!(labels.len(), 200);
        for (i, label) in labels.iter().enumerate() {
            if i <= 195 {
                assert_eq!(*label, Some((i + 4) as f64), "row {i}");
            } else {
                assert_eq!(*label, None, "row {i}");
            }
        }
    }

    #[test]
    fn test_labels_skip_absent_slots() {
        let raster = RasterSpec::parse("15min").unwrap();
        let mut f = ramp("A", 6, 0);
        f.retain_rows(&[true, true, false, true, true, true]);
        let labels = horizon_labels(&f, "q_cms", 2, &raster).unwrap();
        // Row 0's label slot was removed; row 1 now reaches slot 3.
        assert_eq!(labels, vec![None, Some(3.0), Some(5.0), None, None]);
    }

    #[test]
    fn test_dataset_excludes_unlabeled_rows() {
        let raster = RasterSpec::parse("15min").unwrap();
        let f = ramp("A", 10, 0);
        let ds = build_dataset(&[&f], &["x".to_string()], "q_cms", 3, &raster).unwrap();
        assert_eq!(ds.len(), 7);
        assert_eq!(ds.y[0], 3.0);
        assert_eq!(ds.x.get(6, 0), 60.0);
    }

    #[test]
    fn test_dataset_orders_stations_by_time() {
        let raster = RasterSpec::parse("15min").unwrap();
        let a = ramp("A", 4, 1);
        let b = ramp("B", 4, 0);
        let ds = build_dataset(&[&a, &b], &["x".to_string()], "q_cms", 1, &raster).unwrap();
        assert_eq!(ds.station_ids, vec!["B", "A", "B", "A", "B", "A"]);
        assert!(ds.ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_dataset_reports_missing_feature() {
        let raster = RasterSpec::parse("15min").unwrap();
        let f = ramp("A", 4, 0);
        let err = build_dataset(&[&f], &["sm_pct".to_string()], "q_cms", 1, &raster).unwrap_err();
        assert!(matches!(err, PipelineError::FeatureMismatch { .. }));
    }
}
