//! Lag, rolling-window and calendar features, derived per station.
//!
//! All lookups go through the station's [`RasterIndex`]: `{col}_lag{L}` is
//! the value at `ts - L * raster` and `{col}_roll{R}` aggregates the slots
//! `ts - (R - 1) * raster ..= ts`. Nothing ever reads a later slot.

use chrono::{Datelike, Timelike};
use tracing::info;

use crate::config::FeatureConfig;
use crate::error::Result;
use crate::frame::{FeatureTable, STATION_COL, StationFrame, TARGET_COLUMNS, TS_COL};
use crate::raster::{RasterIndex, RasterSpec};

pub const DAY_OF_YEAR: &str = "doy";
pub const HOUR_OF_DAY: &str = "hod";

pub fn lag_name(column: &str, lag: usize) -> String {
    format!("{column}_lag{lag}")
}

pub fn roll_name(column: &str, window: usize) -> String {
    format!("{column}_roll{window}")
}

fn has_numeric_suffix(name: &str, marker: &str) -> bool {
    name.rsplit_once(marker).is_some_and(|(head, digits)| {
        !head.is_empty() && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
    })
}

/// Whether `name` is a column this module derives.
pub fn is_derived(name: &str) -> bool {
    name == DAY_OF_YEAR
        || name == HOUR_OF_DAY
        || has_numeric_suffix(name, "_lag")
        || has_numeric_suffix(name, "_roll")
}

/// Raw covariate columns of a table: everything that is not a key, a
/// target-like column or a derived feature. Keeps table order.
pub fn exogenous_columns(columns: &[String], target_col: &str) -> Vec<String> {
    columns
        .iter()
        .filter(|name| {
            let name = name.as_str();
            name != TS_COL
                && name != STATION_COL
                && name != target_col
                && !TARGET_COLUMNS.contains(&name)
                && !is_derived(name)
        })
        .cloned()
        .collect()
}

/// Ordered model input columns: raw covariates, then lags, then rolling
/// windows, then calendar fields.
pub fn feature_names(columns: &[String], target_col: &str, config: &FeatureConfig) -> Vec<String> {
    let exogenous = exogenous_columns(columns, target_col);
    let sources: Vec<&str> = std::iter::once(target_col)
        .chain(exogenous.iter().map(String::as_str))
        .collect();

    let mut names = exogenous.clone();
    for &lag in &config.lags {
        names.extend(sources.iter().map(|col| lag_name(col, lag)));
    }
    for &window in &config.rolls {
        names.extend(sources.iter().map(|col| roll_name(col, window)));
    }
    names.push(DAY_OF_YEAR.to_string());
    names.push(HOUR_OF_DAY.to_string());
    names
}

fn lagged(dense: &[Option<f64>], index: &RasterIndex, rows: usize, lag: usize) -> Vec<Option<f64>> {
    (0..rows)
        .map(|row| {
            let pos = index.position(row);
            pos.checked_sub(lag).and_then(|p| dense[p])
        })
        .collect()
}

/// Trailing aggregate over up to `window` slots ending at each row; missing
/// when the window holds no observed value.
fn rolled(
    dense: &[Option<f64>],
    index: &RasterIndex,
    rows: usize,
    window: usize,
    sum: bool,
) -> Vec<Option<f64>> {
    (0..rows)
        .map(|row| {
            let end = index.position(row);
            let start = (end + 1).saturating_sub(window);
            let observed: Vec<f64> = dense[start..=end].iter().flatten().copied().collect();
            if observed.is_empty() {
                return None;
            }
            let total: f64 = observed.iter().sum();
            Some(if sum {
                total
            } else {
                total / observed.len() as f64
            })
        })
        .collect()
}

/// Adds every derived column to one station's series.
pub fn build_station(
    mut frame: StationFrame,
    target_col: &str,
    config: &FeatureConfig,
    raster: &RasterSpec,
) -> Result<StationFrame> {
    let index = RasterIndex::new(&frame, raster)?;
    let rows = frame.len();
    let columns: Vec<String> = frame.column_names().map(str::to_string).collect();

    let mut sources = vec![target_col.to_string()];
    sources.extend(exogenous_columns(&columns, target_col));
    let dense: Vec<(String, Vec<Option<f64>>)> = sources
        .into_iter()
        .filter_map(|name| {
            let values = index.densify(frame.column(&name)?);
            Some((name, values))
        })
        .collect();

    for &lag in &config.lags {
        for (name, values) in &dense {
            frame.set_column(&lag_name(name, lag), lagged(values, &index, rows, lag));
        }
    }
    for &window in &config.rolls {
        for (name, values) in &dense {
            let sum = config.sum_columns.contains(name);
            frame.set_column(
                &roll_name(name, window),
                rolled(values, &index, rows, window, sum),
            );
        }
    }

    let doy = frame.ts.iter().map(|ts| Some(f64::from(ts.ordinal()))).collect();
    let hod = frame.ts.iter().map(|ts| Some(f64::from(ts.hour()))).collect();
    frame.set_column(DAY_OF_YEAR, doy);
    frame.set_column(HOUR_OF_DAY, hod);

    Ok(frame)
}

/// Builds features for every station. Stations are first given the full
/// table column set so every station carries the same derived columns.
#[tracing::instrument(skip_all, fields(stations = table.station_count()))]
pub fn build(
    mut table: FeatureTable,
    target_col: &str,
    config: &FeatureConfig,
    raster: &RasterSpec,
) -> Result<FeatureTable> {
    table.normalize_columns();
    let table = table.map_stations(|frame| build_station(frame, target_col, config, raster))?;

    let features = feature_names(&table.column_names(), target_col, config);
    info!(
        features = features.len(),
        rows = table.total_rows(),
        "Built features"
    );
    Ok(table)
}
