//! Fixed-frequency time raster and per-station alignment onto it.
//!
//! The grid is anchored at the Unix epoch, so every station sharing a
//! raster also shares timestamps. Lags, rolling windows and labels are
//! all resolved through [`RasterIndex`], which maps a row to its slot on
//! the grid; rows that QC removed are simply absent slots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::frame::{Column, FeatureTable, RawTable, StationFrame};

/// A raster interval such as `15min`, `1h` or `30s`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RasterSpec {
    text: String,
    seconds: i64,
}

impl RasterSpec {
    /// Parses `<n><unit>` where unit is one of `s`, `min`/`T`, `h`/`H`, `D`/`d`.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (count, unit) = trimmed.split_at(split);

        let count: i64 = if count.is_empty() {
            1
        } else {
            count
                .parse()
                .map_err(|_| PipelineError::Config(format!("invalid raster '{text}'")))?
        };

        let unit_seconds = match unit {
            "s" | "S" => 1,
            "min" | "T" => 60,
            "h" | "H" => 3_600,
            "d" | "D" => 86_400,
            _ => {
                return Err(PipelineError::Config(format!(
                    "invalid raster unit in '{text}'"
                )));
            }
        };

        if count <= 0 {
            return Err(PipelineError::Config(format!(
                "raster interval must be positive, got '{text}'"
            )));
        }

        Ok(Self {
            text: trimmed.to_string(),
            seconds: count * unit_seconds,
        })
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// Interval length in whole minutes, as reported in `horizon_minutes`.
    pub fn minutes(&self) -> i64 {
        self.seconds / 60
    }

    /// Grid slot number of `ts` (floor division from the epoch).
    pub fn slot(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.seconds)
    }

    pub fn slot_start(&self, slot: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(slot * self.seconds, 0)
    }

    pub fn floor(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.slot_start(self.slot(ts))
    }

    pub fn is_on_grid(&self, ts: DateTime<Utc>) -> bool {
        ts.timestamp_subsec_nanos() == 0 && ts.timestamp().rem_euclid(self.seconds) == 0
    }
}

impl Default for RasterSpec {
    fn default() -> Self {
        Self {
            text: "15min".to_string(),
            seconds: 900,
        }
    }
}

impl fmt::Display for RasterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl TryFrom<String> for RasterSpec {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RasterSpec> for String {
    fn from(value: RasterSpec) -> Self {
        value.text
    }
}

/// Maps each row of one station's series to its position on a dense grid
/// running from the first to the last row's slot.
#[derive(Debug, Clone)]
pub struct RasterIndex {
    positions: Vec<usize>,
    dense_len: usize,
}

impl RasterIndex {
    /// Fails if a timestamp is off-grid or the series is not strictly
    /// increasing.
    pub fn new(frame: &StationFrame, raster: &RasterSpec) -> Result<Self> {
        let Some(first) = frame.ts.first() else {
            return Ok(Self {
                positions: Vec::new(),
                dense_len: 0,
            });
        };
        let base = raster.slot(*first);

        let mut positions = Vec::with_capacity(frame.len());
        let mut previous: Option<i64> = None;
        for ts in &frame.ts {
            if !raster.is_on_grid(*ts) {
                return Err(PipelineError::Config(format!(
                    "station {}: timestamp {} is not on the {} raster",
                    frame.station_id, ts, raster
                )));
            }
            let slot = raster.slot(*ts);
            if previous.is_some_and(|p| slot <= p) {
                return Err(PipelineError::Config(format!(
                    "station {}: timestamps not strictly increasing at {}",
                    frame.station_id, ts
                )));
            }
            previous = Some(slot);
            positions.push((slot - base) as usize);
        }

        let dense_len = positions.last().map(|p| p + 1).unwrap_or(0);
        Ok(Self {
            positions,
            dense_len,
        })
    }

    pub fn dense_len(&self) -> usize {
        self.dense_len
    }

    /// Grid position of row `row`.
    pub fn position(&self, row: usize) -> usize {
        self.positions[row]
    }

    /// Spreads row values onto the dense grid; absent slots are missing.
    pub fn densify(&self, values: &[Option<f64>]) -> Vec<Option<f64>> {
        let mut dense = vec![None; self.dense_len];
        for (row, value) in values.iter().enumerate() {
            dense[self.positions[row]] = *value;
        }
        dense
    }
}

/// Resamples raw readings onto the raster: one row per station per slot
/// between its first and last reading. Readings are floored to their slot;
/// when several land in the same slot, later observed values win per cell.
pub fn align(raw: RawTable, raster: &RasterSpec) -> FeatureTable {
    let width = raw.columns.len();
    let mut grouped: BTreeMap<String, BTreeMap<i64, Vec<Option<f64>>>> = BTreeMap::new();
    let mut collisions = 0usize;

    for row in raw.rows {
        let slots = grouped.entry(row.station_id).or_default();
        let slot = raster.slot(row.ts);
        match slots.get_mut(&slot) {
            Some(existing) => {
                collisions += 1;
                for (cell, value) in existing.iter_mut().zip(row.values) {
                    if value.is_some() {
                        *cell = value;
                    }
                }
            }
            None => {
                let mut values = row.values;
                values.resize(width, None);
                slots.insert(slot, values);
            }
        }
    }

    if collisions > 0 {
        debug!(collisions, "Merged readings sharing a raster slot");
    }

    let mut table = FeatureTable::default();
    for (station_id, slots) in grouped {
        let (Some(&first), Some(&last)) = (slots.keys().next(), slots.keys().next_back()) else {
            continue;
        };

        let mut frame = StationFrame::new(&station_id);
        let mut columns: Vec<Column> = raw
            .columns
            .iter()
            .map(|name| Column::new(name, Vec::new()))
            .collect();

        for slot in first..=last {
            let Some(ts) = raster.slot_start(slot) else {
                continue;
            };
            frame.ts.push(ts);
            let values = slots.get(&slot);
            for (idx, column) in columns.iter_mut().enumerate() {
                column
                    .values
                    .push(values.and_then(|v| v.get(idx).copied().flatten()));
            }
        }

        for column in columns {
            frame.set_column(&column.name, column.values);
        }
        table.insert(frame);
    }

    table
}
