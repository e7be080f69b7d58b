//! Tabular time-series data model.
//!
//! A [`FeatureTable`] is partitioned by station: every per-station transform
//! (alignment, QC, features, labels) is a map over independent
//! [`StationFrame`]s, so no transform can read across a station boundary.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::Result;

/// Column name of the timestamp key.
pub const TS_COL: &str = "ts";
/// Column name of the station key.
pub const STATION_COL: &str = "station_id";

/// Columns that can serve as the forecast target. None of them is ever used
/// as a model input, whichever one is configured as the target.
pub const TARGET_COLUMNS: &[&str] = &["q_cms", "h_cm"];

/// A named column of optional values.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

impl Column {
    pub fn new(name: &str, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.to_string(),
            values,
        }
    }
}

/// One station's chronologically sorted series.
#[derive(Debug, Clone, PartialEq)]
pub struct StationFrame {
    pub station_id: String,
    pub ts: Vec<DateTime<Utc>>,
    columns: Vec<Column>,
}

impl StationFrame {
    pub fn new(station_id: &str) -> Self {
        Self {
            station_id: station_id.to_string(),
            ts: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Vec<Option<f64>>> {
        self.columns
            .iter_mut()
            .find(|c| c.name == name)
            .map(|c| &mut c.values)
    }

    /// Inserts a column, replacing any existing column of the same name in
    /// place so the column order is preserved.
    pub fn set_column(&mut self, name: &str, values: Vec<Option<f64>>) {
        debug_assert_eq!(values.len(), self.ts.len(), "column '{name}' length");
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(column) => column.values = values,
            None => self.columns.push(Column::new(name, values)),
        }
    }

    /// Keeps only the rows whose flag is `true`.
    pub fn retain_rows(&mut self, keep: &[bool]) {
        let mut flags = keep.iter();
        self.ts.retain(|_| *flags.next().unwrap_or(&false));
        for column in &mut self.columns {
            let mut flags = keep.iter();
            column.values.retain(|_| *flags.next().unwrap_or(&false));
        }
    }

    /// Row index of `ts`, if present.
    pub fn row_of(&self, ts: DateTime<Utc>) -> Option<usize> {
        self.ts.binary_search(&ts).ok()
    }
}

/// A station-partitioned table with a table-wide column set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    stations: BTreeMap<String, StationFrame>,
}

impl FeatureTable {
    pub fn from_frames(frames: impl IntoIterator<Item = StationFrame>) -> Self {
        let mut table = Self::default();
        for frame in frames {
            table.insert(frame);
        }
        table
    }

    pub fn insert(&mut self, frame: StationFrame) {
        self.stations.insert(frame.station_id.clone(), frame);
    }

    pub fn get(&self, station_id: &str) -> Option<&StationFrame> {
        self.stations.get(station_id)
    }

    pub fn frames(&self) -> impl Iterator<Item = &StationFrame> {
        self.stations.values()
    }

    pub fn into_frames(self) -> impl Iterator<Item = StationFrame> {
        self.stations.into_values()
    }

    pub fn station_ids(&self) -> Vec<String> {
        self.stations.keys().cloned().collect()
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn total_rows(&self) -> usize {
        self.stations.values().map(StationFrame::len).sum()
    }

    /// Union of column names across stations, in first-seen order.
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for frame in self.stations.values() {
            for name in frame.column_names() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.stations.values().any(|f| f.has_column(name))
    }

    /// Applies `f` to every station independently.
    pub fn map_stations<F>(self, f: F) -> Result<Self>
    where
        F: Fn(StationFrame) -> Result<StationFrame>,
    {
        let mut out = Self::default();
        for (_, frame) in self.stations {
            out.insert(f(frame)?);
        }
        Ok(out)
    }

    /// Gives every station every table column, filling absent ones with
    /// missing values, in table order.
    pub fn normalize_columns(&mut self) {
        let names = self.column_names();
        for frame in self.stations.values_mut() {
            let mut columns = Vec::with_capacity(names.len());
            for name in &names {
                let values = frame
                    .column(name)
                    .map(<[Option<f64>]>::to_vec)
                    .unwrap_or_else(|| vec![None; frame.len()]);
                columns.push(Column::new(name, values));
            }
            frame.columns = columns;
        }
    }
}

/// One unaligned input reading.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub station_id: String,
    pub ts: DateTime<Utc>,
    pub values: Vec<Option<f64>>,
}

/// Unaligned readings as loaded from CSV, sharing one column list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    /// Concatenates tables, taking the union of their columns.
    pub fn concat(tables: Vec<RawTable>) -> RawTable {
        let mut out = RawTable::default();
        for table in &tables {
            for name in &table.columns {
                if !out.columns.contains(name) {
                    out.columns.push(name.clone());
                }
            }
        }

        for table in tables {
            let mapping: Vec<usize> = table
                .columns
                .iter()
                .filter_map(|name| out.columns.iter().position(|c| c == name))
                .collect();
            for row in table.rows {
                let mut values = vec![None; out.columns.len()];
                for (src, dst) in mapping.iter().enumerate() {
                    values[*dst] = row.values.get(src).copied().flatten();
                }
                out.rows.push(RawRow {
                    station_id: row.station_id,
                    ts: row.ts,
                    values,
                });
            }
        }
        out
    }

    /// Groups rows by station without resampling. Rows are sorted by time;
    /// a repeated timestamp keeps the later row.
    pub fn into_table(self) -> FeatureTable {
        let mut grouped: BTreeMap<String, BTreeMap<DateTime<Utc>, Vec<Option<f64>>>> =
            BTreeMap::new();
        for row in self.rows {
            grouped
                .entry(row.station_id)
                .or_default()
                .insert(row.ts, row.values);
        }

        let mut table = FeatureTable::default();
        for (station_id, rows) in grouped {
            let mut frame = StationFrame::new(&station_id);
            let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::new(); self.columns.len()];
            for (ts, values) in rows {
                frame.ts.push(ts);
                for (idx, column) in columns.iter_mut().enumerate() {
                    column.push(values.get(idx).copied().flatten());
                }
            }
            for (name, values) in self.columns.iter().zip(columns) {
                frame.set_column(name, values);
            }
            table.insert(frame);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, m, 0).unwrap()
    }

    fn frame(sid: &str, cols: &[(&str, Vec<Option<f64>>)]) -> StationFrame {
        let mut f = StationFrame::new(sid);
        f.ts = (0..cols[0].1.len() as u32).map(|i| at(i * 15)).collect();
        for (name, values) in cols {
            f.set_column(name, values.clone());
        }
        f
    }

    #[test]
    fn test_set_column_replaces_in_place() {
        let mut f = frame("A", &[("a", vec![Some(1.0)]), ("b", vec![Some(2.0)])]);
        f.set_column("a", vec![Some(5.0)]);
        assert_eq!(f.column_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(f.column("a").unwrap(), &[Some(5.0)]);
    }

    #[test]
    fn test_retain_rows_keeps_columns_aligned() {
        let mut f = frame("A", &[("a", vec![Some(1.0), None, Some(3.0)])]);
        f.retain_rows(&[true, false, true]);
        assert_eq!(f.ts, vec![at(0), at(30)]);
        assert_eq!(f.column("a").unwrap(), &[Some(1.0), Some(3.0)]);
    }

    #[test]
    fn test_normalize_columns_fills_missing_station_columns() {
        let mut table = FeatureTable::from_frames(vec![
            frame("A", &[("q_cms", vec![Some(1.0)]), ("rain_mm", vec![Some(0.5)])]),
            frame("B", &[("q_cms", vec![Some(2.0)])]),
        ]);
        table.normalize_columns();
        let b = table.get("B").unwrap();
        assert_eq!(b.column("rain_mm").unwrap(), &[None]);
        assert_eq!(table.column_names(), vec!["q_cms", "rain_mm"]);
    }

    #[test]
    fn test_concat_unions_columns() {
        let a = RawTable {
            columns: vec!["q_cms".into()],
            rows: vec![RawRow {
                station_id: "A".into(),
                ts: at(0),
                values: vec![Some(1.0)],
            }],
        };
        let b = RawTable {
            columns: vec!["h_cm".into(), "q_cms".into()],
            rows: vec![RawRow {
                station_id: "B".into(),
                ts: at(0),
                values: vec![Some(7.0), Some(2.0)],
            }],
        };
        let merged = RawTable::concat(vec![a, b]);
        assert_eq!(merged.columns, vec!["q_cms", "h_cm"]);
        assert_eq!(merged.rows[0].values, vec![Some(1.0), None]);
        assert_eq!(merged.rows[1].values, vec![Some(2.0), Some(7.0)]);
    }

    #[test]
    fn test_into_table_sorts_by_time() {
        let raw = RawTable {
            columns: vec!["q_cms".into()],
            rows: vec![
                RawRow {
                    station_id: "A".into(),
                    ts: at(15),
                    values: vec![Some(2.0)],
                },
                RawRow {
                    station_id: "A".into(),
                    ts: at(0),
                    values: vec![Some(1.0)],
                },
            ],
        };
        let table = raw.into_table();
        let a = table.get("A").unwrap();
        assert_eq!(a.ts, vec![at(0), at(15)]);
        assert_eq!(a.column("q_cms").unwrap(), &[Some(1.0), Some(2.0)]);
    }
}
