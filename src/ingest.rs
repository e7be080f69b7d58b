//! Raw CSV ingestion and exogenous covariate merge.

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, Trim};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ExogenousSource;
use crate::error::{PipelineError, Result};
use crate::frame::{FeatureTable, RawRow, RawTable, STATION_COL, TS_COL};
use crate::raster::{self, RasterSpec};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parses RFC 3339 or one of the naive layouts (read as UTC).
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| PipelineError::InvalidTimestamp(text.to_string()))
}

/// Empty, `null`, unparseable and non-finite cells are missing.
fn parse_value(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("null") {
        return None;
    }
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Reads one CSV with `ts` and `station_id` columns; every other column is
/// numeric.
pub fn read_csv(path: &Path) -> Result<RawTable> {
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_path(path)?;
    let headers = reader.headers()?.clone();

    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| PipelineError::MissingColumn(format!("{name} in {}", path.display())))
    };
    let ts_idx = find(TS_COL)?;
    let station_idx = find(STATION_COL)?;

    let value_idx: Vec<usize> = (0..headers.len())
        .filter(|i| *i != ts_idx && *i != station_idx)
        .collect();
    let columns = value_idx.iter().map(|&i| headers[i].to_string()).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let ts = parse_timestamp(record.get(ts_idx).unwrap_or_default())?;
        let station_id = record.get(station_idx).unwrap_or_default().to_string();
        if station_id.is_empty() {
            continue;
        }
        let values = value_idx
            .iter()
            .map(|&i| record.get(i).and_then(parse_value))
            .collect();
        rows.push(RawRow {
            station_id,
            ts,
            values,
        });
    }

    debug!(path = %path.display(), rows = rows.len(), "Read CSV");
    Ok(RawTable { columns, rows })
}

/// Lists `*.csv` files in `dir`, sorted, skipping any whose file name matches
/// one of `exclude`.
pub fn list_csv_files(dir: &Path, exclude: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let excluded: Vec<_> = exclude.iter().filter_map(|p| p.file_name()).collect();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_csv = path.extension().is_some_and(|ext| ext == "csv");
        let is_excluded = path.file_name().is_some_and(|name| excluded.contains(&name));
        if path.is_file() && is_csv && !is_excluded {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Loads every base-series CSV in `dir`. No files at all is fatal.
#[tracing::instrument(skip(exclude))]
pub fn load_raw(dir: &Path, exclude: &[PathBuf]) -> Result<RawTable> {
    let files = list_csv_files(dir, exclude)?;
    if files.is_empty() {
        return Err(PipelineError::NoInput(dir.display().to_string()));
    }

    let tables = files
        .iter()
        .map(|path| read_csv(path))
        .collect::<Result<Vec<_>>>()?;
    let raw = RawTable::concat(tables);

    info!(files = files.len(), rows = raw.rows.len(), "Loaded raw series");
    Ok(raw)
}

/// Left-joins every enabled exogenous source onto `table` by
/// `(ts, station_id)` after aligning it to the same raster. A source file
/// that does not exist is skipped with a warning; columns already present
/// in `table` are never overwritten.
pub fn merge_exogenous(
    mut table: FeatureTable,
    sources: &[ExogenousSource],
    raster: &RasterSpec,
) -> Result<FeatureTable> {
    for source in sources.iter().filter(|s| s.enabled) {
        if !source.path.exists() {
            warn!(
                source = %source.name,
                path = %source.path.display(),
                "Exogenous file not found, continuing without it"
            );
            continue;
        }

        let exo = raster::align(read_csv(&source.path)?, raster);
        let new_columns: Vec<String> = exo
            .column_names()
            .into_iter()
            .filter(|name| !table.has_column(name))
            .collect();
        if new_columns.is_empty() {
            warn!(source = %source.name, "Exogenous source adds no new columns");
            continue;
        }

        table = table.map_stations(|mut frame| {
            let other = exo.get(&frame.station_id);
            for name in &new_columns {
                let values = frame
                    .ts
                    .iter()
                    .map(|ts| {
                        other.and_then(|o| {
                            let row = o.row_of(*ts)?;
                            o.column(name)?[row]
                        })
                    })
                    .collect();
                frame.set_column(name, values);
            }
            Ok(frame)
        })?;

        info!(source = %source.name, columns = ?new_columns, "Merged exogenous source");
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 6, 15, 0).unwrap();
        for text in [
            "2024-03-01T06:15:00Z",
            "2024-03-01T07:15:00+01:00",
            "2024-03-01 06:15:00",
            "2024-03-01T06:15:00",
            "2024-03-01 06:15",
            "2024-03-01 06:15:00+00:00",
        ] {
            assert_eq!(parse_timestamp(text).unwrap(), expected, "{text}");
        }
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(PipelineError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value(" 1.5 "), Some(1.5));
        assert_eq!(parse_value(""), None);
        assert_eq!(parse_value("null"), None);
        assert_eq!(parse_value("NaN"), None);
        assert_eq!(parse_value("n/a"), None);
    }

    #[test]
    fn test_read_csv_keeps_dynamic_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "gauge.csv",
            "station_id,ts,q_cms,rain_mm\nA,2024-01-01 00:00,1.5,\nA,2024-01-01 00:15,,0.2\n",
        );
        let raw = read_csv(&path).unwrap();
        assert_eq!(raw.columns, vec!["q_cms", "rain_mm"]);
        assert_eq!(raw.rows.len(), 2);
        assert_eq!(raw.rows[0].values, vec![Some(1.5), None]);
        assert_eq!(raw.rows[1].values, vec![None, Some(0.2)]);
    }

    #[test]
    fn test_read_csv_requires_key_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bad.csv", "ts,q_cms\n2024-01-01 00:00,1\n");
        assert!(matches!(
            read_csv(&path),
            Err(PipelineError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_load_raw_excludes_exogenous_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "gauge.csv", "ts,station_id,q_cms\n2024-01-01 00:00,A,1\n");
        let icon = write(
            dir.path(),
            "icon_forecast.csv",
            "ts,station_id,icon_rr_mm\n2024-01-01 00:00,A,3\n",
        );
        write(dir.path(), "notes.txt", "ignored");

        let raw = load_raw(dir.path(), &[icon]).unwrap();
        assert_eq!(raw.columns, vec!["q_cms"]);
        assert_eq!(raw.rows.len(), 1);
    }

    #[test]
    fn test_load_raw_without_files_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_raw(dir.path(), &[]),
            Err(PipelineError::NoInput(_))
        ));
    }

    #[test]
    fn test_merge_exogenous_skips_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let raster = RasterSpec::parse("15min").unwrap();
        let base = write(
            dir.path(),
            "gauge.csv",
            "ts,station_id,q_cms\n2024-01-01 00:00,A,1\n2024-01-01 00:15,A,2\n2024-01-01 00:00,B,5\n",
        );
        let soil = write(
            dir.path(),
            "soil.csv",
            "ts,station_id,sm_pct\n2024-01-01 00:15,A,40\n",
        );
        let table = raster::align(read_csv(&base).unwrap(), &raster);

        let sources = vec![
            ExogenousSource {
                name: "icon".into(),
                path: dir.path().join("icon_forecast.csv"),
                enabled: true,
            },
            ExogenousSource {
                name: "soil".into(),
                path: soil,
                enabled: true,
            },
        ];
        let merged = merge_exogenous(table, &sources, &raster).unwrap();

        assert_eq!(merged.column_names(), vec!["q_cms", "sm_pct"]);
        assert!(!merged.has_column("icon_rr_mm"));
        assert_eq!(merged.get("A").unwrap().column("sm_pct").unwrap(), &[None, Some(40.0)]);
        assert_eq!(merged.get("B").unwrap().column("sm_pct").unwrap(), &[None]);
    }

    #[test]
    fn test_merge_exogenous_ignores_disabled_source() {
        let dir = tempfile::tempdir().unwrap();
        let raster = RasterSpec::parse("15min").unwrap();
        let base = write(dir.path(), "gauge.csv", "ts,station_id,q_cms\n2024-01-01 00:00,A,1\n");
        let soil = write(dir.path(), "soil.csv", "ts,station_id,sm_pct\n2024-01-01 00:00,A,40\n");
        let table = raster::align(read_csv(&base).unwrap(), &raster);
        let sources = vec![ExogenousSource {
            name: "soil".into(),
            path: soil,
            enabled: false,
        }];
        let merged = merge_exogenous(table, &sources, &raster).unwrap();
        assert!(!merged.has_column("sm_pct"));
    }
}
