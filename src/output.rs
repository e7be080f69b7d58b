//! Persistence helpers: JSON documents, typed CSV record tables and the
//! feature table CSV.

use chrono::SecondsFormat;
use csv::WriterBuilder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

use crate::error::Result;
use crate::frame::{FeatureTable, STATION_COL, TS_COL};
use crate::ingest;

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes `value` as pretty JSON, creating parent directories.
pub fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    ensure_parent(path)?;
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value)?;
    debug!(path = %path.display(), "Wrote JSON");
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Writes `records` as a CSV table with a header row, replacing any
/// existing file.
pub fn write_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    debug!(path = %path.display(), rows = records.len(), "Wrote CSV records");
    Ok(())
}

pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path)?;
    let records = reader.deserialize().collect::<std::result::Result<Vec<T>, _>>()?;
    Ok(records)
}

/// Writes the feature table as one CSV: `ts`, `station_id`, then every
/// table column. Missing values are empty cells.
pub fn write_table(path: &Path, table: &FeatureTable) -> Result<()> {
    ensure_parent(path)?;
    let columns = table.column_names();
    let mut writer = WriterBuilder::new().from_path(path)?;

    let mut header = vec![TS_COL.to_string(), STATION_COL.to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for frame in table.frames() {
        let values: Vec<Option<&[Option<f64>]>> =
            columns.iter().map(|name| frame.column(name)).collect();
        for (row, ts) in frame.ts.iter().enumerate() {
            let mut record = Vec::with_capacity(header.len());
            record.push(ts.to_rfc3339_opts(SecondsFormat::Secs, true));
            record.push(frame.station_id.clone());
            for column in &values {
                let cell = column.and_then(|c| c[row]);
                record.push(cell.map(|v| v.to_string()).unwrap_or_default());
            }
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    debug!(path = %path.display(), rows = table.total_rows(), "Wrote feature table");
    Ok(())
}

/// Reads a table written by [`write_table`]. Rows keep their timestamps;
/// nothing is resampled.
pub fn read_table(path: &Path) -> Result<FeatureTable> {
    let mut table = ingest::read_csv(path)?.into_table();
    table.normalize_columns();
    Ok(table)
}
