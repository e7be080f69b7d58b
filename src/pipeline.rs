//! Feature preparation: raw readings to the feature table on disk.

use tracing::info;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::frame::FeatureTable;
use crate::{features, ingest, output, qc, raster};

/// Ingests the raw directory, aligns it to the raster, merges exogenous
/// sources, applies QC and builds features.
#[tracing::instrument(skip_all, fields(raw_dir = %config.paths.raw_dir.display()))]
pub fn prepare_features(config: &PipelineConfig) -> Result<FeatureTable> {
    let raw = ingest::load_raw(&config.paths.raw_dir, &config.exogenous_paths())?;
    let table = raster::align(raw, &config.raster);
    let table = ingest::merge_exogenous(table, &config.exogenous, &config.raster)?;
    let table = qc::run(table, &config.qc, &config.target_col, &config.raster)?;
    features::build(table, &config.target_col, &config.features, &config.raster)
}

/// [`prepare_features`] followed by writing the table to `paths.features`.
pub fn prepare(config: &PipelineConfig) -> Result<FeatureTable> {
    let table = prepare_features(config)?;
    output::write_table(&config.paths.features, &table)?;
    info!(
        path = %config.paths.features.display(),
        stations = table.station_count(),
        rows = table.total_rows(),
        "Feature table written"
    );
    Ok(table)
}
