pub mod artifacts;
pub mod config;
pub mod cv;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod frame;
pub mod ingest;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod publish;
pub mod qc;
pub mod raster;
pub mod training;
