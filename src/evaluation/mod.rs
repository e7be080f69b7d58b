//! Retrospective evaluation of trained scopes.
//!
//! [`hindcast`] replays persisted models over the feature table and writes
//! one table per station and horizon; [`skill`] turns those tables into
//! rolling-window accuracy and calibration scores.

pub mod hindcast;
pub mod skill;
pub mod types;

pub use types::{HindcastRecord, MetricRecord};
