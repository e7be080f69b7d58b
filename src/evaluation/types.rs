//! Record types of the evaluation tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One retrospective forecast with its realized value. The band is stored
/// as predicted, so `p10 > p90` is a valid record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HindcastRecord {
    pub ts: DateTime<Utc>,
    pub station_id: String,
    pub horizon_steps: usize,
    pub horizon_minutes: i64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub y_true: f64,
}

/// Scores of the trailing window ending at `ts`. Undefined scores are
/// empty cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub ts: DateTime<Utc>,
    pub station_id: String,
    pub horizon_steps: usize,
    pub window: usize,
    pub mae: Option<f64>,
    pub nse: Option<f64>,
    pub kge: Option<f64>,
    pub coverage: Option<f64>,
}
