//! Forecast skill metrics.
//!
//! Every score is `None` when it is undefined for its input (empty input,
//! zero observed variance, zero observed mean) rather than NaN or infinity.

use serde::{Deserialize, Serialize};

/// Arithmetic mean, `None` for empty input.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation given a pre-computed mean.
pub fn stddev(values: &[f64], mean: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;

    Some(variance.sqrt())
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

pub fn mae(obs: &[f64], sim: &[f64]) -> Option<f64> {
    let errors: Vec<f64> = obs.iter().zip(sim).map(|(o, s)| (s - o).abs()).collect();
    mean(&errors).and_then(finite)
}

pub fn rmse(obs: &[f64], sim: &[f64]) -> Option<f64> {
    let squared: Vec<f64> = obs.iter().zip(sim).map(|(o, s)| (s - o).powi(2)).collect();
    mean(&squared).map(f64::sqrt).and_then(finite)
}

/// Nash-Sutcliffe efficiency. `None` when the observations are flat.
pub fn nse(obs: &[f64], sim: &[f64]) -> Option<f64> {
    let obs_mean = mean(obs)?;
    let denom: f64 = obs.iter().map(|o| (o - obs_mean).powi(2)).sum();
    if denom == 0.0 {
        return None;
    }
    let num: f64 = obs.iter().zip(sim).map(|(o, s)| (s - o).powi(2)).sum();
    finite(1.0 - num / denom)
}

/// Pearson correlation. `None` when either side has zero variance.
fn correlation(obs: &[f64], sim: &[f64]) -> Option<f64> {
    if obs.len() < 2 {
        return None;
    }
    let (mo, ms) = (mean(obs)?, mean(sim)?);
    let mut cov = 0.0;
    let (mut vo, mut vs) = (0.0, 0.0);
    for (o, s) in obs.iter().zip(sim) {
        cov += (o - mo) * (s - ms);
        vo += (o - mo).powi(2);
        vs += (s - ms).powi(2);
    }
    if vo == 0.0 || vs == 0.0 {
        return None;
    }
    finite(cov / (vo.sqrt() * vs.sqrt()))
}

/// Kling-Gupta efficiency. Any undefined component makes the score `None`.
pub fn kge(obs: &[f64], sim: &[f64]) -> Option<f64> {
    let r = correlation(obs, sim)?;

    let obs_mean = mean(obs)?;
    let sim_mean = mean(sim)?;
    let obs_std = stddev(obs, obs_mean)?;
    let sim_std = stddev(sim, sim_mean)?;
    if obs_std == 0.0 || obs_mean == 0.0 {
        return None;
    }
    let alpha = sim_std / obs_std;
    let beta = sim_mean / obs_mean;

    finite(1.0 - ((r - 1.0).powi(2) + (alpha - 1.0).powi(2) + (beta - 1.0).powi(2)).sqrt())
}

/// Fraction of observations inside `[low, high]`, bounds inclusive. A
/// crossed band (`low > high`) covers nothing.
pub fn coverage(obs: &[f64], low: &[f64], high: &[f64]) -> Option<f64> {
    if obs.is_empty() {
        return None;
    }
    let inside = obs
        .iter()
        .zip(low.iter().zip(high))
        .filter(|(o, (l, h))| **o >= **l && **o <= **h)
        .count();
    Some(inside as f64 / obs.len() as f64)
}

/// Aggregate walk-forward skill of one scope, as stored in the training report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillScores {
    #[serde(rename = "MAE")]
    pub mae: Option<f64>,
    #[serde(rename = "RMSE")]
    pub rmse: Option<f64>,
    #[serde(rename = "NSE")]
    pub nse: Option<f64>,
    #[serde(rename = "KGE")]
    pub kge: Option<f64>,
}

impl SkillScores {
    pub fn compute(obs: &[f64], sim: &[f64]) -> Self {
        Self {
            mae: mae(obs, sim),
            rmse: rmse(obs, sim),
            nse: nse(obs, sim),
            kge: kge(obs, sim),
        }
    }
}
