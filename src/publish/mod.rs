//! Latest-forecast publishing.
//!
//! The newest feature row of every station is pushed through the trained
//! models of each horizon. The resulting messages are always written to a
//! local JSON file; HTTP delivery and the S3 copy are optional and
//! best-effort, so a failed delivery never touches what is already on disk.

mod client;
mod s3;

pub use client::{BasicClient, BearerToken, HttpClient};
pub use s3::{object_key, write_json_to_s3};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::{Method, Request, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactStore, Scope, ScopeArtifacts};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::frame::{FeatureTable, StationFrame};
use crate::labels::missing_features;
use crate::model::{FeatureMatrix, QuantileModel};
use crate::output;

/// One current forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastMessage {
    /// Issue time: the timestamp of the feature row the forecast came from.
    pub ts: DateTime<Utc>,
    pub station_id: String,
    pub target: String,
    pub horizon_steps: usize,
    pub horizon_minutes: i64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

impl ForecastMessage {
    /// Components of the topic, unescaped.
    pub fn topic_segments(&self) -> [String; 4] {
        [
            self.station_id.clone(),
            "forecast".to_string(),
            format!("{}min", self.horizon_minutes),
            self.target.clone(),
        ]
    }

    /// `{station}/forecast/{minutes}min/{target}`
    pub fn topic(&self) -> String {
        self.topic_segments().join("/")
    }
}

/// Forecast from the newest row of `frame`, or `None` for an empty frame.
pub fn latest_forecast<M: QuantileModel>(
    frame: &StationFrame,
    artifacts: &ScopeArtifacts<M>,
) -> Result<Option<ForecastMessage>> {
    let meta = &artifacts.meta;
    let missing = missing_features(frame, &meta.features);
    if !missing.is_empty() {
        return Err(PipelineError::FeatureMismatch {
            scope: format!("{}_{}", frame.station_id, meta.horizon_steps),
            missing,
        });
    }
    let Some(last) = frame.len().checked_sub(1) else {
        return Ok(None);
    };

    let row: Vec<Option<f64>> = meta
        .features
        .iter()
        .map(|name| frame.column(name).and_then(|c| c[last]))
        .collect();
    let x = FeatureMatrix::from_rows(&[row], meta.features.len())?;
    let predictions = artifacts.models.predict(&x)?;
    if predictions.crossings() > 0 {
        debug!(
            station_id = %frame.station_id,
            horizon_steps = meta.horizon_steps,
            "Crossed band published as is"
        );
    }

    Ok(Some(ForecastMessage {
        ts: frame.ts[last],
        station_id: frame.station_id.clone(),
        target: meta.target_col.clone(),
        horizon_steps: meta.horizon_steps,
        horizon_minutes: meta.horizon_steps as i64 * meta.raster.minutes(),
        p10: predictions.p10[0],
        p50: predictions.p50[0],
        p90: predictions.p90[0],
    }))
}

/// Latest forecast for every station and configured horizon. Scopes without
/// artifacts or with mismatched features are logged and left out.
#[tracing::instrument(skip_all, fields(stations = table.station_count()))]
pub fn latest_forecasts<M: QuantileModel>(
    config: &PipelineConfig,
    table: &FeatureTable,
    store: &ArtifactStore,
) -> Result<Vec<ForecastMessage>> {
    let mut loaded: BTreeMap<Scope, Option<ScopeArtifacts<M>>> = BTreeMap::new();
    let mut messages = Vec::new();

    for &horizon in &config.horizon_steps {
        for frame in table.frames() {
            let scope = Scope::for_station(config.training_mode, &frame.station_id, horizon);
            if !loaded.contains_key(&scope) {
                let artifacts = store.load::<M>(&scope)?;
                if artifacts.is_none() {
                    warn!(scope = %scope, "No trained models, skipping");
                }
                loaded.insert(scope.clone(), artifacts);
            }
            let Some(Some(artifacts)) = loaded.get(&scope) else {
                continue;
            };

            match latest_forecast(frame, artifacts) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e @ PipelineError::FeatureMismatch { .. }) => {
                    error!(scope = %scope, error = %e, "Cannot forecast scope");
                }
                Err(e) => return Err(e),
            }
        }
    }

    info!(messages = messages.len(), "Latest forecasts ready");
    Ok(messages)
}

/// POST request carrying `message` as JSON to `{endpoint}/{topic}`. Each
/// topic segment is percent-encoded, so a station id can never add path
/// segments, a query or a fragment.
pub fn message_request(endpoint: &str, message: &ForecastMessage) -> anyhow::Result<Request> {
    let mut url = Url::parse(endpoint).with_context(|| format!("parsing endpoint {endpoint}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("endpoint {endpoint} cannot take a path"))?
        .pop_if_empty()
        .extend(message.topic_segments());
    let mut req = Request::new(Method::POST, url);
    req.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    *req.body_mut() = Some(serde_json::to_vec(message)?.into());
    Ok(req)
}

/// Sends every message, one request each. Returns how many were accepted.
pub async fn post_messages<C>(client: &C, endpoint: &str, messages: &[ForecastMessage]) -> usize
where
    C: HttpClient + ?Sized,
{
    let mut delivered = 0;
    for message in messages {
        let result = async {
            let req = message_request(endpoint, message)?;
            client.execute(req).await?.error_for_status()?;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        match result {
            Ok(()) => delivered += 1,
            Err(e) => warn!(topic = %message.topic(), error = %e, "Forecast delivery failed"),
        }
    }
    delivered
}

async fn upload_to_s3(
    bucket: &str,
    prefix: &str,
    messages: &[ForecastMessage],
    output_path: &Path,
    training_files: &[PathBuf],
) -> anyhow::Result<()> {
    let config = aws_config::load_from_env().await;
    let client = aws_sdk_s3::Client::new(&config);

    let name = output_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("forecast_latest.json");
    write_json_to_s3(&client, bucket, &object_key(prefix, name), &messages).await?;

    for path in training_files.iter().filter(|p| p.is_file()) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let body: serde_json::Value = output::read_json(path)?;
        write_json_to_s3(&client, bucket, &object_key(prefix, name), &body).await?;
    }
    Ok(())
}

/// Computes the latest forecasts, writes them to `publish.output` and
/// hands them to the configured sinks.
#[tracing::instrument(skip_all)]
pub async fn run<M: QuantileModel>(
    config: &PipelineConfig,
    table: &FeatureTable,
    store: &ArtifactStore,
) -> anyhow::Result<Vec<ForecastMessage>> {
    let messages = latest_forecasts::<M>(config, table, store)?;
    let publish = &config.publish;
    output::write_json(&publish.output, &messages)
        .with_context(|| format!("writing forecasts to {}", publish.output.display()))?;
    info!(path = %publish.output.display(), messages = messages.len(), "Forecasts written");

    if let Some(endpoint) = &publish.endpoint {
        let token = publish
            .token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        let client: Box<dyn HttpClient> = match token {
            Some(token) => match BearerToken::new(BasicClient::new(), &token) {
                Ok(client) => Box::new(client),
                Err(e) => {
                    warn!(error = %e, "Unusable bearer token, posting without it");
                    Box::new(BasicClient::new())
                }
            },
            None => Box::new(BasicClient::new()),
        };
        let delivered = post_messages(client.as_ref(), endpoint, &messages).await;
        info!(endpoint = %endpoint, delivered, total = messages.len(), "Forecasts posted");
    }

    if let Some(bucket) = &publish.s3_bucket {
        match upload_to_s3(
            bucket,
            &publish.s3_prefix,
            &messages,
            &publish.output,
            &[store.report_path(), store.status_path()],
        )
        .await
        {
            Ok(()) => info!(bucket = %bucket, "Forecasts uploaded to S3"),
            Err(e) => error!(bucket = %bucket, error = %format!("{e:#}"), "S3 upload failed"),
        }
    }

    Ok(messages)
}
