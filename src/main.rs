//! CLI entry point for the hydrological forecasting pipeline.
//!
//! Provides subcommands for preparing the feature table, training quantile
//! models, hindcasting, rolling skill evaluation and publishing the latest
//! forecasts, plus `run` for all of them in order.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hydro_forecast::artifacts::ArtifactStore;
use hydro_forecast::config::PipelineConfig;
use hydro_forecast::evaluation::{hindcast, skill};
use hydro_forecast::frame::FeatureTable;
use hydro_forecast::model::gbm::{GbmQuantileLearner, GbmQuantileModel};
use hydro_forecast::{output, pipeline, publish, training};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "hydro_forecast")]
#[command(about = "Probabilistic river discharge and stage forecasting", long_about = None)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, global = true, default_value = "config/pipeline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest raw series, align, clean and build the feature table
    Prepare,
    /// Train p10/p50/p90 models for every scope
    Train {
        /// Reuse scopes that already have a checkpoint
        #[arg(long, default_value_t = false)]
        resume: bool,
    },
    /// Replay trained models over the feature table
    Hindcast {
        /// Horizons to hindcast, in raster steps (defaults to all configured)
        #[arg(long, value_delimiter = ',')]
        horizons: Vec<usize>,
    },
    /// Compute rolling skill metrics over hindcast tables
    Skill {
        /// Window sizes in points (defaults to the configured windows)
        #[arg(short, long, value_delimiter = ',')]
        window: Vec<usize>,
    },
    /// Forecast from the latest rows and publish the messages
    Publish,
    /// Run every stage in order
    Run {
        /// Reuse scopes that already have a checkpoint
        #[arg(long, default_value_t = false)]
        resume: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/hydro_forecast.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("hydro_forecast.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info")));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(
            EnvFilter::try_from_env("RUST_LOG_JSON").unwrap_or_else(|_| EnvFilter::new("debug")),
        );

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(
        PipelineConfig::load(&cli.config)
            .with_context(|| format!("loading config {}", cli.config.display()))?,
    );
    let store = Arc::new(ArtifactStore::new(&config.paths.artifacts));
    info!(config = %cli.config.display(), mode = %config.training_mode, "Configuration loaded");

    match cli.command {
        Commands::Prepare => {
            pipeline::prepare(&config).context("preparing features")?;
        }
        Commands::Train { resume } => {
            let table = Arc::new(load_features(&config)?);
            train(&config, table, &store, resume).await?;
        }
        Commands::Hindcast { horizons } => {
            let table = Arc::new(load_features(&config)?);
            let horizons = or_configured(horizons, &config.horizon_steps);
            hindcast::run::<GbmQuantileModel>(config.clone(), table, store.clone(), &horizons)
                .await?;
        }
        Commands::Skill { window } => {
            let windows = or_configured(window, &config.evaluation.windows);
            evaluate_skill(&config, &windows)?;
        }
        Commands::Publish => {
            let table = load_features(&config)?;
            publish::run::<GbmQuantileModel>(&config, &table, &store).await?;
        }
        Commands::Run { resume } => {
            let table = Arc::new(pipeline::prepare(&config).context("preparing features")?);
            train(&config, table.clone(), &store, resume).await?;
            hindcast::run::<GbmQuantileModel>(
                config.clone(),
                table.clone(),
                store.clone(),
                &config.horizon_steps,
            )
            .await?;
            evaluate_skill(&config, &config.evaluation.windows)?;
            publish::run::<GbmQuantileModel>(&config, &table, &store).await?;
        }
    }

    Ok(())
}

fn or_configured(requested: Vec<usize>, configured: &[usize]) -> Vec<usize> {
    if requested.is_empty() {
        configured.to_vec()
    } else {
        requested
    }
}

fn load_features(config: &PipelineConfig) -> Result<FeatureTable> {
    let path = &config.paths.features;
    output::read_table(path).with_context(|| {
        format!(
            "reading feature table {} (run `prepare` first)",
            path.display()
        )
    })
}

async fn train(
    config: &Arc<PipelineConfig>,
    table: Arc<FeatureTable>,
    store: &Arc<ArtifactStore>,
    resume: bool,
) -> Result<()> {
    let learner = Arc::new(GbmQuantileLearner::new(config.model.clone()));
    training::run(config.clone(), table, learner, store.clone(), resume).await?;
    Ok(())
}

fn evaluate_skill(config: &PipelineConfig, windows: &[usize]) -> Result<()> {
    if windows.contains(&0) {
        anyhow::bail!("window sizes must be positive");
    }
    let written = skill::run(
        &config.paths.hindcast_dir,
        &config.paths.metrics_dir,
        windows,
    )
    .with_context(|| format!("scoring hindcasts in {}", config.paths.hindcast_dir.display()))?;
    info!(tables = written.len(), "Skill evaluation finished");
    Ok(())
}
