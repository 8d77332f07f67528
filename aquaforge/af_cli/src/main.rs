//! `af`: command-line front end for the aquaforge forecasting pipeline.

mod ingest;

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use aquaforge_pipeline::{
    features::RollingAggregate, synthetic, AnomalyMethod, FeatureSpec, ModelKind, ModelRegistry, PipelineConfig,
    PipelineRuntime, PipelineTelemetry, TrainRequest,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "af", version, about = "Feature-consistent training and forecasting")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Pipeline configuration (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Registry directory.
    #[arg(long, global = true, default_value = "aquaforge-data/registry")]
    registry: PathBuf,
    /// JSON-lines log file.
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    /// JSON-lines event log.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Writes a synthetic wastewater dataset.
    Generate {
        #[arg(long, default_value_t = 3)]
        sites: usize,
        #[arg(long, default_value_t = 365)]
        days: usize,
        #[arg(long, default_value = "2019-01-01")]
        start: NaiveDate,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prints the inferred schema of a CSV file.
    Schema {
        #[arg(long)]
        data: PathBuf,
    },
    /// Trains and registers models.
    Train(TrainArgs),
    /// Lists registered models, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Shows one registered model with its manifest.
    Show { model_id: String },
    /// Deletes a registered model.
    Delete { model_id: String },
    /// Forecasts with a registered model.
    Forecast {
        model_id: String,
        #[arg(long)]
        data: PathBuf,
        #[arg(long, default_value_t = 7)]
        horizon: usize,
        /// Fall back to naive extrapolation when the data does not match the manifest.
        #[arg(long)]
        fallback: bool,
    },
    /// Scores one column for anomalies.
    Anomalies {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        column: String,
        #[arg(long)]
        method: Option<String>,
        #[arg(long)]
        threshold: Option<f64>,
        /// Print every row, not only flagged ones.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    target: String,
    /// Comma-separated kinds (seasonal_naive, ridge, gradient_boosting).
    #[arg(long, value_delimiter = ',')]
    kinds: Vec<String>,
    /// Lag/rolling sources; the target when empty.
    #[arg(long, value_delimiter = ',')]
    sources: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    lags: Option<Vec<usize>>,
    #[arg(long, value_delimiter = ',')]
    windows: Option<Vec<usize>>,
    /// Explicit base columns; every numeric candidate when absent.
    #[arg(long, value_delimiter = ',')]
    base: Option<Vec<String>>,
    #[arg(long)]
    date_column: Option<String>,
    #[arg(long)]
    group_column: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = || build_runtime(&cli.global);
    match cli.command {
        Commands::Generate {
            sites,
            days,
            start,
            seed,
            out,
        } => {
            let dataset = synthetic::wastewater_sample(sites, days, start, seed);
            ingest::write_csv(&dataset, &out)?;
            let report = json!({ "rows": dataset.len(), "columns": dataset.width(), "path": out });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Schema { data } => {
            let dataset = ingest::read_csv(&data)?;
            let schema = runtime()?.infer_schema(&dataset);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::Train(args) => handle_train(&runtime()?, args),
        Commands::List { limit } => {
            for summary in runtime()?.list_models()?.into_iter().take(limit) {
                println!(
                    "{} | {} | {} | rmse {:.4} | smape {:.2} | {}",
                    summary.id,
                    summary.kind,
                    summary.target,
                    summary.metrics.rmse,
                    summary.metrics.smape,
                    summary.saved_at
                );
            }
            Ok(())
        }
        Commands::Show { model_id } => {
            let model = runtime()?
                .registry()
                .load(&model_id)
                .with_context(|| format!("loading {model_id}"))?;
            println!("{}", serde_json::to_string_pretty(&model)?);
            Ok(())
        }
        Commands::Delete { model_id } => {
            runtime()?.delete_model(&model_id)?;
            println!("deleted {model_id}");
            Ok(())
        }
        Commands::Forecast {
            model_id,
            data,
            horizon,
            fallback,
        } => {
            let dataset = ingest::read_csv(&data)?;
            let series = runtime()?
                .forecast_or_fallback(&model_id, &dataset, horizon, fallback)
                .with_context(|| format!("forecasting with {model_id}"))?;
            println!("{}", serde_json::to_string_pretty(&series)?);
            Ok(())
        }
        Commands::Anomalies {
            data,
            column,
            method,
            threshold,
            all,
        } => {
            let dataset = ingest::read_csv(&data)?;
            let method = method.map(|raw| raw.parse::<AnomalyMethod>()).transpose()?;
            let scores = runtime()?.score_anomalies(&dataset, &column, method, threshold)?;
            let shown: Vec<_> = scores.into_iter().filter(|score| all || score.is_anomaly).collect();
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

fn build_runtime(global: &GlobalArgs) -> Result<PipelineRuntime> {
    let config = match &global.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let registry = ModelRegistry::open(&global.registry)
        .with_context(|| format!("opening registry {}", global.registry.display()))?;
    let mut builder = PipelineTelemetry::builder("af");
    if let Some(path) = &global.log {
        builder = builder.log_path(path).min_level(LogLevel::Info);
    }
    if let Some(path) = &global.events {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    Ok(PipelineRuntime::new(config, registry).with_telemetry(builder.build()?))
}

fn handle_train(runtime: &PipelineRuntime, args: TrainArgs) -> Result<()> {
    let dataset = ingest::read_csv(&args.data)?;
    let kinds = if args.kinds.is_empty() {
        ModelKind::ALL.to_vec()
    } else {
        args.kinds
            .iter()
            .map(|raw| raw.parse::<ModelKind>().with_context(|| format!("unknown kind {raw}")))
            .collect::<Result<Vec<_>>>()?
    };

    let mut spec: FeatureSpec = runtime.config().features.default_spec.clone();
    if !args.sources.is_empty() {
        spec = spec.with_sources(args.sources);
    }
    if let Some(lags) = args.lags {
        spec = spec.with_lags(lags);
    }
    if let Some(windows) = args.windows {
        let aggregates = if spec.rolling_aggregates.is_empty() {
            vec![RollingAggregate::Mean]
        } else {
            spec.rolling_aggregates.clone()
        };
        spec = spec.with_rolling(windows, aggregates);
    }
    if let Some(base) = args.base {
        spec = spec.with_base_columns(base);
    }

    let request = TrainRequest {
        target: args.target,
        kinds,
        spec: Some(spec),
        date_column: args.date_column,
        group_column: args.group_column,
    };
    let outcome = runtime.train(&dataset, &request)?;
    let report = json!({
        "target": request.target,
        "manifest_digest": outcome.manifest.digest(),
        "feature_columns": outcome.manifest.feature_columns(),
        "training_rows": outcome.manifest.training_rows(),
        "models": outcome.batch.models.iter().map(|model| json!({
            "id": model.id(),
            "kind": model.kind(),
            "metrics": model.metrics(),
        })).collect::<Vec<_>>(),
        "failures": outcome.batch.failures,
        "save_failures": outcome.save_failures,
        "best": outcome.batch.best,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    if outcome.batch.models.is_empty() {
        bail!("no model kind trained successfully");
    }
    if outcome.saved().is_empty() {
        bail!("no trained model could be saved");
    }
    Ok(())
}
