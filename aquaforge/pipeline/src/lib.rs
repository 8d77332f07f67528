#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]
#![allow(clippy::module_name_repetitions, clippy::cast_precision_loss)]

//! Aquaforge pipeline: schema inference, manifest-bound feature building, model training,
//! a model registry, forecast reconciliation and anomaly scoring for tabular time series.

/// Error types shared by every stage.
#[path = "../error.rs"]
pub mod error;

/// TOML-backed pipeline configuration.
#[path = "../config.rs"]
pub mod config;

/// Telemetry helpers for logging/event emission.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Raw tabular input.
#[path = "../dataset.rs"]
pub mod dataset;

/// Column role inference.
#[path = "../schema.rs"]
pub mod schema;

/// Data-quality and input checks.
#[path = "../validation.rs"]
pub mod validation;

/// Synthetic wastewater data.
#[path = "../synthetic.rs"]
pub mod synthetic;

/// Feature derivation and manifests.
#[path = "../features/main.rs"]
pub mod features;

/// Model kinds and capability providers.
#[path = "../models/main.rs"]
pub mod models;

/// Training orchestration and evaluation.
#[path = "../training/main.rs"]
pub mod training;

/// Persistent model registry.
#[path = "../registry/main.rs"]
pub mod registry;

/// Forecast reconciliation.
#[path = "../serving/main.rs"]
pub mod serving;

/// Anomaly scoring.
#[path = "../anomaly.rs"]
pub mod anomaly;

/// High-level runtime entry point.
#[path = "../main.rs"]
pub mod runtime;

pub use anomaly::{AnomalyMethod, AnomalyScore, Severity};
pub use config::PipelineConfig;
pub use dataset::{RawDataset, Value};
pub use error::{PipelineError, PipelineResult};
pub use features::{FeatureBuilder, FeatureManifest, FeatureMatrix, FeatureSpec};
pub use models::{ModelCapability, ModelKind, ModelProvider, ProviderError, ProviderSet};
pub use registry::{ModelRegistry, ModelSummary};
pub use runtime::{PipelineRuntime, SaveFailure, TrainRequest, TrainingOutcome};
pub use schema::{Schema, SchemaInference};
pub use serving::{AlignmentReport, ForecastMode, ForecastPoint, ForecastSeries, Reconciler};
pub use telemetry::{PipelineTelemetry, PipelineTelemetryBuilder};
pub use training::{CancelSet, Metrics, ModelId, TrainedModel, Trainer, TrainingBatch};
