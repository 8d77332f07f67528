//! Forecast reconciler: rebuilds features for new data from a stored manifest and forecasts ahead.

/// Column alignment between a manifest and new data.
pub mod alignment;
/// Naive extrapolation used as an explicit degraded mode.
pub mod fallback;

use chrono::{Duration, NaiveDateTime};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

pub use alignment::AlignmentReport;
pub use fallback::naive_extrapolation;

use crate::{
    config::ServingConfig,
    dataset::RawDataset,
    error::{PipelineError, PipelineResult},
    features::{derive, FeatureManifest, FeatureMatrix},
    models::{ModelCapability, ModelKind, ModelProvider, ProviderError, ProviderSet},
    telemetry::{self, PipelineTelemetry},
    training::{ModelId, ModelState, TrainedModel},
    validation,
};

/// How a forecast was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ForecastMode {
    /// Manifest features, rebuilt and extended recursively.
    Manifest,
    /// Model forecasting on the raw target series.
    Native,
    /// Naive extrapolation chosen by the caller.
    Fallback {
        /// Why the model forecast was not used.
        cause: String,
    },
}

/// One forecast step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    /// 1-based step beyond the last observed row.
    pub step: usize,
    /// Date of the step, when the data is dated.
    pub date: Option<NaiveDateTime>,
    /// Group key.
    pub group: Option<String>,
    /// Point forecast.
    pub value: f64,
    /// Lower confidence bound.
    pub lower: f64,
    /// Upper confidence bound.
    pub upper: f64,
}

/// Forecast for every group of the input data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSeries {
    /// Model that produced the forecast; `None` for the fallback.
    pub model_id: Option<ModelId>,
    /// Kind of that model.
    pub kind: Option<ModelKind>,
    /// Forecast column.
    pub target: String,
    /// Production mode.
    pub mode: ForecastMode,
    /// Alignment of the new data against the manifest (manifest mode only).
    pub alignment: Option<AlignmentReport>,
    /// Points grouped by group, ordered by step.
    pub points: Vec<ForecastPoint>,
}

impl ForecastSeries {
    /// Point values in order.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.value).collect()
    }
}

/// Feature matrix rebuilt from new data, with its mandatory alignment report.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedMatrix {
    /// Matrix in manifest column order.
    pub matrix: FeatureMatrix,
    /// Alignment report.
    pub report: AlignmentReport,
}

/// Serves forecasts from trained models. Holds no per-request state.
#[derive(Debug, Clone)]
pub struct Reconciler {
    config: ServingConfig,
    providers: ProviderSet,
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(config: ServingConfig, providers: ProviderSet) -> Self {
        Self { config, providers }
    }

    /// Serving settings.
    #[must_use]
    pub const fn config(&self) -> &ServingConfig {
        &self.config
    }

    /// Re-derives the manifest's columns over `data`. The manifest is authoritative:
    /// nothing is re-inferred from the new data.
    pub fn reconstruct(&self, manifest: &FeatureManifest, data: &RawDataset) -> PipelineResult<AlignedMatrix> {
        let (mut report, absent) = alignment::assess(manifest, data);
        report.check(self.config.max_missing_ratio)?;
        let plan = manifest.plan();
        let fill = manifest.spec().fill.value();
        let inputs = manifest.input_columns();
        let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
        let groups = derive::partition(data, layout(manifest, data), &inputs, false)?;

        let mut rows = Vec::new();
        for group in &groups {
            let (group_rows, filled) = group.history_rows(&plan, &absent, manifest.warmup_rows(), fill);
            report.imputed_cells += filled;
            rows.extend(group_rows);
        }
        derive::order_rows(&mut rows);
        let columns = plan.into_iter().map(|column| column.name).collect();
        Ok(AlignedMatrix {
            matrix: FeatureMatrix::from_rows(columns, rows),
            report,
        })
    }

    /// Forecasts `horizon` steps past the last observed row of each group.
    pub fn forecast(&self, model: &TrainedModel, data: &RawDataset, horizon: usize) -> PipelineResult<ForecastSeries> {
        self.forecast_with_telemetry(model, data, horizon, None)
    }

    /// Forecast with optional telemetry.
    pub fn forecast_with_telemetry(
        &self,
        model: &TrainedModel,
        data: &RawDataset,
        horizon: usize,
        telemetry: Option<&PipelineTelemetry>,
    ) -> PipelineResult<ForecastSeries> {
        validation::validate_horizon(horizon, self.config.max_horizon)?;
        let provider = self
            .providers
            .get(model.kind())
            .ok_or_else(|| ProviderError::InvalidInput(format!("no provider registered for {}", model.kind())))?;
        let result = match model.kind().capability() {
            ModelCapability::NativeSeries => self.forecast_native(model, provider.as_ref(), data, horizon),
            ModelCapability::ManifestFeatures => self.forecast_manifest(model, provider.as_ref(), data, horizon),
        };
        let series = match result {
            Err(err @ PipelineError::FeatureMismatch { .. }) => {
                telemetry::log(
                    telemetry,
                    LogLevel::Warn,
                    "forecast.mismatch",
                    json!({ "model_id": model.id().as_str(), "error": err.to_string() }),
                );
                return Err(err);
            }
            other => other?,
        };
        telemetry::log(
            telemetry,
            LogLevel::Info,
            "forecast.completed",
            json!({
                "model_id": model.id().as_str(),
                "kind": model.kind(),
                "mode": series.mode,
                "points": series.points.len(),
                "missing_columns": series.alignment.as_ref().map(|report| report.missing_columns.len()),
            }),
        );
        Ok(series)
    }

    fn forecast_manifest(
        &self,
        model: &TrainedModel,
        provider: &dyn ModelProvider,
        data: &RawDataset,
        horizon: usize,
    ) -> PipelineResult<ForecastSeries> {
        let manifest = model.manifest();
        let ModelState::Matrix { state } = model.state() else {
            return Err(corrupt(model, "feature model stored without a matrix state"));
        };
        let (mut report, absent) = alignment::assess(manifest, data);
        report.check(self.config.max_missing_ratio)?;
        let plan = manifest.plan();
        let fill = manifest.spec().fill.value();
        let inputs = manifest.input_columns();
        let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
        let mut groups = derive::partition(data, layout(manifest, data), &inputs, true)?;
        let step = manifest.date_step_seconds().map(Duration::seconds);
        let spread = self.config.confidence_z * model.metrics().residual_std;

        let mut points = Vec::with_capacity(groups.len() * horizon);
        for group in groups.iter_mut().filter(|group| group.observed() > 0) {
            let observed = group.observed();
            group.extend_to(observed + horizon, step);
            for ahead in 0..horizon {
                let idx = observed + ahead;
                let (values, filled) = group.row(&plan, &absent, idx, fill);
                report.imputed_cells += filled;
                let features = Array2::from_shape_vec((1, values.len()), values)
                    .map_err(|err| ProviderError::InvalidInput(err.to_string()))?;
                let predicted = provider.predict(state, features.view())?;
                let value = predicted
                    .first()
                    .copied()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| ProviderError::Numerical("prediction is not finite".into()))?;
                group.push_target(value);
                points.push(ForecastPoint {
                    step: ahead + 1,
                    date: group.dates[idx],
                    group: group.key.clone(),
                    value,
                    lower: value - spread,
                    upper: value + spread,
                });
            }
        }
        if points.is_empty() {
            return Err(PipelineError::InsufficientData { required: 1, actual: 0 });
        }
        Ok(ForecastSeries {
            model_id: Some(model.id().clone()),
            kind: Some(model.kind()),
            target: manifest.target().to_string(),
            mode: ForecastMode::Manifest,
            alignment: Some(report),
            points,
        })
    }

    fn forecast_native(
        &self,
        model: &TrainedModel,
        provider: &dyn ModelProvider,
        data: &RawDataset,
        horizon: usize,
    ) -> PipelineResult<ForecastSeries> {
        let manifest = model.manifest();
        let ModelState::Series { groups: states } = model.state() else {
            return Err(corrupt(model, "series model stored without group states"));
        };
        let roles = alignment::missing_roles(manifest, data);
        if !roles.is_empty() {
            return Err(PipelineError::FeatureMismatch {
                missing: Vec::new(),
                roles,
                expected: manifest.feature_columns().len(),
                ratio: 0.0,
                tolerance: self.config.max_missing_ratio,
            });
        }
        let groups = derive::partition(data, layout(manifest, data), &[], false)?;
        let step = Duration::seconds(manifest.date_step_seconds().unwrap_or(86_400));
        let spread = self.config.confidence_z * model.metrics().residual_std;

        let mut points = Vec::with_capacity(groups.len() * horizon);
        for group in groups.iter().filter(|group| group.observed() > 0) {
            let fitted;
            let state = match states.iter().find(|known| known.group == group.key) {
                Some(known) => &known.state,
                None => {
                    fitted = provider.fit_series(&group.target)?;
                    &fitted
                }
            };
            let values = provider.forecast_series(state, &group.target, horizon)?;
            let last_date = group.last_date();
            let mut date = last_date;
            for (ahead, value) in values.into_iter().enumerate() {
                date = date.and_then(|current| current.checked_add_signed(step));
                points.push(ForecastPoint {
                    step: ahead + 1,
                    date,
                    group: group.key.clone(),
                    value,
                    lower: value - spread,
                    upper: value + spread,
                });
            }
        }
        if points.is_empty() {
            return Err(PipelineError::InsufficientData { required: 1, actual: 0 });
        }
        Ok(ForecastSeries {
            model_id: Some(model.id().clone()),
            kind: Some(model.kind()),
            target: manifest.target().to_string(),
            mode: ForecastMode::Native,
            alignment: None,
            points,
        })
    }
}

fn layout<'a>(manifest: &'a FeatureManifest, data: &RawDataset) -> derive::Layout<'a> {
    let present = |column: Option<&'a str>| column.filter(|name| data.has_column(name));
    derive::Layout {
        target: manifest.target(),
        date_column: present(manifest.date_column()),
        group_column: present(manifest.group_column()),
    }
}

fn corrupt(model: &TrainedModel, reason: &str) -> PipelineError {
    PipelineError::RegistryCorrupt {
        id: model.id().to_string(),
        reason: reason.to_string(),
    }
}
