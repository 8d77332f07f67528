//! Pipeline runtime: one explicit context object per caller, tying schema inference,
//! feature building, training, the registry, forecasting and anomaly scoring together.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;

use crate::{
    anomaly::{self, AnomalyMethod, AnomalyScore},
    config::PipelineConfig,
    dataset::RawDataset,
    error::{PipelineError, PipelineResult},
    features::{FeatureBuilder, FeatureManifest, FeatureMatrix, FeatureSpec},
    models::{ModelKind, ModelProvider, ProviderSet},
    registry::{ModelRegistry, ModelSummary},
    schema::{Schema, SchemaInference},
    serving::{self, ForecastSeries, Reconciler},
    telemetry::PipelineTelemetry,
    training::{CancelSet, ModelId, TrainedModel, Trainer, TrainingBatch},
    validation::{self, DataQualityReport},
};

/// Result of one training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Schema the run used.
    pub schema: Schema,
    /// Manifest shared by every trained model.
    pub manifest: Arc<FeatureManifest>,
    /// Models and per-kind failures.
    pub batch: TrainingBatch,
    /// Data-quality report, when a target was checked.
    pub quality: Option<DataQualityReport>,
    /// Trained models the registry refused. The others stay saved.
    pub save_failures: Vec<SaveFailure>,
}

impl TrainingOutcome {
    /// Ids of the saved models, in request order.
    #[must_use]
    pub fn saved(&self) -> Vec<ModelId> {
        self.batch
            .models
            .iter()
            .map(TrainedModel::id)
            .filter(|id| !self.save_failures.iter().any(|failure| &failure.id == *id))
            .cloned()
            .collect()
    }
}

/// A trained model that could not be written to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFailure {
    /// Model id.
    pub id: ModelId,
    /// Model kind.
    pub kind: ModelKind,
    /// Registry error.
    pub reason: String,
}

/// What a training call should fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    /// Target column.
    pub target: String,
    /// Kinds to fit.
    pub kinds: Vec<ModelKind>,
    /// Feature spec; the configured default when absent.
    pub spec: Option<FeatureSpec>,
    /// Date column overriding inference.
    pub date_column: Option<String>,
    /// Group column overriding inference.
    pub group_column: Option<String>,
}

impl TrainRequest {
    /// Request for every built-in kind with the default spec.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kinds: ModelKind::ALL.to_vec(),
            spec: None,
            date_column: None,
            group_column: None,
        }
    }

    /// Restricts the kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = ModelKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Sets the feature spec.
    #[must_use]
    pub fn with_spec(mut self, spec: FeatureSpec) -> Self {
        self.spec = Some(spec);
        self
    }
}

/// Context object for pipeline calls. Holds no per-run state; the registry is shared.
#[derive(Debug, Clone)]
pub struct PipelineRuntime {
    config: PipelineConfig,
    providers: ProviderSet,
    registry: ModelRegistry,
    telemetry: Option<PipelineTelemetry>,
}

impl PipelineRuntime {
    /// Creates a runtime with the built-in providers.
    #[must_use]
    pub fn new(config: PipelineConfig, registry: ModelRegistry) -> Self {
        let providers = ProviderSet::builtin(&config.models);
        Self {
            config,
            providers,
            registry,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Replaces the provider of one kind.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.register(provider);
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Shared registry handle.
    #[must_use]
    pub const fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Infers a schema.
    #[must_use]
    pub fn infer_schema(&self, data: &RawDataset) -> Schema {
        let schema = SchemaInference::new(self.config.schema.clone()).infer(data);
        self.log(
            LogLevel::Info,
            "schema.inferred",
            json!({
                "date_column": schema.date_column(),
                "group_column": schema.group_column(),
                "targets": schema.candidate_targets().len(),
                "quality": schema.quality(),
            }),
        );
        schema
    }

    /// Builds a matrix and manifest; `spec` defaults to the configured one.
    pub fn build_features(
        &self,
        data: &RawDataset,
        schema: &Schema,
        spec: Option<&FeatureSpec>,
        target: &str,
    ) -> PipelineResult<(FeatureMatrix, Arc<FeatureManifest>)> {
        let spec = spec.unwrap_or(&self.config.features.default_spec);
        let (matrix, manifest) = FeatureBuilder::new(&self.config.features).build(data, schema, spec, target)?;
        self.log(
            LogLevel::Info,
            "features.built",
            json!({
                "target": target,
                "rows": matrix.rows(),
                "columns": manifest.feature_columns().len(),
                "imputed_cells": manifest.imputed_cells(),
                "digest": manifest.digest(),
            }),
        );
        Ok((matrix, manifest))
    }

    /// Data-quality checks for a target.
    pub fn validate_data(&self, data: &RawDataset, target: &str) -> PipelineResult<DataQualityReport> {
        validation::validate_data_quality(data, target)
    }

    /// Infers, builds, trains and saves every successful model.
    pub fn train(&self, data: &RawDataset, request: &TrainRequest) -> PipelineResult<TrainingOutcome> {
        self.train_with_cancel(data, request, &CancelSet::default())
    }

    /// Training with per-kind cancellation. Cancelled or failed kinds are never saved.
    pub fn train_with_cancel(
        &self,
        data: &RawDataset,
        request: &TrainRequest,
        cancel: &CancelSet,
    ) -> PipelineResult<TrainingOutcome> {
        let mut schema = self.infer_schema(data);
        if let Some(column) = &request.date_column {
            schema = schema.with_date_column(column)?;
        }
        if let Some(column) = &request.group_column {
            schema = schema.with_group_column(column)?;
        }
        if schema.is_unusable() {
            return Err(PipelineError::SchemaAmbiguous("no numeric target candidates".into()));
        }

        let quality = match self.config.training.min_data_quality {
            Some(required) => {
                let report = validation::validate_data_quality(data, &request.target)?;
                report.require(required)?;
                Some(report)
            }
            None => None,
        };

        let (matrix, manifest) = self.build_features(data, &schema, request.spec.as_ref(), &request.target)?;
        let inspection = validation::validate_feature_matrix(&matrix);
        if !inspection.warnings.is_empty() {
            self.log(
                LogLevel::Debug,
                "features.warnings",
                json!({ "warnings": inspection.warnings }),
            );
        }

        let trainer = Trainer::new(self.config.training.clone(), self.providers.clone());
        let batch = trainer.train_with_telemetry(&matrix, &manifest, &request.kinds, cancel, self.telemetry.as_ref());
        let mut save_failures = Vec::new();
        for model in &batch.models {
            match self.registry.save(model) {
                Ok(id) => self.log(
                    LogLevel::Info,
                    "registry.saved",
                    json!({ "model_id": id.as_str(), "kind": model.kind() }),
                ),
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        "registry.save_failed",
                        json!({ "model_id": model.id().as_str(), "kind": model.kind(), "error": err.to_string() }),
                    );
                    save_failures.push(SaveFailure {
                        id: model.id().clone(),
                        kind: model.kind(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let payload = json!({
            "target": request.target,
            "models": batch.models.len(),
            "failures": batch.failures.len(),
            "save_failures": save_failures.len(),
            "best": batch.best.as_ref().map(ModelId::as_str),
        });
        self.log(LogLevel::Info, "training.completed", payload.clone());
        self.event("pipeline.training.completed", payload);
        Ok(TrainingOutcome {
            schema,
            manifest,
            batch,
            quality,
            save_failures,
        })
    }

    /// Summaries of registered models, newest first.
    pub fn list_models(&self) -> PipelineResult<Vec<ModelSummary>> {
        self.registry.list()
    }

    /// Deletes a registered model.
    pub fn delete_model(&self, id: &str) -> PipelineResult<()> {
        self.registry.delete(id)?;
        self.log(LogLevel::Info, "registry.deleted", json!({ "model_id": id }));
        Ok(())
    }

    /// Forecasts with a registered model. Fails closed on feature mismatch.
    pub fn forecast(&self, model_id: &str, data: &RawDataset, horizon: usize) -> PipelineResult<ForecastSeries> {
        let model = self.registry.load(model_id)?;
        let series = self
            .reconciler()
            .forecast_with_telemetry(&model, data, horizon, self.telemetry.as_ref())?;
        self.event(
            "pipeline.forecast.completed",
            json!({ "model_id": model_id, "points": series.points.len(), "mode": series.mode }),
        );
        Ok(series)
    }

    /// Like [`Self::forecast`], but when `allow_fallback` is set a feature mismatch
    /// yields a naive extrapolation tagged with the mismatch as its cause.
    pub fn forecast_or_fallback(
        &self,
        model_id: &str,
        data: &RawDataset,
        horizon: usize,
        allow_fallback: bool,
    ) -> PipelineResult<ForecastSeries> {
        match self.forecast(model_id, data, horizon) {
            Err(err @ PipelineError::FeatureMismatch { .. }) if allow_fallback => {
                let model = self.registry.load(model_id)?;
                let cause = err.to_string();
                let series =
                    serving::naive_extrapolation(data, model.manifest(), horizon, &self.config.serving, cause.clone())?;
                self.log(
                    LogLevel::Warn,
                    "forecast.fallback",
                    json!({ "model_id": model_id, "cause": cause }),
                );
                self.event(
                    "pipeline.forecast.fallback",
                    json!({ "model_id": model_id, "points": series.points.len() }),
                );
                Ok(series)
            }
            other => other,
        }
    }

    /// Scores one numeric column; method and threshold default to the configured ones.
    pub fn score_anomalies(
        &self,
        data: &RawDataset,
        column: &str,
        method: Option<AnomalyMethod>,
        threshold: Option<f64>,
    ) -> PipelineResult<Vec<AnomalyScore>> {
        let method = method.unwrap_or(self.config.anomaly.method);
        let threshold = threshold.unwrap_or_else(|| self.config.anomaly.threshold_for(method));
        let scores = anomaly::score_dataset_column(data, column, method, threshold)?;
        let flagged = scores.iter().filter(|score| score.is_anomaly).count();
        self.log(
            LogLevel::Info,
            "anomaly.scored",
            json!({
                "column": column,
                "method": method,
                "threshold": threshold,
                "rows": scores.len(),
                "flagged": flagged,
            }),
        );
        self.event(
            "pipeline.anomaly.scored",
            json!({ "column": column, "flagged": flagged }),
        );
        Ok(scores)
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.config.serving.clone(), self.providers.clone())
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(telemetry) = self.telemetry.as_ref() {
            let _ = telemetry.log(level, message, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: Value) {
        if let Some(telemetry) = self.telemetry.as_ref() {
            let _ = telemetry.event(event_type, payload);
        }
    }
}
