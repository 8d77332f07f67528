//! Model trainer: fits every requested kind against one matrix and scores it on a temporal holdout.

/// Holdout metrics and the primary-metric selector.
pub mod metrics;
/// Temporal train/holdout split.
pub mod split;

use std::{
    collections::HashSet,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use uuid::Uuid;

pub use metrics::{Metrics, PrimaryMetric};
pub use split::TemporalSplit;

use crate::{
    config::TrainingConfig,
    error::PipelineError,
    features::{FeatureManifest, FeatureMatrix},
    models::{FittedState, ModelCapability, ModelKind, ModelProvider, ProviderSet},
    telemetry::{self, PipelineTelemetry},
};

/// Identifier of a trained model (`model-<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    /// Wraps an existing identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("model-{}", Uuid::new_v4()))
    }

    /// Borrows the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fitted state of one native-series group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    /// Group key; `None` for ungrouped data.
    pub group: Option<String>,
    /// Provider state.
    pub state: FittedState,
}

/// Fitted parameters, shaped by the kind's capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum ModelState {
    /// One state over the manifest features.
    Matrix {
        /// Provider state.
        state: FittedState,
    },
    /// One state per group over the raw target series.
    Series {
        /// States in group order.
        groups: Vec<GroupState>,
    },
}

/// A fitted model bound to the manifest of its training matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    id: ModelId,
    kind: ModelKind,
    state: ModelState,
    manifest: Arc<FeatureManifest>,
    metrics: Metrics,
    trained_at: DateTime<Utc>,
}

impl TrainedModel {
    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> &ModelId {
        &self.id
    }

    /// Model kind.
    #[must_use]
    pub const fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Fitted parameters.
    #[must_use]
    pub const fn state(&self) -> &ModelState {
        &self.state
    }

    /// Manifest that produced the training matrix.
    #[must_use]
    pub fn manifest(&self) -> &Arc<FeatureManifest> {
        &self.manifest
    }

    /// Holdout metrics.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Training time.
    #[must_use]
    pub const fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }
}

/// A kind that did not produce a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitFailure {
    /// Failed kind.
    pub kind: ModelKind,
    /// Reason reported by the provider or the trainer.
    pub reason: String,
}

impl FitFailure {
    /// Converts into the error raised when a caller needs a single kind.
    #[must_use]
    pub fn into_error(self) -> PipelineError {
        PipelineError::ModelFitFailure {
            kind: self.kind,
            reason: self.reason,
        }
    }
}

/// Outcome of one orchestration call: partial success is the norm.
#[derive(Debug, Clone, Default)]
pub struct TrainingBatch {
    /// Models that trained, in request order.
    pub models: Vec<TrainedModel>,
    /// Kinds that failed, in request order.
    pub failures: Vec<FitFailure>,
    /// Best model by the primary metric.
    pub best: Option<ModelId>,
}

impl TrainingBatch {
    /// Best model, if any succeeded.
    #[must_use]
    pub fn best_model(&self) -> Option<&TrainedModel> {
        let best = self.best.as_ref()?;
        self.models.iter().find(|model| model.id() == best)
    }
}

/// Kinds a caller has abandoned. Cancelled kinds end as failures and never reach the registry.
#[derive(Debug, Clone, Default)]
pub struct CancelSet {
    kinds: Arc<Mutex<HashSet<ModelKind>>>,
}

impl CancelSet {
    /// Cancels one kind.
    pub fn cancel(&self, kind: ModelKind) {
        self.kinds.lock().insert(kind);
    }

    /// True when the kind was cancelled.
    #[must_use]
    pub fn is_cancelled(&self, kind: ModelKind) -> bool {
        self.kinds.lock().contains(&kind)
    }
}

/// Fits and scores model kinds.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
    providers: ProviderSet,
}

impl Trainer {
    /// Creates a trainer.
    #[must_use]
    pub fn new(config: TrainingConfig, providers: ProviderSet) -> Self {
        Self { config, providers }
    }

    /// Trains every requested kind. Never fails as a whole.
    #[must_use]
    pub fn train(
        &self,
        matrix: &FeatureMatrix,
        manifest: &Arc<FeatureManifest>,
        kinds: &[ModelKind],
    ) -> TrainingBatch {
        self.train_with_telemetry(matrix, manifest, kinds, &CancelSet::default(), None)
    }

    /// Trains with cancellation and optional telemetry.
    #[must_use]
    pub fn train_with_telemetry(
        &self,
        matrix: &FeatureMatrix,
        manifest: &Arc<FeatureManifest>,
        kinds: &[ModelKind],
        cancel: &CancelSet,
        telemetry: Option<&PipelineTelemetry>,
    ) -> TrainingBatch {
        let mut requested: Vec<ModelKind> = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !requested.contains(kind) {
                requested.push(*kind);
            }
        }

        let outcomes: Vec<(ModelKind, Result<TrainedModel, String>)> =
            if self.config.parallel && requested.len() > 1 {
                thread::scope(|scope| {
                    let handles: Vec<_> = requested
                        .iter()
                        .map(|kind| {
                            let kind = *kind;
                            (kind, scope.spawn(move || self.fit_kind(kind, matrix, manifest, cancel)))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|(kind, handle)| {
                            let outcome = handle
                                .join()
                                .unwrap_or_else(|_| Err("provider panicked".to_string()));
                            (kind, outcome)
                        })
                        .collect()
                })
            } else {
                requested
                    .iter()
                    .map(|kind| {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            self.fit_kind(*kind, matrix, manifest, cancel)
                        }))
                        .unwrap_or_else(|_| Err("provider panicked".to_string()));
                        (*kind, outcome)
                    })
                    .collect()
            };

        let mut batch = TrainingBatch::default();
        for (kind, outcome) in outcomes {
            match outcome {
                Ok(model) => {
                    telemetry::log(
                        telemetry,
                        LogLevel::Info,
                        "training.kind_completed",
                        json!({
                            "kind": kind,
                            "model_id": model.id().as_str(),
                            "rmse": model.metrics().rmse,
                            "mae": model.metrics().mae,
                        }),
                    );
                    batch.models.push(model);
                }
                Err(reason) => {
                    telemetry::log(
                        telemetry,
                        LogLevel::Warn,
                        "training.kind_failed",
                        json!({ "kind": kind, "reason": reason }),
                    );
                    batch.failures.push(FitFailure { kind, reason });
                }
            }
        }
        batch.best = select_best(&batch.models, self.config.primary_metric);
        batch
    }

    fn fit_kind(
        &self,
        kind: ModelKind,
        matrix: &FeatureMatrix,
        manifest: &Arc<FeatureManifest>,
        cancel: &CancelSet,
    ) -> Result<TrainedModel, String> {
        if cancel.is_cancelled(kind) {
            return Err("cancelled".into());
        }
        let provider = self
            .providers
            .get(kind)
            .ok_or_else(|| format!("no provider registered for {kind}"))?;
        let split = TemporalSplit::trailing(matrix.rows(), self.config.holdout_fraction)
            .ok_or_else(|| format!("need at least 2 rows, got {}", matrix.rows()))?;

        let (state, metrics) = match kind.capability() {
            ModelCapability::ManifestFeatures => self.fit_matrix(provider.as_ref(), matrix, &split)?,
            ModelCapability::NativeSeries => self.fit_series(provider.as_ref(), matrix, &split)?,
        };
        if !metrics.is_finite() {
            return Err("non-finite holdout metrics".into());
        }
        if cancel.is_cancelled(kind) {
            return Err("cancelled".into());
        }
        Ok(TrainedModel {
            id: ModelId::generate(),
            kind,
            state,
            manifest: Arc::clone(manifest),
            metrics,
            trained_at: Utc::now(),
        })
    }

    fn fit_matrix(
        &self,
        provider: &dyn ModelProvider,
        matrix: &FeatureMatrix,
        split: &TemporalSplit,
    ) -> Result<(ModelState, Metrics), String> {
        let train = matrix.slice_rows(split.train.clone());
        let holdout = matrix.slice_rows(split.holdout.clone());
        let state = provider
            .fit(train.features(), train.target())
            .map_err(|err| err.to_string())?;
        let predicted = provider
            .predict(&state, holdout.features())
            .map_err(|err| err.to_string())?;
        if predicted.iter().any(|value| !value.is_finite()) {
            return Err("provider produced non-finite predictions".into());
        }
        let metrics = Metrics::compute(&holdout.target().to_vec(), &predicted.to_vec())
            .ok_or("prediction count does not match holdout rows")?;
        let state = if self.config.refit_on_full {
            provider
                .fit(matrix.features(), matrix.target())
                .map_err(|err| err.to_string())?
        } else {
            state
        };
        Ok((ModelState::Matrix { state }, metrics))
    }

    /// Native kinds fit each group on its matrix targets, so the warm-up rows are
    /// excluded exactly as for the matrix kinds and both are scored on the same holdout.
    /// Forecasting hands the provider the full observed series of the new data.
    fn fit_series(
        &self,
        provider: &dyn ModelProvider,
        matrix: &FeatureMatrix,
        split: &TemporalSplit,
    ) -> Result<(ModelState, Metrics), String> {
        let mut actual = Vec::new();
        let mut predicted = Vec::new();
        let mut groups = Vec::new();
        for (group, positions) in matrix.group_positions() {
            let (train_pos, test_pos): (Vec<usize>, Vec<usize>) =
                positions.iter().partition(|pos| split.is_train(**pos));
            let train = matrix.target_at(&train_pos);
            let full = matrix.target_at(&positions);
            if !train.is_empty() && !test_pos.is_empty() {
                let state = provider.fit_series(&train).map_err(|err| err.to_string())?;
                let forecast = provider
                    .forecast_series(&state, &train, test_pos.len())
                    .map_err(|err| err.to_string())?;
                actual.extend(matrix.target_at(&test_pos));
                predicted.extend(forecast);
            }
            let fit_on = if self.config.refit_on_full || train.is_empty() {
                &full
            } else {
                &train
            };
            let state = provider.fit_series(fit_on).map_err(|err| err.to_string())?;
            groups.push(GroupState { group, state });
        }
        if predicted.iter().any(|value: &f64| !value.is_finite()) {
            return Err("provider produced non-finite predictions".into());
        }
        let metrics = Metrics::compute(&actual, &predicted)
            .ok_or("no group has both training and holdout rows")?;
        Ok((ModelState::Series { groups }, metrics))
    }
}

fn select_best(models: &[TrainedModel], metric: PrimaryMetric) -> Option<ModelId> {
    models
        .iter()
        .filter(|model| metric.value(model.metrics()).is_finite())
        .min_by(|a, b| {
            metric
                .value(a.metrics())
                .total_cmp(&metric.value(b.metrics()))
                .then(a.kind().complexity_rank().cmp(&b.kind().complexity_rank()))
        })
        .map(|model| model.id().clone())
}
