use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    anomaly::AnomalyMethod,
    error::{PipelineError, PipelineResult},
    features::FeatureSpec,
    training::metrics::PrimaryMetric,
};

/// Top-level pipeline configuration, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Schema inference heuristics.
    pub schema: SchemaConfig,
    /// Feature derivation defaults.
    pub features: FeatureConfig,
    /// Training orchestration.
    pub training: TrainingConfig,
    /// Forecast reconciliation.
    pub serving: ServingConfig,
    /// Anomaly scoring defaults.
    pub anomaly: AnomalyConfig,
    /// Built-in model provider parameters.
    pub models: ModelConfig,
}

impl PipelineConfig {
    /// Loads and validates a TOML document.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates a TOML string. Absent keys take their defaults.
    pub fn from_toml_str(raw: &str) -> PipelineResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no stage can work with.
    pub fn validate(&self) -> PipelineResult<()> {
        check_fraction("schema.date_parse_threshold", self.schema.date_parse_threshold)?;
        check_fraction("schema.max_missing_ratio", self.schema.max_missing_ratio)?;
        check_fraction("training.holdout_fraction", self.training.holdout_fraction)?;
        check_fraction("serving.max_missing_ratio", self.serving.max_missing_ratio)?;
        if let Some(min) = self.training.min_data_quality {
            check_fraction("training.min_data_quality", min)?;
        }
        if self.serving.max_horizon == 0 {
            return Err(PipelineError::Config("serving.max_horizon must be positive".into()));
        }
        if self.serving.confidence_z < 0.0 {
            return Err(PipelineError::Config("serving.confidence_z must be >= 0".into()));
        }
        if self.anomaly.threshold <= 0.0 || self.anomaly.iqr_multiplier <= 0.0 {
            return Err(PipelineError::Config(
                "anomaly thresholds must be positive".into(),
            ));
        }
        if self.models.boosting_rounds == 0 || self.models.season_length == 0 {
            return Err(PipelineError::Config(
                "models.boosting_rounds and models.season_length must be positive".into(),
            ));
        }
        let weights = &self.schema.quality_weights;
        if weights.completeness < 0.0 || weights.uniqueness < 0.0 || weights.date_bonus < 0.0 {
            return Err(PipelineError::Config("quality weights must be >= 0".into()));
        }
        self.features.default_spec.validate()
    }
}

fn check_fraction(name: &str, value: f64) -> PipelineResult<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "{name} must lie strictly between 0 and 1, got {value}"
        )))
    }
}

/// Heuristics used by schema inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Date column aliases, in priority order.
    pub date_aliases: Vec<String>,
    /// Group column aliases, in priority order.
    pub group_aliases: Vec<String>,
    /// Share of parseable values above which an unnamed column counts as the date.
    pub date_parse_threshold: f64,
    /// Columns missing more than this share are not candidates.
    pub max_missing_ratio: f64,
    /// Weights of the reporting-only quality score.
    pub quality_weights: QualityWeights,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            date_aliases: ["date", "timestamp", "datetime", "time"]
                .map(String::from)
                .to_vec(),
            group_aliases: ["site_id", "station", "location", "plant", "site"]
                .map(String::from)
                .to_vec(),
            date_parse_threshold: 0.9,
            max_missing_ratio: 0.5,
            quality_weights: QualityWeights::default(),
        }
    }
}

/// Weights of the schema quality score; normalised by their sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    /// Weight of `1 - missing ratio`.
    pub completeness: f64,
    /// Weight of `1 - duplicate row ratio`.
    pub uniqueness: f64,
    /// Weight of the date-column bonus.
    pub date_bonus: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            completeness: 0.45,
            uniqueness: 0.35,
            date_bonus: 0.20,
        }
    }
}

/// Feature derivation defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Minimum matrix rows after warm-up rows are dropped.
    pub min_rows: usize,
    /// Spec used when the caller does not supply one.
    pub default_spec: FeatureSpec,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            min_rows: 30,
            default_spec: FeatureSpec::default(),
        }
    }
}

/// Training orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Trailing share of rows (date order) held out for scoring.
    pub holdout_fraction: f64,
    /// Metric used to pick the best kind.
    pub primary_metric: PrimaryMetric,
    /// Refit every kind on the full matrix after scoring.
    pub refit_on_full: bool,
    /// Fit kinds on separate threads.
    pub parallel: bool,
    /// Optional gate on the data-quality report; unset means no gating.
    pub min_data_quality: Option<f64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.2,
            primary_metric: PrimaryMetric::Rmse,
            refit_on_full: true,
            parallel: true,
            min_data_quality: None,
        }
    }
}

/// Forecast reconciliation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Missing-column share above which reconciliation fails closed.
    pub max_missing_ratio: f64,
    /// Longest accepted horizon.
    pub max_horizon: usize,
    /// Multiplier on the residual std for confidence bounds.
    pub confidence_z: f64,
    /// Observations used by the naive fallback.
    pub fallback_lookback: usize,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            max_missing_ratio: 0.5,
            max_horizon: 365,
            confidence_z: 1.96,
            fallback_lookback: 30,
        }
    }
}

/// Anomaly scoring defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Default method.
    pub method: AnomalyMethod,
    /// z-score threshold.
    pub threshold: f64,
    /// IQR fence multiplier.
    pub iqr_multiplier: f64,
}

impl AnomalyConfig {
    /// Threshold passed to the scorer for `method`: the z cut-off or the IQR fence multiplier.
    #[must_use]
    pub const fn threshold_for(&self, method: AnomalyMethod) -> f64 {
        match method {
            AnomalyMethod::ZScore => self.threshold,
            AnomalyMethod::Iqr => self.iqr_multiplier,
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            method: AnomalyMethod::ZScore,
            threshold: 3.0,
            iqr_multiplier: 1.5,
        }
    }
}

/// Parameters of the built-in model providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Ridge penalty on standardised weights.
    pub ridge_lambda: f64,
    /// Boosting rounds.
    pub boosting_rounds: usize,
    /// Shrinkage per round.
    pub boosting_learning_rate: f64,
    /// Candidate split points per feature.
    pub boosting_max_splits: usize,
    /// Season length of the native seasonal model, in rows.
    pub season_length: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            ridge_lambda: 1.0,
            boosting_rounds: 100,
            boosting_learning_rate: 0.1,
            boosting_max_splits: 16,
            season_length: 7,
        }
    }
}
