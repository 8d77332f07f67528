use thiserror::Error;

use crate::models::{ModelKind, ProviderError};

/// Result alias used throughout the pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors raised by pipeline stages.
///
/// Per-kind training failures during batch training are returned as
/// [`crate::training::FitFailure`] values, never raised.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Too few usable rows after derivation.
    #[error("insufficient data: {actual} usable rows, at least {required} required")]
    InsufficientData {
        /// Minimum row count.
        required: usize,
        /// Rows left after warm-up rows were dropped.
        actual: usize,
    },
    /// No usable date/target column where one is required.
    #[error("schema ambiguous: {0}")]
    SchemaAmbiguous(String),
    /// A single model kind failed to fit.
    #[error("model kind {kind} failed to fit: {reason}")]
    ModelFitFailure {
        /// Kind that failed.
        kind: ModelKind,
        /// Provider message.
        reason: String,
    },
    /// Reconciliation could not reconstruct enough of the manifest columns.
    #[error(
        "feature mismatch: {} of {expected} manifest columns missing (ratio {ratio:.3}, tolerance {tolerance:.3}): {}{}",
        .missing.len(),
        .missing.join(", "),
        roles_suffix(.roles)
    )]
    FeatureMismatch {
        /// Manifest columns absent from the new data, in manifest order.
        missing: Vec<String>,
        /// Target, date or group columns of the manifest absent from the new data (`role:column`).
        roles: Vec<String>,
        /// Number of manifest columns.
        expected: usize,
        /// `missing.len() / expected`.
        ratio: f64,
        /// Configured tolerance.
        tolerance: f64,
    },
    /// Registry id absent (or present with another kind than requested).
    #[error("registry entry {id} not found{}", .kind.map(|k| format!(" for kind {k}")).unwrap_or_default())]
    RegistryNotFound {
        /// Requested id.
        id: String,
        /// Requested kind, when the lookup was kind-qualified.
        kind: Option<ModelKind>,
    },
    /// Stored model/manifest pairing is invalid.
    #[error("registry entry {id} is corrupt: {reason}")]
    RegistryCorrupt {
        /// Entry id.
        id: String,
        /// What failed verification.
        reason: String,
    },
    /// The target column was requested as a feature.
    #[error("target column {0} cannot be used as a feature")]
    TargetLeakage(String),
    /// Feature spec is not usable.
    #[error("invalid feature spec: {0}")]
    InvalidSpec(String),
    /// Forecast horizon outside the accepted range.
    #[error("invalid horizon {requested}: must be within 1..={max}")]
    InvalidHorizon {
        /// Requested horizon.
        requested: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Column names must be unique within a dataset.
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    /// A referenced column does not exist.
    #[error("unknown column {0}")]
    UnknownColumn(String),
    /// Data quality gate rejected the dataset.
    #[error("data quality {score:.2} below required {required:.2}")]
    DataQuality {
        /// Computed quality score.
        score: f64,
        /// Configured minimum.
        required: f64,
    },
    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
    /// Provider failure outside of batch training (prediction time).
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// TOML decoding error.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    /// Stable short code, used in logs and CLI exit messages.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InsufficientData { .. } => "insufficient_data",
            Self::SchemaAmbiguous(_) => "schema_ambiguous",
            Self::ModelFitFailure { .. } => "model_fit_failure",
            Self::FeatureMismatch { .. } => "feature_mismatch",
            Self::RegistryNotFound { .. } => "registry_not_found",
            Self::RegistryCorrupt { .. } => "registry_corrupt",
            Self::TargetLeakage(_) => "target_leakage",
            Self::InvalidSpec(_) => "invalid_spec",
            Self::InvalidHorizon { .. } => "invalid_horizon",
            Self::DuplicateColumn(_) => "duplicate_column",
            Self::UnknownColumn(_) => "unknown_column",
            Self::DataQuality { .. } => "data_quality",
            Self::Config(_) | Self::Toml(_) => "config",
            Self::Provider(_) => "provider",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

fn roles_suffix(roles: &[String]) -> String {
    if roles.is_empty() {
        String::new()
    } else {
        format!("; missing roles: {}", roles.join(", "))
    }
}
