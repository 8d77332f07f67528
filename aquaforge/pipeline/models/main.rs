//! Model capability providers and the kind catalogue.

/// Boosted regression stumps.
pub mod boosting;
/// Closed-form ridge regression.
pub mod ridge;
/// Seasonal naive series model.
pub mod seasonal;

use std::{fmt, str::FromStr, sync::Arc};

use indexmap::IndexMap;
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelConfig;

pub use boosting::GradientBoostingProvider;
pub use ridge::RidgeProvider;
pub use seasonal::SeasonalNaiveProvider;

/// Model kinds known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Repeats the last observed season of the raw target series.
    SeasonalNaive,
    /// Ridge regression on manifest features.
    Ridge,
    /// Gradient-boosted stumps on manifest features.
    GradientBoosting,
}

/// Whether a kind consumes manifest features or the raw series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    /// Fit and predict on the derived feature matrix.
    ManifestFeatures,
    /// Fit and forecast on the raw target series per group.
    NativeSeries,
}

impl ModelKind {
    /// Every kind, simplest first.
    pub const ALL: [Self; 3] = [Self::SeasonalNaive, Self::Ridge, Self::GradientBoosting];

    /// Declared capability.
    #[must_use]
    pub const fn capability(self) -> ModelCapability {
        match self {
            Self::SeasonalNaive => ModelCapability::NativeSeries,
            Self::Ridge | Self::GradientBoosting => ModelCapability::ManifestFeatures,
        }
    }

    /// Lower is simpler/faster; breaks ties during best-model selection.
    #[must_use]
    pub const fn complexity_rank(self) -> u8 {
        match self {
            Self::SeasonalNaive => 0,
            Self::Ridge => 1,
            Self::GradientBoosting => 2,
        }
    }

    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SeasonalNaive => "seasonal_naive",
            Self::Ridge => "ridge",
            Self::GradientBoosting => "gradient_boosting",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = ProviderError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| ProviderError::InvalidInput(format!("unknown model kind {raw}")))
    }
}

/// Failures reported by providers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider does not implement the requested capability.
    #[error("{kind} does not support {operation}")]
    Unsupported {
        /// Provider kind.
        kind: ModelKind,
        /// Operation name.
        operation: &'static str,
    },
    /// Inputs are unusable (shape, size, stored state).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The fit did not converge or produced non-finite values.
    #[error("numerical failure: {0}")]
    Numerical(String),
}

/// Opaque fitted parameters, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FittedState(pub serde_json::Value);

impl FittedState {
    /// Encodes typed parameters.
    pub fn encode<T: Serialize>(params: &T) -> Result<Self, ProviderError> {
        serde_json::to_value(params)
            .map(Self)
            .map_err(|err| ProviderError::InvalidInput(format!("encoding state: {err}")))
    }

    /// Decodes typed parameters.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProviderError> {
        serde_json::from_value(self.0.clone())
            .map_err(|err| ProviderError::InvalidInput(format!("decoding state: {err}")))
    }
}

/// Capability interface every model kind implements.
pub trait ModelProvider: Send + Sync {
    /// Kind served by this provider.
    fn kind(&self) -> ModelKind;

    /// Fits on a feature matrix.
    fn fit(
        &self,
        features: ArrayView2<'_, f64>,
        target: ArrayView1<'_, f64>,
    ) -> Result<FittedState, ProviderError> {
        let _ = (features, target);
        Err(ProviderError::Unsupported {
            kind: self.kind(),
            operation: "fit",
        })
    }

    /// Predicts one value per matrix row.
    fn predict(
        &self,
        state: &FittedState,
        features: ArrayView2<'_, f64>,
    ) -> Result<Array1<f64>, ProviderError> {
        let _ = (state, features);
        Err(ProviderError::Unsupported {
            kind: self.kind(),
            operation: "predict",
        })
    }

    /// Fits on a raw target series.
    fn fit_series(&self, series: &[f64]) -> Result<FittedState, ProviderError> {
        let _ = series;
        Err(ProviderError::Unsupported {
            kind: self.kind(),
            operation: "fit_series",
        })
    }

    /// Forecasts `horizon` values following `history`.
    fn forecast_series(
        &self,
        state: &FittedState,
        history: &[f64],
        horizon: usize,
    ) -> Result<Vec<f64>, ProviderError> {
        let _ = (state, history, horizon);
        Err(ProviderError::Unsupported {
            kind: self.kind(),
            operation: "forecast_series",
        })
    }
}

/// Providers keyed by kind.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: IndexMap<ModelKind, Arc<dyn ModelProvider>>,
}

impl fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSet")
            .field("kinds", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderSet {
    /// Built-in providers for every kind.
    #[must_use]
    pub fn builtin(config: &ModelConfig) -> Self {
        let mut set = Self::default();
        set.register(Arc::new(SeasonalNaiveProvider::new(config.season_length)));
        set.register(Arc::new(RidgeProvider::new(config.ridge_lambda)));
        set.register(Arc::new(GradientBoostingProvider::new(
            config.boosting_rounds,
            config.boosting_learning_rate,
            config.boosting_max_splits,
        )));
        set
    }

    /// Adds or replaces the provider for its kind.
    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Provider for a kind.
    #[must_use]
    pub fn get(&self, kind: ModelKind) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Registered kinds, in registration order.
    #[must_use]
    pub fn kinds(&self) -> Vec<ModelKind> {
        self.providers.keys().copied().collect()
    }
}

pub(crate) fn check_shapes(
    features: ArrayView2<'_, f64>,
    target: ArrayView1<'_, f64>,
) -> Result<(), ProviderError> {
    if features.nrows() == 0 {
        return Err(ProviderError::InvalidInput("empty training matrix".into()));
    }
    if features.nrows() != target.len() {
        return Err(ProviderError::InvalidInput(format!(
            "{} feature rows but {} targets",
            features.nrows(),
            target.len()
        )));
    }
    if features.iter().chain(target.iter()).any(|value| !value.is_finite()) {
        return Err(ProviderError::InvalidInput("non-finite training value".into()));
    }
    Ok(())
}
