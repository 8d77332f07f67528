use serde::{Deserialize, Serialize};

use super::{FittedState, ModelKind, ModelProvider, ProviderError};

/// Native series model: each future step repeats the value one season earlier.
#[derive(Debug, Clone)]
pub struct SeasonalNaiveProvider {
    season_length: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeasonalParams {
    season_length: usize,
    level: f64,
}

impl SeasonalNaiveProvider {
    /// Creates a provider with the season length in rows.
    #[must_use]
    pub fn new(season_length: usize) -> Self {
        Self {
            season_length: season_length.max(1),
        }
    }
}

impl ModelProvider for SeasonalNaiveProvider {
    fn kind(&self) -> ModelKind {
        ModelKind::SeasonalNaive
    }

    fn fit_series(&self, series: &[f64]) -> Result<FittedState, ProviderError> {
        if series.is_empty() {
            return Err(ProviderError::InvalidInput("empty series".into()));
        }
        if series.iter().any(|value| !value.is_finite()) {
            return Err(ProviderError::InvalidInput("non-finite series value".into()));
        }
        let season_length = if series.len() >= self.season_length {
            self.season_length
        } else {
            1
        };
        FittedState::encode(&SeasonalParams {
            season_length,
            level: series.iter().sum::<f64>() / series.len() as f64,
        })
    }

    fn forecast_series(
        &self,
        state: &FittedState,
        history: &[f64],
        horizon: usize,
    ) -> Result<Vec<f64>, ProviderError> {
        let params: SeasonalParams = state.decode()?;
        if history.is_empty() {
            return Ok(vec![params.level; horizon]);
        }
        let season = params.season_length.clamp(1, history.len());
        let last_season = &history[history.len() - season..];
        Ok((0..horizon).map(|step| last_season[step % season]).collect())
    }
}
