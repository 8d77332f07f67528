use serde::{Deserialize, Serialize};

/// Holdout scores of one fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Mean absolute error.
    pub mae: f64,
    /// Mean squared error.
    pub mse: f64,
    /// Root mean squared error.
    pub rmse: f64,
    /// Coefficient of determination.
    pub r2: f64,
    /// Mean absolute percentage error over non-zero actuals; unset when every actual is zero.
    pub mape: Option<f64>,
    /// Symmetric MAPE, in percent.
    pub smape: f64,
    /// Standard deviation of the holdout residuals.
    pub residual_std: f64,
    /// Rows scored.
    pub holdout_rows: usize,
}

impl Metrics {
    /// Scores predictions against actuals. Returns `None` for empty or unequal inputs.
    #[must_use]
    pub fn compute(actual: &[f64], predicted: &[f64]) -> Option<Self> {
        if actual.is_empty() || actual.len() != predicted.len() {
            return None;
        }
        let n = actual.len() as f64;
        let errors: Vec<f64> = actual.iter().zip(predicted).map(|(y, p)| y - p).collect();
        let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n;
        let mse = errors.iter().map(|e| e * e).sum::<f64>() / n;

        let mean = actual.iter().sum::<f64>() / n;
        let ss_tot: f64 = actual.iter().map(|y| (y - mean).powi(2)).sum();
        let ss_res: f64 = errors.iter().map(|e| e * e).sum();
        let r2 = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };

        let pct: Vec<f64> = actual
            .iter()
            .zip(&errors)
            .filter(|(y, _)| **y != 0.0)
            .map(|(y, e)| (e / y).abs() * 100.0)
            .collect();
        let mape = (!pct.is_empty()).then(|| pct.iter().sum::<f64>() / pct.len() as f64);

        let smape = actual
            .iter()
            .zip(predicted)
            .map(|(y, p)| {
                let denom = y.abs() + p.abs();
                if denom == 0.0 {
                    0.0
                } else {
                    200.0 * (y - p).abs() / denom
                }
            })
            .sum::<f64>()
            / n;

        let mean_error = errors.iter().sum::<f64>() / n;
        let residual_std = if errors.len() > 1 {
            (errors.iter().map(|e| (e - mean_error).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            errors[0].abs()
        };

        Some(Self {
            mae,
            mse,
            rmse: mse.sqrt(),
            r2,
            mape,
            smape,
            residual_std,
            holdout_rows: actual.len(),
        })
    }

    /// True when every score is a finite number.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        [self.mae, self.mse, self.rmse, self.r2, self.smape, self.residual_std]
            .iter()
            .chain(self.mape.iter())
            .all(|value| value.is_finite())
    }
}

/// Metric ranking candidate models; lower is better for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryMetric {
    /// Mean absolute error.
    Mae,
    /// Root mean squared error.
    #[default]
    Rmse,
    /// Symmetric MAPE.
    Smape,
}

impl PrimaryMetric {
    /// Extracts the metric value.
    #[must_use]
    pub const fn value(self, metrics: &Metrics) -> f64 {
        match self {
            Self::Mae => metrics.mae,
            Self::Rmse => metrics.rmse,
            Self::Smape => metrics.smape,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_known_errors() {
        let metrics = Metrics::compute(&[1.0, 2.0, 3.0, 4.0], &[1.0, 2.0, 3.0, 6.0]).unwrap();
        assert!((metrics.mae - 0.5).abs() < 1e-12);
        assert!((metrics.mse - 1.0).abs() < 1e-12);
        assert!((metrics.rmse - 1.0).abs() < 1e-12);
        assert!((metrics.mape.unwrap() - 12.5).abs() < 1e-12);
        assert!(metrics.r2 < 1.0);
        assert_eq!(metrics.holdout_rows, 4);
        assert!(metrics.is_finite());
    }

    #[test]
    fn zero_actuals_leave_mape_unset() {
        let metrics = Metrics::compute(&[0.0, 0.0], &[0.0, 0.0]).unwrap();
        assert_eq!(metrics.mape, None);
        assert_eq!(metrics.smape, 0.0);
        assert_eq!(metrics.r2, 1.0);
    }

    #[test]
    fn rejects_mismatched_inputs() {
        assert!(Metrics::compute(&[], &[]).is_none());
        assert!(Metrics::compute(&[1.0], &[1.0, 2.0]).is_none());
    }
}
