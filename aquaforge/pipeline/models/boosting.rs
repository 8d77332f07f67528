use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{check_shapes, FittedState, ModelKind, ModelProvider, ProviderError};

/// Gradient boosting with depth-one trees under squared loss.
#[derive(Debug, Clone)]
pub struct GradientBoostingProvider {
    rounds: usize,
    learning_rate: f64,
    max_splits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stump {
    feature: usize,
    threshold: f64,
    left: f64,
    right: f64,
}

impl Stump {
    fn predict(&self, row: ArrayView1<'_, f64>) -> f64 {
        if row[self.feature] <= self.threshold {
            self.left
        } else {
            self.right
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BoostedParams {
    width: usize,
    base: f64,
    learning_rate: f64,
    stumps: Vec<Stump>,
}

impl GradientBoostingProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new(rounds: usize, learning_rate: f64, max_splits: usize) -> Self {
        Self {
            rounds,
            learning_rate: learning_rate.clamp(1e-4, 1.0),
            max_splits: max_splits.max(1),
        }
    }

    fn candidate_thresholds(&self, column: ArrayView1<'_, f64>) -> Vec<f64> {
        let mut sorted: Vec<f64> = column.to_vec();
        sorted.sort_by(f64::total_cmp);
        sorted.dedup();
        if sorted.len() < 2 {
            return Vec::new();
        }
        let midpoints: Vec<f64> = sorted.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
        if midpoints.len() <= self.max_splits {
            return midpoints;
        }
        let mut picked: Vec<f64> = (1..=self.max_splits)
            .map(|step| midpoints[step * (midpoints.len() - 1) / self.max_splits])
            .collect();
        picked.dedup();
        picked
    }

    fn best_stump(
        features: ArrayView2<'_, f64>,
        residuals: &Array1<f64>,
        thresholds: &[Vec<f64>],
    ) -> Option<Stump> {
        let total: f64 = residuals.sum();
        let n = residuals.len() as f64;
        let mut best: Option<(f64, Stump)> = None;
        for (feature, candidates) in thresholds.iter().enumerate() {
            let column = features.column(feature);
            for threshold in candidates {
                let (mut left_sum, mut left_n) = (0.0, 0.0);
                for (value, residual) in column.iter().zip(residuals.iter()) {
                    if value <= threshold {
                        left_sum += residual;
                        left_n += 1.0;
                    }
                }
                let right_n = n - left_n;
                if left_n == 0.0 || right_n == 0.0 {
                    continue;
                }
                let right_sum = total - left_sum;
                // squared-error reduction of splitting at this threshold
                let gain = left_sum * left_sum / left_n + right_sum * right_sum / right_n;
                if best.as_ref().map_or(true, |(current, _)| gain > *current) {
                    best = Some((
                        gain,
                        Stump {
                            feature,
                            threshold: *threshold,
                            left: left_sum / left_n,
                            right: right_sum / right_n,
                        },
                    ));
                }
            }
        }
        best.map(|(_, stump)| stump)
    }
}

impl ModelProvider for GradientBoostingProvider {
    fn kind(&self) -> ModelKind {
        ModelKind::GradientBoosting
    }

    fn fit(
        &self,
        features: ArrayView2<'_, f64>,
        target: ArrayView1<'_, f64>,
    ) -> Result<FittedState, ProviderError> {
        check_shapes(features, target)?;
        let base = target.sum() / target.len() as f64;
        let thresholds: Vec<Vec<f64>> = features
            .axis_iter(Axis(1))
            .map(|column| self.candidate_thresholds(column))
            .collect();
        let mut fitted = Array1::from_elem(target.len(), base);
        let mut stumps = Vec::with_capacity(self.rounds);
        for _ in 0..self.rounds {
            let residuals = &target - &fitted;
            if residuals.iter().all(|r| r.abs() < 1e-12) {
                break;
            }
            let Some(stump) = Self::best_stump(features, &residuals, &thresholds) else {
                break;
            };
            for (idx, row) in features.axis_iter(Axis(0)).enumerate() {
                fitted[idx] += self.learning_rate * stump.predict(row);
            }
            stumps.push(stump);
        }
        if fitted.iter().any(|value| !value.is_finite()) {
            return Err(ProviderError::Numerical("boosting diverged".into()));
        }
        FittedState::encode(&BoostedParams {
            width: features.ncols(),
            base,
            learning_rate: self.learning_rate,
            stumps,
        })
    }

    fn predict(
        &self,
        state: &FittedState,
        features: ArrayView2<'_, f64>,
    ) -> Result<Array1<f64>, ProviderError> {
        let params: BoostedParams = state.decode()?;
        if features.ncols() != params.width {
            return Err(ProviderError::InvalidInput(format!(
                "model expects {} features, got {}",
                params.width,
                features.ncols()
            )));
        }
        Ok(features.map_axis(Axis(1), |row| {
            params.base
                + params
                    .stumps
                    .iter()
                    .map(|stump| params.learning_rate * stump.predict(row))
                    .sum::<f64>()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn fits_a_step_function() {
        let features = Array2::from_shape_fn((40, 1), |(row, _)| row as f64);
        let target = features.map_axis(Axis(1), |row| if row[0] < 20.0 { 1.0 } else { 9.0 });
        let provider = GradientBoostingProvider::new(200, 0.3, 8);
        let state = provider.fit(features.view(), target.view()).unwrap();
        let predicted = provider.predict(&state, features.view()).unwrap();
        assert!((predicted[0] - 1.0).abs() < 0.1);
        assert!((predicted[39] - 9.0).abs() < 0.1);
    }

    #[test]
    fn same_input_same_state() {
        let features = Array2::from_shape_fn((30, 2), |(row, col)| (row * (col + 1)) as f64);
        let target = features.map_axis(Axis(1), |row| row[0] * 0.5 + row[1]);
        let provider = GradientBoostingProvider::new(20, 0.1, 4);
        let a = provider.fit(features.view(), target.view()).unwrap();
        let b = provider.fit(features.view(), target.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn constant_features_predict_the_mean() {
        let features = Array2::from_elem((5, 1), 2.0);
        let target = Array1::from(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let provider = GradientBoostingProvider::new(10, 0.1, 4);
        let state = provider.fit(features.view(), target.view()).unwrap();
        let predicted = provider.predict(&state, features.view()).unwrap();
        assert!((predicted[2] - 3.0).abs() < 1e-9);
    }
}
